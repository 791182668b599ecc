use anyhow::Result;
use clap::Parser;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use multifetch::cli::{Cli, Commands, OutputFormat};
use multifetch::config::Config;
use multifetch::extractors::{validate_urls, ExtractorRegistry};
use multifetch::jobs::{
    JobManager, JobRunner, JobStatus, JobType, ProgressBroadcaster, ProgressEvent, RunnerSettings, SseFrame,
    Subscription,
};
use multifetch::transcribe::{Tier, TranscriptionPipeline};
use multifetch::{output, utils, MultiFetchError};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    match cli.command {
        Commands::Transcribe {
            inputs,
            output,
            format,
            language,
            job_type,
            dev_tier,
            keep_audio,
        } => {
            warn_missing_dependencies().await;

            let mut config = Config::load().await?;
            if dev_tier {
                config.api.tier = Tier::Dev;
            }
            if keep_audio {
                config.app.keep_audio = true;
            }
            if output.is_some() {
                config.app.output_dir = output.clone();
            }

            let format = format.unwrap_or_else(|| OutputFormat::from_name(&config.app.default_output_format));
            let language = language.unwrap_or_else(|| config.transcription.default_language.clone());

            run_job(&config, inputs, job_type, &language, output, format, cli.quiet).await?;
        }
        Commands::Detect { urls } => {
            for result in validate_urls(&urls) {
                if result.valid {
                    let platform = result.platform.map_or("unknown", |p| p.display_name());
                    match (&result.collection_type, &result.video_id) {
                        (Some(kind), _) => println!("{} -> {} {:?} collection", result.url, platform, kind),
                        (None, Some(id)) => println!("{} -> {} (video {})", result.url, platform, id),
                        (None, None) => println!("{} -> {}", result.url, platform),
                    }
                } else {
                    println!(
                        "{} -> invalid: {}",
                        result.url,
                        result.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
        }
        Commands::Config { show } => {
            let config = Config::load().await?;
            if show {
                config.display();
            } else {
                println!("Configuration file: {}", Config::config_path()?.display());
                println!("Edit it to set api.api_key, or export {}.", multifetch::config::API_KEY_ENV);
            }
        }
        Commands::Platforms => {
            println!("Supported platforms:");
            println!("  • YouTube (youtube.com, youtu.be, shorts, live)");
            println!("  • Instagram (posts and reels)");
            println!("  • TikTok (videos, vm./t/ short links; profiles, hashtags, sounds and collections are detected)");
            println!("  • Local audio files (mp3, m4a, wav, flac, ogg) and video files via ffmpeg");
            println!();
            println!("Extractors: {}", ExtractorRegistry::default().list_platforms().join(", "));
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool, json: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::new("multifetch=debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "multifetch=info".into())
    };

    // Logs go to stderr so transcripts on stdout stay clean
    let json_layer = json.then(|| tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr));
    let text_layer = (!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .init();
}

async fn warn_missing_dependencies() {
    let missing = utils::check_dependencies().await;
    if !missing.is_empty() {
        eprintln!("⚠️  Dependency check warnings:");
        for dep in missing {
            eprintln!("   • {}", dep);
        }
        eprintln!("   (Continuing anyway - tools may be available)");
    }
}

async fn run_job(
    config: &Config,
    inputs: Vec<String>,
    job_type: JobType,
    language: &str,
    output_dir: Option<PathBuf>,
    format: OutputFormat,
    quiet: bool,
) -> Result<()> {
    let manager = Arc::new(JobManager::new(CancellationToken::new()));

    let created = manager.create_job(&inputs, job_type, language).await.map_err(MultiFetchError::from)?;
    for rejected in &created.rejected {
        eprintln!("Skipping {}: {}", rejected.url, rejected.error);
    }
    let job = created.job;

    let source = Arc::new(ExtractorRegistry::new(config.app.cookies_path.clone()));
    let broadcaster = Arc::new(ProgressBroadcaster::new());
    let settings = RunnerSettings::from_config(config);
    let runner = if job_type.transcribes() {
        let pipeline = TranscriptionPipeline::from_config(config)?;
        JobRunner::new(source, Arc::new(pipeline), broadcaster.clone(), settings)
    } else {
        JobRunner::download_only(source, broadcaster.clone(), settings)
    };

    tokio::spawn({
        let manager = manager.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nCancelling...");
                manager.shutdown().await;
            }
        }
    });

    let bars = if quiet {
        None
    } else {
        let subscription = broadcaster.subscribe(&job).await;
        Some(tokio::spawn(render_progress(subscription)))
    };

    let snapshot = runner.run(job).await.map_err(MultiFetchError::from)?;
    if let Some(bars) = bars {
        let _ = bars.await;
    }

    if snapshot.status == JobStatus::Cancelled {
        return Err(MultiFetchError::Interrupted.into());
    }

    match &output_dir {
        Some(dir) => {
            for path in output::save_to_dir(&snapshot, dir, format)? {
                println!("Transcript saved to: {}", path.display());
            }
        }
        None => output::print_to_console(&snapshot, format)?,
    }

    for item in &snapshot.items {
        if let Some(path) = &item.audio_path {
            println!("Audio saved to: {}", path.display());
        }
    }

    if snapshot.status == JobStatus::Failed {
        return Err(MultiFetchError::JobFailed { job_id: snapshot.id }.into());
    }
    Ok(())
}

/// One bar per item, driven by the job's event stream
async fn render_progress(mut subscription: Subscription) {
    let multi = MultiProgress::new();
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    let mut bars: Vec<ProgressBar> = Vec::new();

    while let Some(frame) = subscription.next().await {
        let SseFrame::Event(event) = frame else {
            continue;
        };

        match event {
            ProgressEvent::Update(snapshot) => {
                while bars.len() < snapshot.items.len() {
                    let item = &snapshot.items[bars.len()];
                    let bar = multi.add(ProgressBar::new(100));
                    bar.set_style(style.clone());
                    bar.set_message(item.url.clone());
                    bars.push(bar);
                }
            }
            ProgressEvent::ItemUpdate(item) => {
                let Some(bar) = bars.get(item.index) else {
                    continue;
                };
                bar.set_position(item.progress as u64);
                if let Some(title) = &item.title {
                    bar.set_message(title.clone());
                }
                match item.status {
                    JobStatus::Completed => bar.finish_with_message(format!("✓ {}", item.title.unwrap_or(item.url))),
                    JobStatus::Failed => bar.abandon_with_message(format!(
                        "✗ {}: {}",
                        item.url,
                        item.error.unwrap_or_default()
                    )),
                    _ => {}
                }
            }
            ProgressEvent::Complete(_) | ProgressEvent::Error(_) => {
                for bar in bars.iter().filter(|bar| !bar.is_finished()) {
                    bar.abandon();
                }
            }
        }
    }
}
