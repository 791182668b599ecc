use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::jobs::JobType;

#[derive(Parser)]
#[command(
    name = "multifetch",
    about = "Download media from YouTube, Instagram, TikTok or local files and transcribe it",
    version,
    long_about = "Fetches audio with yt-dlp, splits long recordings into size-limited chunks, and transcribes them through a Groq-compatible Whisper API while staying inside the account's rate limits."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable progress indicators
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a job over one or more URLs or local files
    Transcribe {
        /// URLs (YouTube, Instagram, TikTok) or local audio/video files
        #[arg(value_name = "URL_OR_FILE", required = true)]
        inputs: Vec<String>,

        /// Directory for transcripts and kept audio (prints to console if not specified)
        #[arg(short, long, value_name = "DIR")]
        output: Option<PathBuf>,

        /// Output format (defaults to app.default_output_format)
        #[arg(short, long, value_enum)]
        format: Option<OutputFormat>,

        /// Language code for transcription
        #[arg(short, long, value_name = "LANG")]
        language: Option<String>,

        /// What to do with each input
        #[arg(long, value_enum, default_value_t = JobType::Full)]
        job_type: JobType,

        /// Use the dev tier's size ceiling and worker bands
        #[arg(long)]
        dev_tier: bool,

        /// Keep the downloaded audio next to the transcript
        #[arg(long)]
        keep_audio: bool,
    },

    /// Show which platform each URL belongs to
    Detect {
        #[arg(value_name = "URL", required = true)]
        urls: Vec<String>,
    },

    /// Write a default configuration file or show the current one
    Config {
        /// Show current configuration
        #[arg(short, long)]
        show: bool,
    },

    /// List supported platforms
    Platforms,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// Plain text
    Text,
    /// JSON job snapshot
    Json,
}

impl OutputFormat {
    /// Parse a format name from the config file, falling back to text
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            _ => OutputFormat::Text,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Text => "txt",
            OutputFormat::Json => "json",
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_transcribe_args() {
        let cli = Cli::parse_from([
            "multifetch",
            "transcribe",
            "https://youtu.be/dQw4w9WgXcQ",
            "talk.mp3",
            "--job-type",
            "download",
            "-f",
            "json",
            "--dev-tier",
        ]);

        match cli.command {
            Commands::Transcribe {
                inputs,
                format,
                job_type,
                dev_tier,
                ..
            } => {
                assert_eq!(inputs.len(), 2);
                assert_eq!(format, Some(OutputFormat::Json));
                assert_eq!(job_type, JobType::Download);
                assert!(dev_tier);
            }
            _ => panic!("expected transcribe"),
        }
    }

    #[test]
    fn test_format_from_config_name() {
        assert_eq!(OutputFormat::from_name("JSON"), OutputFormat::Json);
        assert_eq!(OutputFormat::from_name("srt"), OutputFormat::Text);
    }
}
