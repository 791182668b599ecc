use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use futures_util::FutureExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{ItemUpdate, Job, JobError, JobSnapshot, JobType, ProgressBroadcaster, ProgressEvent};
use crate::config::Config;
use crate::extractors::{DownloadedMedia, ExtractorRegistry, Platform};
use crate::transcribe::{PipelineError, PipelineEvent, ProgressSink, TranscriptionPipeline};

/// Item progress once the audio has been fetched
const DOWNLOADED_PROGRESS: u8 = 50;

/// Where job items get their audio from
#[async_trait]
pub trait AudioSource: Send + Sync {
    /// Fetch `input` into `dest_dir`; the written file belongs to the caller
    async fn fetch(&self, input: &str, dest_dir: &Path) -> anyhow::Result<DownloadedMedia>;
}

#[async_trait]
impl AudioSource for ExtractorRegistry {
    async fn fetch(&self, input: &str, dest_dir: &Path) -> anyhow::Result<DownloadedMedia> {
        ExtractorRegistry::fetch(self, input, dest_dir).await
    }
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Items processed at the same time
    pub max_concurrent_items: usize,
    /// Where kept audio is written
    pub output_dir: Option<PathBuf>,
    /// Keep audio for transcribe jobs too
    pub keep_audio: bool,
    /// Parent of the per-job scratch directory
    pub temp_dir: Option<PathBuf>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_items: 3,
            output_dir: None,
            keep_audio: false,
            temp_dir: None,
        }
    }
}

impl RunnerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrent_items: config.app.max_concurrent_jobs.max(1),
            output_dir: config.app.output_dir.clone(),
            keep_audio: config.app.keep_audio,
            temp_dir: config.app.temp_dir.clone(),
        }
    }
}

/// Drives a job's items through download, transcription and completion,
/// publishing progress as it goes.
pub struct JobRunner {
    source: Arc<dyn AudioSource>,
    pipeline: Option<Arc<TranscriptionPipeline>>,
    broadcaster: Arc<ProgressBroadcaster>,
    settings: RunnerSettings,
}

impl JobRunner {
    pub fn new(
        source: Arc<dyn AudioSource>,
        pipeline: Arc<TranscriptionPipeline>,
        broadcaster: Arc<ProgressBroadcaster>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            source,
            pipeline: Some(pipeline),
            broadcaster,
            settings,
        }
    }

    /// Runner for download jobs, which never need an API client
    pub fn download_only(
        source: Arc<dyn AudioSource>,
        broadcaster: Arc<ProgressBroadcaster>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            source,
            pipeline: None,
            broadcaster,
            settings,
        }
    }

    pub fn broadcaster(&self) -> &Arc<ProgressBroadcaster> {
        &self.broadcaster
    }

    /// Run every item of `job` and return its final state.
    ///
    /// Item failures are recorded on the item; they never abort the job.
    pub async fn run(&self, job: Arc<Job>) -> Result<JobSnapshot, JobError> {
        job.start().await?;
        let job_id = job.id().to_string();
        self.broadcaster
            .publish(&job_id, ProgressEvent::Update(job.snapshot().await))
            .await;

        let item_count = job.item_count().await;
        tracing::info!(
            "Starting job {} ({}, {} items, {} at a time)",
            job_id,
            job.job_type(),
            item_count,
            self.settings.max_concurrent_items
        );

        match self.work_dir() {
            Ok(work_dir) => {
                stream::iter(0..item_count)
                    .map(|index| {
                        let job = job.clone();
                        let dir = work_dir.path().to_path_buf();
                        async move { self.process_item(&job, index, &dir).await }.boxed()
                    })
                    .buffer_unordered(self.settings.max_concurrent_items.max(1))
                    .collect::<Vec<()>>()
                    .await;
            }
            Err(e) => {
                let message = format!("Failed to create working directory: {}", e);
                tracing::error!("{}", message);
                for index in 0..item_count {
                    self.apply(&job, index, ItemUpdate::failed(message.clone())).await;
                }
            }
        }

        // Stopped through the token alone (e.g. manager shutdown): items left
        // unfinished would otherwise leave the job running forever
        if job.cancel_token().is_cancelled() {
            job.cancel().await;
        }

        let snapshot = job.snapshot().await;
        tracing::info!(
            "Job {} finished {}: {} completed, {} failed",
            job_id,
            snapshot.status,
            snapshot.completed_count,
            snapshot.failed_count
        );

        self.broadcaster
            .publish(&job_id, ProgressEvent::finished(snapshot.clone()))
            .await;
        self.broadcaster.close(&job_id).await;

        Ok(snapshot)
    }

    async fn process_item(&self, job: &Job, index: usize, work_dir: &Path) {
        let cancel = job.cancel_token();
        if cancel.is_cancelled() {
            return;
        }

        let Some(item) = job.item(index).await else {
            return;
        };

        self.apply(job, index, ItemUpdate::progress(0)).await;

        let item_dir = work_dir.join(format!("item_{:03}", index));
        if let Err(e) = tokio::fs::create_dir_all(&item_dir).await {
            self.apply(job, index, ItemUpdate::failed(format!("Failed to prepare download: {}", e)))
                .await;
            return;
        }

        let fetched = tokio::select! {
            result = self.source.fetch(&item.url, &item_dir) => result,
            _ = cancel.cancelled() => return,
        };

        let media = match fetched {
            Ok(media) => media,
            Err(e) => {
                tracing::warn!("Download failed for {}: {:#}", item.url, e);
                self.apply(job, index, ItemUpdate::failed(format!("Download failed: {:#}", e)))
                    .await;
                return;
            }
        };

        self.apply(
            job,
            index,
            ItemUpdate::progress(DOWNLOADED_PROGRESS).with_title(media.title.clone()),
        )
        .await;

        if cancel.is_cancelled() {
            return;
        }

        let outcome = match job.job_type() {
            JobType::Download => match self.preserve_audio(&media).await {
                Ok(path) => ItemUpdate::completed(None).with_audio_path(Some(path)),
                Err(e) => ItemUpdate::failed(format!("Failed to save audio: {:#}", e)),
            },
            job_type => self.transcribe_item(job, index, &media, job_type).await,
        };

        // Cancellation mid-transcription leaves the item to Job::cancel
        if !cancel.is_cancelled() {
            self.apply(job, index, outcome).await;
        }

        if let Err(e) = tokio::fs::remove_dir_all(&item_dir).await {
            tracing::debug!("Could not remove {}: {}", item_dir.display(), e);
        }
    }

    async fn transcribe_item(
        &self,
        job: &Job,
        index: usize,
        media: &DownloadedMedia,
        job_type: JobType,
    ) -> ItemUpdate {
        let Some(pipeline) = self.pipeline.as_deref() else {
            return ItemUpdate::failed("Transcription is not available for download-only runs");
        };
        let (sink, rx) = ProgressSink::channel();
        let cancel = job.cancel_token();
        let asset = &media.asset;
        let language = job.language();

        let transcribe = async move {
            let result = pipeline.transcribe(asset, language, cancel, &sink).await;
            // Closing the channel ends the forwarding loop
            drop(sink);
            result
        };
        let (result, ()) = tokio::join!(transcribe, self.forward_chunk_progress(job, index, rx));

        match result {
            Ok(transcription) => {
                let text = match (media.platform, &media.title, &media.video_id) {
                    (Platform::Youtube, Some(title), Some(video_id)) => {
                        format!("{}{}", youtube_header(title, &media.source, video_id), transcription.text)
                    }
                    _ => transcription.text,
                };

                let keep = job_type == JobType::Full && (self.settings.keep_audio || self.settings.output_dir.is_some());
                let audio_path = if keep {
                    match self.preserve_audio(media).await {
                        Ok(path) => Some(path),
                        Err(e) => {
                            tracing::warn!("Transcribed but could not keep audio: {:#}", e);
                            None
                        }
                    }
                } else {
                    None
                };

                ItemUpdate::completed(Some(text)).with_audio_path(audio_path)
            }
            Err(PipelineError::Cancelled) => ItemUpdate::failed("Cancelled"),
            Err(e) => {
                tracing::warn!("Transcription failed for {}: {}", media.source, e);
                ItemUpdate::failed(format!("Transcription failed: {}", e))
            }
        }
    }

    /// Map chunk completions onto the transcription half of the item's progress
    async fn forward_chunk_progress(&self, job: &Job, index: usize, mut rx: mpsc::UnboundedReceiver<PipelineEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                PipelineEvent::ChunkProgress { completed, total, .. } if total > 0 => {
                    let share = (completed.min(total) * 50 / total) as u8;
                    // 100 is reserved for the completed transition
                    let progress = (DOWNLOADED_PROGRESS + share).min(99);
                    self.apply(job, index, ItemUpdate::progress(progress)).await;
                }
                PipelineEvent::Update { stage, message } => {
                    tracing::debug!("Item {} {:?}: {}", index, stage, message);
                }
                _ => {}
            }
        }
    }

    /// Copy the fetched audio into the output directory
    async fn preserve_audio(&self, media: &DownloadedMedia) -> anyhow::Result<PathBuf> {
        let dir = match &self.settings.output_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };
        tokio::fs::create_dir_all(&dir).await?;

        let stem = media
            .title
            .as_deref()
            .map(crate::utils::sanitize_filename)
            .unwrap_or_else(|| format!("audio_{}", chrono::Utc::now().format("%Y%m%d_%H%M%S")));
        let output_path = dir.join(format!("{}.{}", stem, media.asset.format.as_str()));

        tokio::fs::copy(&media.asset.path, &output_path).await?;
        tracing::info!("Saved audio to {}", output_path.display());
        Ok(output_path)
    }

    async fn apply(&self, job: &Job, index: usize, update: ItemUpdate) {
        match job.update_item(index, update).await {
            Ok(progress) => {
                self.broadcaster
                    .publish(job.id(), ProgressEvent::ItemUpdate(progress))
                    .await
            }
            Err(e) => tracing::debug!("Ignoring update for job {} item {}: {}", job.id(), index, e),
        }
    }

    fn work_dir(&self) -> std::io::Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("multifetch_job_");
        match &self.settings.temp_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                builder.tempdir_in(dir)
            }
            None => builder.tempdir(),
        }
    }
}

fn youtube_header(title: &str, url: &str, video_id: &str) -> String {
    format!(
        "Video Title: {}\nYouTube URL: {}\nVideo ID: {}\n{}\n\n",
        title,
        url,
        video_id,
        "-".repeat(80)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioAsset, AudioFormat};
    use crate::chunking::testing::FakeEncoder;
    use crate::jobs::{JobItem, JobStatus, SseFrame};
    use crate::transcribe::pool::testing::EchoClient;
    use crate::transcribe::{PipelineSettings, Tier};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    /// Writes the URL's last path segment as the audio content
    struct FakeSource {
        minutes: u64,
    }

    #[async_trait]
    impl AudioSource for FakeSource {
        async fn fetch(&self, input: &str, dest_dir: &Path) -> anyhow::Result<DownloadedMedia> {
            if input.contains("broken") {
                anyhow::bail!("HTTP 404");
            }
            let name = input.rsplit('/').next().unwrap_or("audio").to_string();
            let path = dest_dir.join(format!("{}.mp3", name));
            tokio::fs::write(&path, format!("words from {}", name)).await?;

            Ok(DownloadedMedia {
                asset: AudioAsset::new(path, self.minutes * 60_000, 1024 * 1024, AudioFormat::Mp3),
                platform: Platform::Youtube,
                title: Some(format!("Title {}", name)),
                video_id: Some(name),
                uploader: None,
                source: input.to_string(),
            })
        }
    }

    fn runner(settings: RunnerSettings) -> JobRunner {
        runner_for_minutes(5, settings)
    }

    fn runner_for_minutes(minutes: u64, settings: RunnerSettings) -> JobRunner {
        let pipeline = TranscriptionPipeline::new(
            Arc::new(EchoClient::default()),
            Arc::new(FakeEncoder { fail_at: None }),
            PipelineSettings::for_tier(Tier::Free),
        );
        JobRunner::new(
            Arc::new(FakeSource { minutes }),
            Arc::new(pipeline),
            Arc::new(ProgressBroadcaster::new()),
            settings,
        )
    }

    fn job(job_type: JobType, urls: &[&str]) -> Arc<Job> {
        let items = urls
            .iter()
            .map(|url| JobItem::new(*url, Some(Platform::Youtube), None))
            .collect();
        Arc::new(Job::new("run00001", job_type, "en", items, CancellationToken::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_failure_completes_job() {
        let runner = runner(RunnerSettings::default());
        let job = job(JobType::Transcribe, &["https://youtu.be/aaaaaaaaaaa", "https://youtu.be/broken00000"]);

        let snapshot = runner.run(job).await.unwrap();

        assert_eq!(snapshot.status, JobStatus::Completed);
        assert_eq!(snapshot.progress, 50);
        let ok = &snapshot.items[0];
        assert_eq!(ok.status, JobStatus::Completed);
        assert_eq!(ok.title.as_deref(), Some("Title aaaaaaaaaaa"));
        let transcript = ok.transcript.as_deref().unwrap();
        assert!(transcript.starts_with("Video Title: Title aaaaaaaaaaa\n"));
        assert!(transcript.ends_with("words from aaaaaaaaaaa"));
        assert!(ok.audio_path.is_none());

        let failed = &snapshot.items[1];
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.progress, 0);
        assert!(failed.error.as_deref().unwrap().contains("HTTP 404"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_end_with_error_when_all_fail() {
        let runner = runner(RunnerSettings::default());
        let job = job(JobType::Full, &["https://youtu.be/broken00000"]);
        let sub = runner.broadcaster().subscribe(&job).await;

        let snapshot = runner.run(job).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Failed);

        let names: Vec<&str> = sub
            .into_stream()
            .filter_map(|frame| async move {
                match frame {
                    SseFrame::Event(event) => Some(event.event_name()),
                    SseFrame::Keepalive => None,
                }
            })
            .collect()
            .await;
        assert_eq!(names.first(), Some(&"update"));
        assert_eq!(names.last(), Some(&"error"));
        assert!(names.contains(&"item_update"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_job_keeps_audio() {
        let out = TempDir::new().unwrap();
        let runner = runner(RunnerSettings {
            output_dir: Some(out.path().to_path_buf()),
            ..Default::default()
        });
        let job = job(JobType::Download, &["https://youtu.be/ccccccccccc"]);

        let snapshot = runner.run(job).await.unwrap();

        let item = &snapshot.items[0];
        assert_eq!(item.status, JobStatus::Completed);
        assert!(item.transcript.is_none());
        let saved = item.audio_path.clone().unwrap();
        assert_eq!(saved, out.path().join("Title ccccccccccc.mp3"));
        assert_eq!(std::fs::read_to_string(saved).unwrap(), "words from ccccccccccc");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_job_stays_cancelled() {
        let runner = runner(RunnerSettings::default());
        let job = job(JobType::Full, &["https://youtu.be/aaaaaaaaaaa", "https://youtu.be/bbbbbbbbbbb"]);
        job.cancel().await;

        let err = runner.run(job.clone()).await.unwrap_err();
        assert_eq!(err, JobError::NotPending(JobStatus::Cancelled));
        assert_eq!(job.status().await, JobStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_item_concurrency_is_bounded() {
        let runner = runner(RunnerSettings {
            max_concurrent_items: 1,
            ..Default::default()
        });
        let urls: Vec<String> = (0..4).map(|i| format!("https://youtu.be/item{i:07}")).collect();
        let url_refs: Vec<&str> = urls.iter().map(String::as_str).collect();
        let job = job(JobType::Transcribe, &url_refs);
        let mut sub = runner.broadcaster().subscribe(&job).await;

        let handle = tokio::spawn({
            let job = job.clone();
            async move { runner.run(job).await }
        });

        // With one item at a time, an item only starts after the previous one finished
        let mut running: Option<usize> = None;
        while let Some(frame) = sub.next().await {
            if let SseFrame::Event(ProgressEvent::ItemUpdate(item)) = frame {
                match item.status {
                    JobStatus::Running => {
                        assert!(running.map_or(true, |i| i == item.index), "two items running at once");
                        running = Some(item.index);
                    }
                    _ => running = None,
                }
            }
        }

        let snapshot = handle.await.unwrap().unwrap();
        assert_eq!(snapshot.completed_count, 4);
        assert_eq!(snapshot.progress, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_only_runner_cannot_transcribe() {
        let runner = JobRunner::download_only(
            Arc::new(FakeSource { minutes: 1 }),
            Arc::new(ProgressBroadcaster::new()),
            RunnerSettings::default(),
        );
        let snapshot = runner.run(job(JobType::Transcribe, &["https://youtu.be/ddddddddddd"])).await.unwrap();

        assert_eq!(snapshot.status, JobStatus::Failed);
        assert_eq!(snapshot.items[0].title.as_deref(), Some("Title ddddddddddd"));
        assert!(snapshot.items[0].error.as_deref().unwrap().contains("download-only"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunk_progress_maps_onto_second_half() {
        // 40 minutes forces chunking into several pieces
        let runner = runner_for_minutes(40, RunnerSettings::default());
        let job = job(JobType::Transcribe, &["https://youtu.be/eeeeeeeeeee"]);
        let mut sub = runner.broadcaster().subscribe(&job).await;

        let handle = tokio::spawn({
            let job = job.clone();
            async move { runner.run(job).await }
        });

        let mut progress = Vec::new();
        while let Some(frame) = sub.next().await {
            if let SseFrame::Event(ProgressEvent::ItemUpdate(item)) = frame {
                progress.push((item.status, item.progress));
            }
        }
        let snapshot = handle.await.unwrap().unwrap();
        assert_eq!(snapshot.status, JobStatus::Completed);

        assert_eq!(progress.last(), Some(&(JobStatus::Completed, 100)));
        assert!(progress.windows(2).all(|pair| pair[0].1 <= pair[1].1), "progress went backwards: {progress:?}");

        let transcribing: Vec<u8> = progress
            .iter()
            .skip_while(|(_, p)| *p < DOWNLOADED_PROGRESS)
            .filter(|(status, _)| *status == JobStatus::Running)
            .map(|(_, p)| *p)
            .collect();
        assert!(transcribing.iter().all(|p| (50..=99).contains(p)), "{transcribing:?}");
        assert!(transcribing.iter().any(|p| *p > 50 && *p < 99), "no intermediate chunk progress: {transcribing:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_cancellation_ends_cancelled() {
        let runner = runner(RunnerSettings::default());
        let root = CancellationToken::new();
        let items = vec![JobItem::new("https://youtu.be/fffffffffff", Some(Platform::Youtube), None)];
        let job = Arc::new(Job::new("run00002", JobType::Full, "en", items, root.child_token()));
        root.cancel();

        let snapshot = runner.run(job).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Cancelled);
        assert_eq!(snapshot.items[0].status, JobStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_after_manager_shutdown_is_cancelled() {
        let manager = crate::jobs::JobManager::default();
        let job = manager
            .create_job(&["https://youtu.be/dQw4w9WgXcQ".to_string()], JobType::Full, "en")
            .await
            .unwrap()
            .job;
        manager.shutdown().await;

        let err = runner(RunnerSettings::default()).run(job.clone()).await.unwrap_err();
        assert_eq!(err, JobError::NotPending(JobStatus::Cancelled));
        assert_eq!(job.status().await, JobStatus::Cancelled);
        assert_eq!(job.item(0).await.unwrap().status, JobStatus::Cancelled);
    }

    #[test]
    fn test_youtube_header() {
        let header = youtube_header("Talk", "https://youtu.be/x", "x");
        assert!(header.starts_with("Video Title: Talk\nYouTube URL: https://youtu.be/x\nVideo ID: x\n"));
        assert!(header.ends_with(&format!("{}\n\n", "-".repeat(80))));
    }
}
