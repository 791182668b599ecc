use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub mod client;
pub mod error;
pub mod pool;
pub mod progress;
pub mod rate_limiter;
pub mod reassemble;
pub mod retry;
pub mod tier;

pub use client::{GroqClient, TranscriptionClient};
pub use error::{ErrorKind, TranscribeError};
pub use pool::{PoolSettings, TranscriptionWorkerPool};
pub use progress::{PipelineEvent, ProgressSink, Stage};
pub use rate_limiter::RateLimiter;
pub use reassemble::{missing_indices, reassemble, ChunkResult};
pub use retry::RetryPolicy;
pub use tier::{worker_count, Tier, TierLimits};

use crate::audio::AudioAsset;
use crate::chunking::{AudioChunk, ChunkEncoder, ChunkPlanner, ChunkSettings, FfmpegEncoder};
use crate::config::Config;
use tier::{DIRECT_MAX_BYTES, DIRECT_MAX_MS};

/// Everything the pipeline needs to know besides its collaborators
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub tier: Tier,
    pub requests_per_minute: u32,
    pub chunking: ChunkSettings,
    pub pool: PoolSettings,
    /// Parent directory for per-asset chunk directories
    pub temp_dir: Option<PathBuf>,
}

impl PipelineSettings {
    pub fn for_tier(tier: Tier) -> Self {
        Self {
            tier,
            requests_per_minute: 400,
            chunking: ChunkSettings::for_tier(tier),
            pool: PoolSettings::for_tier(tier),
            temp_dir: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let tier = config.api.tier;
        let t = &config.transcription;

        let first_pass = RetryPolicy {
            max_retries: t.max_retries.max(1),
            base_delay: Duration::from_secs(t.base_delay_secs),
            max_delay: Duration::from_secs(t.max_delay_secs),
            ..RetryPolicy::default()
        };
        let retry_pass = first_pass.clone().with_max_retries(t.retry_pass_max_retries.max(1));

        Self {
            tier,
            requests_per_minute: config.api.requests_per_minute,
            chunking: ChunkSettings {
                tier,
                target_bytes: t.chunk_target_mb * 1024 * 1024,
                min_chunk_ms: t.min_chunk_secs * 1000,
                overlap_ms: t.overlap_ms,
                ..ChunkSettings::for_tier(tier)
            },
            pool: PoolSettings {
                tier,
                first_pass,
                retry_pass,
                retry_cooldown: Duration::from_secs(t.retry_cooldown_secs),
            },
            temp_dir: config.app.temp_dir.clone(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("Transcription cancelled")]
    Cancelled,

    #[error("Audio could not be split below the {tier} limit: a single {size_mb:.1}MB chunk remains")]
    ChunkingFailed { size_mb: f64, tier: Tier },

    #[error("No transcript produced ({failed} of {chunks} chunks failed): {reason}")]
    NoTranscript {
        chunks: usize,
        failed: usize,
        reason: String,
    },

    #[error("Failed to prepare chunk directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Finished transcript of one asset
#[derive(Debug, Clone)]
pub struct Transcription {
    pub text: String,
    pub chunk_count: usize,
    /// Chunks that contributed an empty segment
    pub failed_chunks: Vec<usize>,
    pub workers: usize,
    pub chunked: bool,
}

/// Whether an asset has to be split before it can be sent
pub fn needs_chunking(asset: &AudioAsset, tier: Tier) -> bool {
    asset.byte_size > DIRECT_MAX_BYTES
        || asset.duration_ms >= DIRECT_MAX_MS
        || asset.byte_size > tier.limits().advisory_cap_bytes
}

/// Turns one audio asset into text: chunk, transcribe concurrently, reassemble.
///
/// The rate limiter is owned here and shared by every asset this pipeline
/// processes, so concurrent job items draw from the same request budget.
pub struct TranscriptionPipeline {
    planner: ChunkPlanner,
    pool: TranscriptionWorkerPool,
    settings: PipelineSettings,
}

impl TranscriptionPipeline {
    pub fn new(client: Arc<dyn TranscriptionClient>, encoder: Arc<dyn ChunkEncoder>, settings: PipelineSettings) -> Self {
        let limiter = Arc::new(RateLimiter::new(settings.requests_per_minute));
        Self {
            planner: ChunkPlanner::new(encoder, settings.chunking.clone()),
            pool: TranscriptionWorkerPool::new(client, limiter, settings.pool.clone()),
            settings,
        }
    }

    /// Pipeline backed by the Groq API and ffmpeg
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let api_key = config.api_key()?;
        let client = GroqClient::new(&config.api, api_key).context("Failed to create API client")?;

        Ok(Self::new(
            Arc::new(client),
            Arc::new(FfmpegEncoder::new()),
            PipelineSettings::from_config(config),
        ))
    }

    pub fn tier(&self) -> Tier {
        self.settings.tier
    }

    pub async fn transcribe(
        &self,
        asset: &AudioAsset,
        language: &str,
        cancel: &CancellationToken,
        progress: &ProgressSink,
    ) -> Result<Transcription, PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let tier = self.settings.tier;
        if !needs_chunking(asset, tier) {
            tracing::info!(
                "Transcribing {:.1}MB / {:.1} min directly",
                asset.size_mb(),
                asset.duration_minutes()
            );
            progress.emit(PipelineEvent::update(Stage::Transcribing, "Transcribing audio"));

            let chunks = vec![AudioChunk::whole(asset, self.settings.chunking.target_bytes)];
            return self.transcribe_chunks(&chunks, 1, language, cancel, progress, false).await;
        }

        tracing::info!(
            "Audio is {:.1}MB / {:.1} min, splitting for the {}",
            asset.size_mb(),
            asset.duration_minutes(),
            tier
        );
        progress.emit(PipelineEvent::update(Stage::Chunking, "Splitting audio into chunks"));

        let chunk_dir = self.chunk_dir()?;
        let chunks = self.planner.plan(asset, chunk_dir.path()).await;

        if let [only] = chunks.as_slice() {
            if only.byte_size > DIRECT_MAX_BYTES {
                return Err(PipelineError::ChunkingFailed {
                    size_mb: only.size_mb(),
                    tier,
                });
            }
        }

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let workers = worker_count(asset.duration_minutes(), chunks.len(), tier);
        progress.emit(PipelineEvent::update(
            Stage::Transcribing,
            format!("Transcribing {} chunks with {} workers", chunks.len(), workers),
        ));

        // chunk_dir lives until here so retries can still find their files
        let result = self.transcribe_chunks(&chunks, workers, language, cancel, progress, true).await;
        drop(chunk_dir);
        result
    }

    async fn transcribe_chunks(
        &self,
        chunks: &[AudioChunk],
        workers: usize,
        language: &str,
        cancel: &CancellationToken,
        progress: &ProgressSink,
        chunked: bool,
    ) -> Result<Transcription, PipelineError> {
        let results = self.pool.run(chunks, workers, language, cancel, progress).await;

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        progress.emit(PipelineEvent::update(Stage::Reassembling, "Combining transcripts"));
        let failed_chunks = missing_indices(chunks.len(), &results);

        match reassemble(chunks.len(), &results) {
            Some(text) => {
                if !failed_chunks.is_empty() {
                    tracing::warn!(
                        "{} of {} chunks failed and were left empty: {:?}",
                        failed_chunks.len(),
                        chunks.len(),
                        failed_chunks
                    );
                }
                tracing::info!("Transcript assembled - {} words", text.split_whitespace().count());
                progress.emit(PipelineEvent::Complete {
                    chunks: chunks.len(),
                    failed: failed_chunks.len(),
                });

                Ok(Transcription {
                    text,
                    chunk_count: chunks.len(),
                    failed_chunks,
                    workers,
                    chunked,
                })
            }
            None => {
                let reason = results
                    .iter()
                    .find_map(|r| r.error())
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "the service returned no text".to_string());
                let err = PipelineError::NoTranscript {
                    chunks: chunks.len(),
                    failed: failed_chunks.len(),
                    reason,
                };
                progress.emit(PipelineEvent::Error {
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    fn chunk_dir(&self) -> std::io::Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("multifetch_chunks_");
        match &self.settings.temp_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                builder.tempdir_in(dir)
            }
            None => builder.tempdir(),
        }
    }
}
