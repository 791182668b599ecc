use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod encoder;

pub use encoder::{ChunkEncoder, FfmpegEncoder};

use crate::audio::AudioAsset;
use crate::transcribe::tier::{Tier, CHUNK_TARGET_BYTES};

/// One slice of an audio asset, submitted as a single transcription request
#[derive(Debug, Clone, Serialize)]
pub struct AudioChunk {
    /// Position in the plan, contiguous from 0
    pub index: usize,

    pub start_ms: u64,
    pub end_ms: u64,

    /// Measured size of the encoded chunk
    pub byte_size: u64,

    pub path: PathBuf,

    /// Encoded size came out above the planner's byte target
    pub oversized: bool,

    /// The chunk is the source asset itself and must not be deleted
    pub is_source: bool,
}

impl AudioChunk {
    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }

    pub fn size_mb(&self) -> f64 {
        crate::utils::bytes_to_mb(self.byte_size)
    }

    /// File name reported to the transcription service
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("chunk_{}.mp3", self.index))
    }

    /// The whole asset as a single chunk
    pub fn whole(asset: &AudioAsset, target_bytes: u64) -> Self {
        Self {
            index: 0,
            start_ms: 0,
            end_ms: asset.duration_ms,
            byte_size: asset.byte_size,
            path: asset.path.clone(),
            oversized: asset.byte_size > target_bytes,
            is_source: true,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ChunkingError {
    #[error("Asset reports no duration or size")]
    EmptyAsset,

    #[error("Failed to encode chunk {index}: {source}")]
    Encode {
        index: usize,
        #[source]
        source: anyhow::Error,
    },
}

/// Planner knobs
#[derive(Debug, Clone)]
pub struct ChunkSettings {
    pub tier: Tier,
    /// Largest encoded chunk the plan aims for
    pub target_bytes: u64,
    /// Shortest chunk the planner will produce
    pub min_chunk_ms: u64,
    /// Audio repeated at the start of the next chunk
    pub overlap_ms: u64,
    pub max_iterations: usize,
}

impl ChunkSettings {
    pub fn for_tier(tier: Tier) -> Self {
        Self {
            tier,
            target_bytes: CHUNK_TARGET_BYTES,
            min_chunk_ms: 30_000,
            overlap_ms: 500,
            max_iterations: 1000,
        }
    }
}

/// Splits long audio into bounded-size, slightly overlapping chunks
pub struct ChunkPlanner {
    encoder: Arc<dyn ChunkEncoder>,
    settings: ChunkSettings,
}

impl ChunkPlanner {
    pub fn new(encoder: Arc<dyn ChunkEncoder>, settings: ChunkSettings) -> Self {
        Self { encoder, settings }
    }

    pub fn settings(&self) -> &ChunkSettings {
        &self.settings
    }

    /// Estimated duration of every chunk but the last
    pub fn chunk_duration_ms(&self, asset: &AudioAsset) -> Result<u64, ChunkingError> {
        if asset.duration_ms == 0 || asset.byte_size == 0 {
            return Err(ChunkingError::EmptyAsset);
        }

        let limits = self.settings.tier.limits();
        let estimate = if self.settings.tier.is_constrained() {
            // Half the target leaves room for re-encoding overhead
            let target = self.settings.target_bytes as f64 * 0.5;
            (target / asset.byte_size as f64 * asset.duration_ms as f64).round() as u64
        } else {
            let bytes_per_ms = limits.chunk_bitrate_kbps as f64 / 8.0;
            (self.settings.target_bytes as f64 / bytes_per_ms).round() as u64
        };

        Ok(estimate.min(limits.max_chunk_ms).max(self.settings.min_chunk_ms))
    }

    /// Plan and encode chunks into `out_dir`.
    ///
    /// Never fails: if the asset cannot be chunked, the whole asset comes back
    /// as a single chunk.
    pub async fn plan(&self, asset: &AudioAsset, out_dir: &Path) -> Vec<AudioChunk> {
        match self.try_plan(asset, out_dir).await {
            Ok(chunks) if !chunks.is_empty() => chunks,
            Ok(_) => vec![AudioChunk::whole(asset, self.settings.target_bytes)],
            Err(e) => {
                tracing::warn!("Chunking failed, sending the whole file as one chunk: {}", e);
                vec![AudioChunk::whole(asset, self.settings.target_bytes)]
            }
        }
    }

    async fn try_plan(&self, asset: &AudioAsset, out_dir: &Path) -> Result<Vec<AudioChunk>, ChunkingError> {
        let chunk_ms = self.chunk_duration_ms(asset)?;
        let overlap_ms = self.settings.overlap_ms.min(chunk_ms / 2);
        let bitrate = self.settings.tier.limits().chunk_bitrate_kbps;
        let total_ms = asset.duration_ms;

        tracing::info!(
            "Chunking {:.1}MB / {:.1} min into ~{:.1} minute segments at {}kbps",
            asset.size_mb(),
            asset.duration_minutes(),
            chunk_ms as f64 / 60_000.0,
            bitrate
        );

        let mut chunks: Vec<AudioChunk> = Vec::new();
        let mut start_ms = 0;

        while start_ms < total_ms {
            if chunks.len() >= self.settings.max_iterations {
                tracing::warn!(
                    "Reached maximum iterations ({}) at {}ms of {}ms, returning partial plan",
                    self.settings.max_iterations,
                    start_ms,
                    total_ms
                );
                break;
            }

            let index = chunks.len();
            let end_ms = (start_ms + chunk_ms).min(total_ms);
            let path = out_dir.join(format!("chunk_{:04}.mp3", index));

            let byte_size = match self.encoder.encode(&asset.path, start_ms, end_ms, bitrate, &path).await {
                Ok(size) => size,
                Err(source) => {
                    remove_chunk_files(&chunks).await;
                    return Err(ChunkingError::Encode { index, source });
                }
            };

            let oversized = byte_size > self.settings.target_bytes;
            if oversized {
                tracing::warn!(
                    "Chunk {} is {:.1}MB, still above the {:.1}MB target",
                    index,
                    crate::utils::bytes_to_mb(byte_size),
                    crate::utils::bytes_to_mb(self.settings.target_bytes)
                );
            }

            tracing::debug!(
                "Chunk {}: {:.1}s - {:.1}s ({:.1}MB)",
                index,
                start_ms as f64 / 1000.0,
                end_ms as f64 / 1000.0,
                crate::utils::bytes_to_mb(byte_size)
            );

            chunks.push(AudioChunk {
                index,
                start_ms,
                end_ms,
                byte_size,
                path,
                oversized,
                is_source: false,
            });

            if end_ms >= total_ms {
                break;
            }

            // The final chunk starts exactly where the previous one ended
            start_ms = if end_ms + chunk_ms >= total_ms {
                end_ms
            } else {
                end_ms - overlap_ms
            };
        }

        tracing::info!("Created {} chunks", chunks.len());
        Ok(chunks)
    }
}

async fn remove_chunk_files(chunks: &[AudioChunk]) {
    for chunk in chunks.iter().filter(|c| !c.is_source) {
        if let Err(e) = tokio::fs::remove_file(&chunk.path).await {
            tracing::debug!("Could not remove {}: {}", chunk.path.display(), e);
        }
    }
}
