use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;

/// Cuts `[start_ms, end_ms)` out of a source file and encodes it.
///
/// Returns the size in bytes of the written file.
#[async_trait]
pub trait ChunkEncoder: Send + Sync {
    async fn encode(
        &self,
        source: &Path,
        start_ms: u64,
        end_ms: u64,
        bitrate_kbps: u32,
        dest: &Path,
    ) -> Result<u64>;
}

/// Encoder that shells out to ffmpeg and writes MP3 chunks
pub struct FfmpegEncoder {
    ffmpeg_path: String,
}

impl FfmpegEncoder {
    pub fn new() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
        }
    }
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChunkEncoder for FfmpegEncoder {
    async fn encode(
        &self,
        source: &Path,
        start_ms: u64,
        end_ms: u64,
        bitrate_kbps: u32,
        dest: &Path,
    ) -> Result<u64> {
        let start = format!("{:.3}", start_ms as f64 / 1000.0);
        let duration = format!("{:.3}", end_ms.saturating_sub(start_ms) as f64 / 1000.0);
        let bitrate = format!("{}k", bitrate_kbps);

        let output = Command::new(&self.ffmpeg_path)
            .args([
                "-ss", &start,
                "-t", &duration,
                "-i", &source.to_string_lossy(),
                "-vn",
                "-acodec", "libmp3lame",
                "-b:a", &bitrate,
                "-y",
                &dest.to_string_lossy(),
            ])
            .output()
            .await
            .context("Failed to run ffmpeg")?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("ffmpeg failed to encode chunk: {}", error);
        }

        let metadata = tokio::fs::metadata(dest)
            .await
            .with_context(|| format!("Encoded chunk missing: {}", dest.display()))?;

        Ok(metadata.len())
    }
}
