use super::{is_local_file, DownloadedMedia, MediaExtractor, Platform};
use crate::audio::{AudioAsset, AudioFormat};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use tokio::fs;
use tokio::process::Command;

/// Formats the transcription service accepts as-is
const PASSTHROUGH_FORMATS: [AudioFormat; 5] = [
    AudioFormat::Mp3,
    AudioFormat::M4a,
    AudioFormat::Wav,
    AudioFormat::Flac,
    AudioFormat::Ogg,
];

pub struct LocalFileExtractor;

impl LocalFileExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Check if the file exists and is accessible
    async fn validate_file(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            anyhow::bail!("File does not exist: {}", path.display());
        }

        if !path.is_file() {
            anyhow::bail!("Path is not a file: {}", path.display());
        }

        let metadata = fs::metadata(path)
            .await
            .with_context(|| format!("Cannot access file {}", path.display()))?;
        if metadata.len() == 0 {
            anyhow::bail!("File is empty: {}", path.display());
        }

        Ok(())
    }

    /// Copy or convert the source into `dest_dir` so the pipeline never touches the original
    async fn prepare_audio(&self, source_path: &Path, dest_dir: &Path) -> Result<std::path::PathBuf> {
        let stem = source_path
            .file_stem()
            .map(|s| crate::utils::sanitize_filename(&s.to_string_lossy()))
            .unwrap_or_else(|| "local".to_string());

        match AudioFormat::from_path(source_path) {
            Some(format) if PASSTHROUGH_FORMATS.contains(&format) => {
                let target = dest_dir.join(format!("{}.{}", stem, format.as_str()));
                tracing::debug!("Copying local audio file: {} -> {}", source_path.display(), target.display());
                fs::copy(source_path, &target)
                    .await
                    .with_context(|| format!("Failed to copy {}", source_path.display()))?;
                Ok(target)
            }
            _ => {
                // Video files and exotic containers are re-encoded to MP3
                let target = dest_dir.join(format!("{}.mp3", stem));
                self.convert_to_mp3(source_path, &target).await?;
                Ok(target)
            }
        }
    }

    /// Convert file to MP3 using ffmpeg
    async fn convert_to_mp3(&self, source_path: &Path, target_path: &Path) -> Result<()> {
        tracing::debug!("Converting {} to MP3", source_path.display());

        let output = Command::new("ffmpeg")
            .args([
                "-i", &source_path.to_string_lossy(),
                "-vn",
                "-acodec", "libmp3lame",
                "-ab", "128k",
                "-ar", "44100",
                "-y",
                &target_path.to_string_lossy(),
            ])
            .output()
            .await
            .context("Failed to run ffmpeg")?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Failed to convert file with ffmpeg: {}", error);
        }

        Ok(())
    }
}

impl Default for LocalFileExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaExtractor for LocalFileExtractor {
    async fn fetch(&self, input: &str, dest_dir: &Path) -> Result<DownloadedMedia> {
        let source_path = Path::new(input);
        self.validate_file(source_path).await?;

        let title = source_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("Local File")
            .to_string();

        let prepared = self.prepare_audio(source_path, dest_dir).await?;
        let asset = AudioAsset::probe(&prepared).await?;

        tracing::info!(
            "Prepared local file {} ({:.1}MB, {})",
            source_path.display(),
            asset.size_mb(),
            crate::utils::format_duration_ms(asset.duration_ms)
        );

        Ok(DownloadedMedia {
            asset,
            platform: Platform::Local,
            title: Some(title),
            video_id: None,
            uploader: None,
            source: input.to_string(),
        })
    }

    fn supports(&self, input: &str) -> bool {
        is_local_file(input)
    }

    fn platform_name(&self) -> &'static str {
        "Local File"
    }
}
