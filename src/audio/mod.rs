use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Supported audio formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Mp3,
    M4a,
    Wav,
    Flac,
    Ogg,
    Webm,
}

impl AudioFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::M4a => "m4a",
            AudioFormat::Wav => "wav",
            AudioFormat::Flac => "flac",
            AudioFormat::Ogg => "ogg",
            AudioFormat::Webm => "webm",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "mp3" => Some(AudioFormat::Mp3),
            "m4a" | "aac" => Some(AudioFormat::M4a),
            "wav" => Some(AudioFormat::Wav),
            "flac" => Some(AudioFormat::Flac),
            "ogg" => Some(AudioFormat::Ogg),
            "webm" => Some(AudioFormat::Webm),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }

    /// MIME type sent along with uploads
    pub fn mime_type(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "audio/mpeg",
            AudioFormat::M4a => "audio/mp4",
            AudioFormat::Wav => "audio/wav",
            AudioFormat::Flac => "audio/flac",
            AudioFormat::Ogg => "audio/ogg",
            AudioFormat::Webm => "audio/webm",
        }
    }
}

/// Handle to a decoded audio file produced by the download step.
///
/// The asset is immutable once produced. Whoever created it is responsible for
/// removing the file once the job item that uses it has finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioAsset {
    /// Location of the audio on disk
    pub path: PathBuf,

    /// Total duration in milliseconds
    pub duration_ms: u64,

    /// Size of the file in bytes
    pub byte_size: u64,

    /// Container/codec of the source file
    pub format: AudioFormat,
}

impl AudioAsset {
    pub fn new(path: impl Into<PathBuf>, duration_ms: u64, byte_size: u64, format: AudioFormat) -> Self {
        Self {
            path: path.into(),
            duration_ms,
            byte_size,
            format,
        }
    }

    pub fn duration_minutes(&self) -> f64 {
        self.duration_ms as f64 / 60_000.0
    }

    pub fn size_mb(&self) -> f64 {
        crate::utils::bytes_to_mb(self.byte_size)
    }

    /// Build an asset from a file on disk by asking ffprobe for its duration
    pub async fn probe(path: &Path) -> Result<Self> {
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("Cannot access audio file {}", path.display()))?;

        if metadata.len() == 0 {
            anyhow::bail!("Audio file is empty: {}", path.display());
        }

        let duration_ms = probe_duration_ms(path).await?;
        let format = AudioFormat::from_path(path).unwrap_or(AudioFormat::Mp3);

        Ok(Self::new(path, duration_ms, metadata.len(), format))
    }
}

/// Ask ffprobe for the duration of the first audio stream's container
pub async fn probe_duration_ms(path: &Path) -> Result<u64> {
    let output = Command::new("ffprobe")
        .args([
            "-v", "quiet",
            "-print_format", "json",
            "-show_format",
            "-show_streams",
            &path.to_string_lossy(),
        ])
        .output()
        .await
        .context("Failed to run ffprobe")?;

    if !output.status.success() {
        let error = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("Failed to analyze file with ffprobe: {}", error);
    }

    let info: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    parse_probe_output(&info)
        .with_context(|| format!("No usable audio stream in {}", path.display()))
}

fn parse_probe_output(info: &serde_json::Value) -> Result<u64> {
    let has_audio = info["streams"]
        .as_array()
        .map(|streams| {
            streams
                .iter()
                .any(|stream| stream["codec_type"].as_str() == Some("audio"))
        })
        .unwrap_or(false);

    if !has_audio {
        anyhow::bail!("File does not contain any audio streams");
    }

    let seconds = info["format"]["duration"]
        .as_str()
        .and_then(|d| d.parse::<f64>().ok())
        .ok_or_else(|| anyhow::anyhow!("ffprobe reported no duration"))?;

    Ok((seconds * 1000.0).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_probe_output() {
        let info = json!({
            "streams": [{"codec_type": "video"}, {"codec_type": "audio"}],
            "format": {"duration": "5400.250000"}
        });
        assert_eq!(parse_probe_output(&info).unwrap(), 5_400_250);
    }

    #[test]
    fn test_parse_probe_output_without_audio() {
        let info = json!({
            "streams": [{"codec_type": "video"}],
            "format": {"duration": "12.0"}
        });
        assert!(parse_probe_output(&info).is_err());
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(AudioFormat::from_path(Path::new("a/b/clip.M4A")), Some(AudioFormat::M4a));
        assert_eq!(AudioFormat::from_path(Path::new("clip.mkv")), None);
        assert_eq!(AudioFormat::Mp3.mime_type(), "audio/mpeg");
    }

    #[test]
    fn test_asset_units() {
        let asset = AudioAsset::new("x.mp3", 90 * 60_000, 23 * 1024 * 1024, AudioFormat::Mp3);
        assert_eq!(asset.duration_minutes(), 90.0);
        assert!((asset.size_mb() - 23.0).abs() < 1e-9);
    }
}
