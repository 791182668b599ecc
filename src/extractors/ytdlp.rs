use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use super::platform::{validate_url, UrlValidation};
use super::{DownloadedMedia, MediaExtractor};
use crate::audio::{AudioAsset, AudioFormat};
use crate::Result;

/// Audio extractor for YouTube, Instagram and TikTok using yt-dlp
pub struct YtDlpExtractor {
    yt_dlp_path: String,
    cookies_path: Option<PathBuf>,
}

/// Metadata read from `yt-dlp --dump-json`
#[derive(Debug, Clone, Default, PartialEq)]
struct VideoInfo {
    id: Option<String>,
    title: Option<String>,
    uploader: Option<String>,
    duration_ms: Option<u64>,
}

impl VideoInfo {
    fn from_json(info: &Value) -> Self {
        Self {
            id: info["id"].as_str().map(str::to_string),
            title: info["title"].as_str().map(str::to_string),
            uploader: info["uploader"]
                .as_str()
                .or_else(|| info["channel"].as_str())
                .map(str::to_string),
            duration_ms: info["duration"].as_f64().map(|secs| (secs * 1000.0).round() as u64),
        }
    }
}

impl YtDlpExtractor {
    pub fn new(cookies_path: Option<PathBuf>) -> Self {
        Self {
            yt_dlp_path: "yt-dlp".to_string(),
            cookies_path,
        }
    }

    /// Check if yt-dlp is available
    pub async fn check_availability(&self) -> bool {
        Command::new(&self.yt_dlp_path)
            .arg("--version")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    fn cookie_args(&self) -> Vec<String> {
        let cookies = self
            .cookies_path
            .clone()
            .filter(|p| p.exists())
            .or_else(|| Some(PathBuf::from("cookies.txt")).filter(|p| p.exists()));

        match cookies {
            Some(path) => vec!["--cookies".to_string(), path.to_string_lossy().into_owned()],
            None => Vec::new(),
        }
    }

    /// Get video information using yt-dlp
    async fn get_video_info(&self, url: &str) -> Result<VideoInfo> {
        tracing::debug!("Extracting video info for: {}", url);

        let output = Command::new(&self.yt_dlp_path)
            .args(["--dump-json", "--no-playlist", "--socket-timeout", "30"])
            .args(self.cookie_args())
            .arg(url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("yt-dlp failed: {}", error.trim());
        }

        let info: Value = serde_json::from_slice(&output.stdout)?;
        Ok(VideoInfo::from_json(&info))
    }

    /// Download audio straight to MP3, returning the written file
    async fn download_audio(&self, url: &str, dest_dir: &Path, stem: &str) -> Result<PathBuf> {
        let template = dest_dir.join(format!("{}.%(ext)s", stem));
        tracing::debug!("Downloading audio for {} into {}", url, dest_dir.display());

        let output = Command::new(&self.yt_dlp_path)
            .args([
                "--output", &template.to_string_lossy(),
                "--extract-audio",
                "--audio-format", "mp3",
                // Lowest quality is plenty for speech and keeps files small
                "--audio-quality", "9",
                "--format", "worstaudio[acodec^=mp4a]/worstaudio[ext=m4a]/worstaudio[ext=mp3]/worstaudio/worst",
                "--no-playlist",
                "--concurrent-fragments", "4",
                "--newline",
            ])
            .args(self.cookie_args())
            .arg(url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Failed to download audio: {}", error.trim());
        }

        let path = dest_dir.join(format!("{}.mp3", stem));
        if !path.exists() {
            anyhow::bail!("yt-dlp reported success but {} was not written", path.display());
        }
        Ok(path)
    }
}

impl Default for YtDlpExtractor {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl MediaExtractor for YtDlpExtractor {
    async fn fetch(&self, url: &str, dest_dir: &Path) -> Result<DownloadedMedia> {
        let validation: UrlValidation = validate_url(url);
        let platform = match validation.platform {
            Some(platform) if validation.valid && !validation.is_collection => platform,
            _ => anyhow::bail!(
                "Not a single-video URL: {}",
                validation.error.as_deref().unwrap_or("collections must be expanded first")
            ),
        };
        let video_id = validation.video_id;

        if !self.check_availability().await {
            anyhow::bail!("yt-dlp is not available. Please install it: https://github.com/yt-dlp/yt-dlp");
        }

        let info = self.get_video_info(url).await?;
        let stem = crate::utils::sanitize_filename(
            info.id.as_deref().or(video_id.as_deref()).unwrap_or("audio"),
        );
        let path = self.download_audio(url, dest_dir, &stem).await?;

        let asset = match AudioAsset::probe(&path).await {
            Ok(asset) => asset,
            Err(e) => {
                // yt-dlp already knows the duration; fall back to it if ffprobe is unhappy
                let duration_ms = info.duration_ms.ok_or(e)?;
                let byte_size = tokio::fs::metadata(&path).await?.len();
                AudioAsset::new(path, duration_ms, byte_size, AudioFormat::Mp3)
            }
        };

        tracing::info!(
            "Downloaded {:?} ({:.1}MB, {})",
            info.title.as_deref().unwrap_or(url),
            asset.size_mb(),
            crate::utils::format_duration_ms(asset.duration_ms)
        );

        Ok(DownloadedMedia {
            asset,
            platform,
            title: info.title,
            video_id: info.id.or(video_id),
            uploader: info.uploader,
            source: url.to_string(),
        })
    }

    fn supports(&self, url: &str) -> bool {
        validate_url(url).valid
    }

    fn platform_name(&self) -> &'static str {
        "yt-dlp"
    }
}
