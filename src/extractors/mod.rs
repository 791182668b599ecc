use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};

pub mod local;
pub mod platform;
pub mod ytdlp;

pub use platform::{
    detect_platform, detect_tiktok_collection, validate_url, validate_urls, CollectionKind, Platform, UrlValidation,
};

use crate::audio::AudioAsset;
use crate::Result;

/// Audio fetched for one job item, plus what the source told us about it
#[derive(Debug, Clone, Serialize)]
pub struct DownloadedMedia {
    pub asset: AudioAsset,
    pub platform: Platform,
    pub title: Option<String>,
    pub video_id: Option<String>,
    pub uploader: Option<String>,
    /// URL or path the media was fetched from
    pub source: String,
}

/// Trait for fetching audio from different platforms
#[async_trait]
pub trait MediaExtractor: Send + Sync {
    /// Fetch audio for `input` into `dest_dir`.
    ///
    /// The file written into `dest_dir` belongs to the caller.
    async fn fetch(&self, input: &str, dest_dir: &Path) -> Result<DownloadedMedia>;

    /// Check if this extractor supports the given input
    fn supports(&self, input: &str) -> bool;

    /// Get the name of this platform
    fn platform_name(&self) -> &'static str;
}

/// Registry for managing multiple extractors
pub struct ExtractorRegistry {
    extractors: Vec<Box<dyn MediaExtractor>>,
}

impl ExtractorRegistry {
    /// Create a new registry with default extractors
    pub fn new(cookies_path: Option<PathBuf>) -> Self {
        let mut registry = Self {
            extractors: Vec::new(),
        };

        registry.register(Box::new(local::LocalFileExtractor::new()));
        registry.register(Box::new(ytdlp::YtDlpExtractor::new(cookies_path)));

        registry
    }

    /// Register a new extractor
    pub fn register(&mut self, extractor: Box<dyn MediaExtractor>) {
        self.extractors.push(extractor);
    }

    /// Find an extractor that supports the given input
    pub fn find_extractor(&self, input: &str) -> Option<&dyn MediaExtractor> {
        self.extractors
            .iter()
            .find(|extractor| extractor.supports(input))
            .map(|boxed| boxed.as_ref())
    }

    /// List all supported platforms
    pub fn list_platforms(&self) -> Vec<&'static str> {
        self.extractors
            .iter()
            .map(|extractor| extractor.platform_name())
            .collect()
    }

    /// Fetch audio using the appropriate extractor
    pub async fn fetch(&self, input: &str, dest_dir: &Path) -> Result<DownloadedMedia> {
        let extractor = self
            .find_extractor(input)
            .ok_or_else(|| anyhow::anyhow!("No extractor found for: {}", input))?;

        tracing::info!("Fetching {} with the {} extractor", input, extractor.platform_name());
        extractor.fetch(input, dest_dir).await
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Check if input is a local file path rather than a URL
pub fn is_local_file(input: &str) -> bool {
    // First, check if it's clearly a URL
    if input.starts_with("http://") || input.starts_with("https://") {
        return false;
    }

    // Check if the file exists (handles both absolute and relative paths)
    let path = Path::new(input);
    if path.exists() {
        return true;
    }

    // Check if it looks like a file path (has file extension or path separators)
    let has_extension = path.extension().is_some() && !input.contains("://");
    let has_path_separators = input.starts_with('/') || input.contains('\\');
    let starts_with_dot = input.starts_with("./") || input.starts_with(".\\");

    has_extension || has_path_separators || starts_with_dot
}
