//! Recognizing which platform a URL points at.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt;

static YOUTUBE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^((?:https?:)?//)?((?:www|m)\.)?(youtube(?:-nocookie)?\.com|youtu\.be)/(?:watch\?v=|embed/|live/|v/|shorts/)?(?P<id>[\w\-]{11})(\S+)?$",
    )
    .expect("youtube pattern is valid")
});

static INSTAGRAM_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:https?://)?(?:www\.)?instagram\.com/(?:p|reel)/(?P<id>[^/?#&]+)")
        .expect("instagram pattern is valid")
});

static TIKTOK_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^https?://(?:www\.|m\.|vm\.)?tiktok\.com/(?:@[\w.\-]+/video/|t/|(?:@[\w.\-]+/)?(?:video/)?)?(?P<id>\d+|\w{7,})",
    )
    .expect("tiktok pattern is valid")
});

/// TikTok collection patterns, each capturing its identifier as `id`
static TIKTOK_COLLECTIONS: Lazy<Vec<(CollectionKind, Regex)>> = Lazy::new(|| {
    [
        (CollectionKind::UserProfile, r"(?i)^https?://(?:www\.|m\.)?tiktok\.com/@(?P<id>[\w.\-]+)/?$"),
        (CollectionKind::Hashtag, r"(?i)^https?://(?:www\.|m\.)?tiktok\.com/tag/(?P<id>[\w.\-]+)"),
        (CollectionKind::Sound, r"(?i)^https?://(?:www\.|m\.)?tiktok\.com/music/(?P<id>[^/?]+)"),
        (
            CollectionKind::Collection,
            r"(?i)^https?://(?:www\.|m\.)?tiktok\.com/@[\w.\-]+/collection/(?P<id>[\w\-]+)",
        ),
        (CollectionKind::ShortUrl, r"(?i)^https?://(?:www\.|m\.|vm\.)?tiktok\.com/t/(?P<id>[\w\-]+)"),
    ]
    .into_iter()
    .map(|(kind, pattern)| (kind, Regex::new(pattern).expect("collection pattern is valid")))
    .collect()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Youtube,
    Instagram,
    Tiktok,
    /// A file on this machine rather than a URL
    Local,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Youtube => "youtube",
            Platform::Instagram => "instagram",
            Platform::Tiktok => "tiktok",
            Platform::Local => "local",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Platform::Youtube => "YouTube",
            Platform::Instagram => "Instagram",
            Platform::Tiktok => "TikTok",
            Platform::Local => "Local File",
        }
    }

    /// Platforms reachable by URL
    pub fn remote() -> [Platform; 3] {
        [Platform::Youtube, Platform::Instagram, Platform::Tiktok]
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionKind {
    UserProfile,
    Hashtag,
    Sound,
    Collection,
    ShortUrl,
}

/// Result of checking one URL
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UrlValidation {
    pub valid: bool,
    pub url: String,
    pub platform: Option<Platform>,
    pub video_id: Option<String>,
    pub is_collection: bool,
    pub collection_type: Option<CollectionKind>,
    pub error: Option<String>,
}

impl UrlValidation {
    fn invalid(url: &str, error: &str) -> Self {
        Self {
            valid: false,
            url: url.to_string(),
            platform: None,
            video_id: None,
            is_collection: false,
            collection_type: None,
            error: Some(error.to_string()),
        }
    }
}

/// Platform and video id of a single-video URL
pub fn detect_platform(url: &str) -> Option<(Platform, String)> {
    let url = url.trim();
    let patterns: [(Platform, &Regex); 3] = [
        (Platform::Youtube, &*YOUTUBE_PATTERN),
        (Platform::Instagram, &*INSTAGRAM_PATTERN),
        (Platform::Tiktok, &*TIKTOK_PATTERN),
    ];

    patterns.iter().find_map(|(platform, pattern)| {
        pattern
            .captures(url)
            .and_then(|caps| caps.name("id"))
            .map(|id| (*platform, id.as_str().to_string()))
    })
}

/// Kind and identifier of a TikTok profile, hashtag, sound or collection URL
pub fn detect_tiktok_collection(url: &str) -> Option<(CollectionKind, String)> {
    let url = url.trim();
    TIKTOK_COLLECTIONS.iter().find_map(|(kind, pattern)| {
        pattern
            .captures(url)
            .and_then(|caps| caps.name("id"))
            .map(|id| (*kind, id.as_str().to_string()))
    })
}

/// Check a URL is well formed and points at a supported platform.
///
/// Collection URLs are matched before single videos, except short links,
/// which usually resolve to a single video.
pub fn validate_url(url: &str) -> UrlValidation {
    let trimmed = url.trim();
    if crate::utils::validate_and_normalize_url(trimmed).is_err() {
        return UrlValidation::invalid(url, "Invalid URL format");
    }

    let collection = detect_tiktok_collection(trimmed);
    let video = detect_platform(trimmed);

    match (collection, video) {
        (Some((kind, id)), video) if kind != CollectionKind::ShortUrl || video.is_none() => UrlValidation {
            valid: true,
            url: trimmed.to_string(),
            platform: Some(Platform::Tiktok),
            video_id: Some(id),
            is_collection: true,
            collection_type: Some(kind),
            error: None,
        },
        (_, Some((platform, id))) => UrlValidation {
            valid: true,
            url: trimmed.to_string(),
            platform: Some(platform),
            video_id: Some(id),
            is_collection: false,
            collection_type: None,
            error: None,
        },
        _ => UrlValidation::invalid(url, "Unsupported platform or URL format"),
    }
}

pub fn validate_urls(urls: &[String]) -> Vec<UrlValidation> {
    urls.iter().map(|url| validate_url(url)).collect()
}
