use anyhow::Result;
use url::Url;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Byte count as MB (binary megabytes, matching the service's limits)
pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MB
}

/// Validate a URL and return normalized version
pub fn validate_and_normalize_url(url: &str) -> Result<String> {
    let parsed = Url::parse(url.trim()).map_err(|_| anyhow::anyhow!("Invalid URL format: {}", url))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        anyhow::bail!("URL must use HTTP or HTTPS protocol");
    }

    if parsed.host_str().map_or(true, str::is_empty) {
        anyhow::bail!("URL has no host: {}", url);
    }

    Ok(parsed.to_string())
}

/// Format a millisecond duration as `1h 2m 3s`
pub fn format_duration_ms(ms: u64) -> String {
    let total_seconds = ms / 1000;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let secs = total_seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Sanitize filename for safe filesystem usage
pub fn sanitize_filename(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .map(|c| match c {
            c if c.is_alphanumeric() || c == ' ' || c == '-' || c == '_' || c == '.' => c,
            _ => '_',
        })
        .collect();

    let cleaned = cleaned.trim().trim_matches('.');
    let truncated: String = cleaned.chars().take(100).collect();

    if truncated.is_empty() {
        "untitled".to_string()
    } else {
        truncated
    }
}

/// Normalize a language name or tag to the two-letter code the API expects
pub fn normalize_language_code(lang: &str) -> String {
    let lower = lang.trim().to_lowercase();
    let normalized = match lower.as_str() {
        "english" => "en",
        "spanish" | "español" => "es",
        "french" | "français" => "fr",
        "german" | "deutsch" => "de",
        "italian" => "it",
        "portuguese" => "pt",
        "japanese" => "ja",
        "korean" => "ko",
        "chinese" => "zh",
        "arabic" => "ar",
        "hindi" => "hi",
        "russian" => "ru",
        // Region tags such as en-US or pt_BR keep only the language part
        other => other.split(['-', '_']).next().unwrap_or(other),
    };

    normalized.to_string()
}

/// Check if the current environment has required tools
pub async fn check_dependencies() -> Vec<String> {
    let mut missing = Vec::new();

    if !check_command_available("yt-dlp", "--version").await {
        missing.push("yt-dlp - required for downloading from YouTube, Instagram and TikTok".to_string());
    }

    if !check_command_available("ffmpeg", "-version").await {
        missing.push("ffmpeg - required for splitting long audio into chunks".to_string());
    }

    if !check_command_available("ffprobe", "-version").await {
        missing.push("ffprobe - required for reading audio duration".to_string());
    }

    missing
}

/// Check if a command is available in PATH
async fn check_command_available(command: &str, version_flag: &str) -> bool {
    use tokio::process::Command;

    Command::new(command)
        .arg(version_flag)
        .output()
        .await
        .map(|output| output.status.success())
        .unwrap_or(false)
}
