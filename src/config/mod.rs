use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::transcribe::tier::Tier;

/// Environment variable that takes precedence over `api.api_key`
pub const API_KEY_ENV: &str = "GROQ_API_KEY";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Transcription service connection
    pub api: ApiConfig,

    /// Chunking and retry knobs
    pub transcription: TranscriptionConfig,

    /// Application settings
    pub app: AppConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the OpenAI-compatible API
    pub base_url: String,

    /// API key, overridden by `GROQ_API_KEY`
    pub api_key: Option<String>,

    /// Speech model name
    pub model: String,

    /// Account tier, decides payload ceilings and bitrates
    pub tier: Tier,

    /// Requests per minute allowed by the account
    pub requests_per_minute: u32,

    /// Optional prompt to steer spelling and style
    pub prompt: Option<String>,

    /// Per-request timeout
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    /// Language used when a job does not name one
    pub default_language: String,

    /// Byte target for each chunk, in MB
    pub chunk_target_mb: u64,

    /// Audio repeated between neighbouring chunks
    pub overlap_ms: u64,

    /// Shortest chunk the planner produces
    pub min_chunk_secs: u64,

    /// Attempts per chunk in the concurrent pass
    pub max_retries: u32,

    /// Attempts per chunk in the sequential retry pass
    pub retry_pass_max_retries: u32,

    /// Pause before the sequential retry pass
    pub retry_cooldown_secs: u64,

    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Temporary directory for downloads
    pub temp_dir: Option<PathBuf>,

    /// Keep audio files after transcription
    pub keep_audio: bool,

    /// Where transcripts and kept audio are written
    pub output_dir: Option<PathBuf>,

    /// Default output format
    pub default_output_format: String,

    /// Maximum job items processed at once
    pub max_concurrent_jobs: usize,

    /// Netscape cookies file handed to yt-dlp
    pub cookies_path: Option<PathBuf>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.groq.com/openai/v1".to_string(),
            api_key: None,
            model: "whisper-large-v3-turbo".to_string(),
            tier: Tier::Free,
            requests_per_minute: 400,
            prompt: None,
            request_timeout_secs: 300,
        }
    }
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            default_language: "en".to_string(),
            chunk_target_mb: 20,
            overlap_ms: 500,
            min_chunk_secs: 30,
            max_retries: 5,
            retry_pass_max_retries: 3,
            retry_cooldown_secs: 30,
            base_delay_secs: 5,
            max_delay_secs: 120,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            temp_dir: None,
            keep_audio: false,
            output_dir: None,
            default_output_format: "text".to_string(),
            max_concurrent_jobs: 3,
            cookies_path: None,
        }
    }
}

impl Config {
    /// Load configuration from file or create default
    pub async fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Self::default();
            config.save().await?;
            Ok(config)
        }
    }

    /// Load and validate a specific config file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs_err::read_to_string(path).context("Failed to read config file")?;

        let config: Config = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            fs_err::create_dir_all(parent)?;
        }

        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;

        fs_err::write(&config_path, content).context("Failed to write config file")?;

        Ok(())
    }

    /// Get configuration file path
    pub fn config_path() -> Result<PathBuf> {
        // First try current directory for easy testing
        let local_config = PathBuf::from("config.yaml");
        if local_config.exists() {
            return Ok(local_config);
        }

        let config_dir = dirs::config_dir().context("Could not determine config directory")?;

        Ok(config_dir.join("multifetch").join("config.yaml"))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(key) = &self.api.api_key {
            validate_api_key(key)?;
        }

        if self.api.requests_per_minute == 0 {
            anyhow::bail!("api.requests_per_minute must be greater than 0");
        }

        if self.transcription.chunk_target_mb == 0 {
            anyhow::bail!("transcription.chunk_target_mb must be greater than 0");
        }

        if self.app.max_concurrent_jobs == 0 {
            anyhow::bail!("app.max_concurrent_jobs must be greater than 0");
        }

        Ok(())
    }

    /// Effective API key, preferring the environment
    pub fn api_key(&self) -> Result<String> {
        let key = std::env::var(API_KEY_ENV)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| self.api.api_key.clone())
            .with_context(|| format!("No API key configured. Set {} or api.api_key in the config file", API_KEY_ENV))?;

        validate_api_key(&key)?;
        Ok(key)
    }

    /// Display current configuration
    pub fn display(&self) {
        println!("Current Configuration:");
        println!("  API URL: {}", self.api.base_url);
        println!("  Model: {}", self.api.model);
        println!("  Tier: {}", self.api.tier);
        println!("  Requests/min: {}", self.api.requests_per_minute);
        println!(
            "  API Key: {}",
            match self.api_key() {
                Ok(key) => mask_key(&key),
                Err(_) => "(not set)".to_string(),
            }
        );
        println!("  Default Language: {}", self.transcription.default_language);
        println!("  Chunk Target: {}MB", self.transcription.chunk_target_mb);
        println!("  Max Retries: {}", self.transcription.max_retries);
        println!("  Keep Audio: {}", self.app.keep_audio);
        println!("  Default Format: {}", self.app.default_output_format);
        println!("  Concurrent Items: {}", self.app.max_concurrent_jobs);
        if let Some(dir) = &self.app.output_dir {
            println!("  Output Dir: {}", dir.display());
        }
    }
}

fn validate_api_key(key: &str) -> Result<()> {
    if !key.starts_with("gsk_") || key.len() < 20 {
        anyhow::bail!("Invalid API key format: expected a key starting with 'gsk_'");
    }
    Ok(())
}

fn mask_key(key: &str) -> String {
    let visible: String = key.chars().take(8).collect();
    format!("{}...", visible)
}
