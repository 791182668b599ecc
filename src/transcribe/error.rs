use std::fmt;

use super::tier::Tier;

/// Classification the retry loop acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Payload is over the service limit; retrying cannot help
    PayloadTooLarge,
    /// Service returned 503
    ServiceUnavailable,
    /// Service returned 429
    RateLimited,
    /// Anything else that may succeed on a later attempt
    Transient,
    /// Retries were used up
    Exhausted,
    /// The run was cancelled before the request was sent
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::PayloadTooLarge => "payload too large",
            ErrorKind::ServiceUnavailable => "service unavailable",
            ErrorKind::RateLimited => "rate limited",
            ErrorKind::Transient => "transient",
            ErrorKind::Exhausted => "exhausted retries",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by the transcription boundary and the retry loop around it
#[derive(thiserror::Error, Debug, Clone)]
pub enum TranscribeError {
    #[error("File is {size_mb:.1}MB, exceeds the {tier} maximum")]
    PayloadTooLarge { size_mb: f64, tier: Tier },

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Failed to read chunk audio: {0}")]
    Io(String),

    #[error("Failed after {attempts} attempts: {last}")]
    ExhaustedRetries {
        attempts: u32,
        last: Box<TranscribeError>,
    },

    #[error("Transcription cancelled")]
    Cancelled,
}

impl TranscribeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TranscribeError::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            TranscribeError::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
            TranscribeError::RateLimited(_) => ErrorKind::RateLimited,
            TranscribeError::Network(_) | TranscribeError::Api { .. } | TranscribeError::Io(_) => {
                ErrorKind::Transient
            }
            TranscribeError::ExhaustedRetries { .. } => ErrorKind::Exhausted,
            TranscribeError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Map an HTTP status from the service onto the taxonomy
    pub fn from_status(status: u16, message: impl Into<String>, size_mb: f64, tier: Tier) -> Self {
        let message = message.into();
        match status {
            413 => TranscribeError::PayloadTooLarge { size_mb, tier },
            429 => TranscribeError::RateLimited(message),
            503 => TranscribeError::ServiceUnavailable(message),
            _ => TranscribeError::Api { status, message },
        }
    }

    /// The error that ended the last attempt, unwrapping exhaustion
    pub fn root(&self) -> &TranscribeError {
        match self {
            TranscribeError::ExhaustedRetries { last, .. } => last.root(),
            other => other,
        }
    }
}

impl From<reqwest::Error> for TranscribeError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) if status.as_u16() == 429 => TranscribeError::RateLimited(err.to_string()),
            Some(status) if status.as_u16() == 503 => TranscribeError::ServiceUnavailable(err.to_string()),
            _ => TranscribeError::Network(err.to_string()),
        }
    }
}
