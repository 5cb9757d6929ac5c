//! Error types for kbrelay

use thiserror::Error;

/// Main error type for relay operations
#[derive(Error, Debug)]
pub enum RelayError {
    /// Knowledge source unreachable and nothing cached to fall back on
    #[error("Knowledge source unavailable for dataset '{dataset}': {reason}")]
    SourceUnavailable { dataset: String, reason: String },

    /// Every configured credential failed or was rate limited
    #[error("Upstream exhausted{}: {reason}", status_suffix(.status))]
    UpstreamExhausted { status: Option<u16>, reason: String },

    /// Configuration errors (missing credentials, unreadable config file, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Inbound request could not be understood
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Proxy/HTTP errors
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Serialization(e.to_string())
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (status {s})")).unwrap_or_default()
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
