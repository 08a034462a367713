//! Indexer error types

use thiserror::Error;

/// Errors from talking to the indexer
#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("rate limited (429): {0}")]
    RateLimited(String),

    #[error("indexer returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request failed: {0}")]
    Transport(String),

    #[error("failed to decode indexer response: {0}")]
    Decode(String),

    #[error("request gateway is closed")]
    GatewayClosed,
}

impl IndexerError {
    /// Whether backing off and retrying may help
    pub fn is_rate_limit(&self) -> bool {
        match self {
            Self::RateLimited(_) => true,
            Self::Status { status, body } => {
                *status == 429 || body.to_lowercase().contains("rate limit")
            }
            Self::Transport(msg) => msg.to_lowercase().contains("rate limit"),
            Self::Decode(_) | Self::GatewayClosed => false,
        }
    }
}

impl From<reqwest::Error> for IndexerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for IndexerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Result type for indexer operations
pub type IndexerResult<T> = Result<T, IndexerError>;
