use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use session::SessionError;

/// Failure of a single provider call. Every variant is worth retrying.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Request to model provider failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Model provider returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Model returned malformed JSON: {0}")]
    MalformedJson(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("LLM extraction timed out after {} seconds", .0.as_secs())]
    Timeout(Duration),
    #[error("LLM extraction failed after {attempts} attempts: {source}")]
    Unavailable {
        attempts: usize,
        #[source]
        source: ProviderError,
    },
    #[error("Invalid extraction: {0}")]
    InvalidShape(String),
    #[error("{0}")]
    Precondition(String),
    #[error("Failed to read document {}: {source}", .path.display())]
    Document {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<SessionError> for ExtractionError {
    fn from(e: SessionError) -> Self {
        ExtractionError::InvalidShape(e.to_string())
    }
}
