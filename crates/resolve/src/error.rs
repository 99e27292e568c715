use thiserror::Error;

use extract::ExtractionError;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("NES search request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("NES search returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Unexpected NES search response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Entity not found: {0}")]
    EntityNotFound(String),
    #[error("Entity {0} has no name to search for")]
    MissingName(String),
    #[error("Entity search failed: {0}")]
    Search(#[from] SearchError),
    #[error("Candidate evaluation failed: {0}")]
    Extraction(#[from] ExtractionError),
}
