use thiserror::Error;
use uuid::Uuid;

use extract::ExtractionError;
use resolve::ResolveError;
use session::SessionError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    NotFound(Uuid),
    #[error("Timed out waiting for the lock on session {0}")]
    LockTimeout(Uuid),
    #[error("Concurrent update conflict: {0}")]
    Conflict(String),
    #[error("Session already exists: {0}")]
    Duplicate(Uuid),
    #[error("Store backend error: {0}")]
    Backend(String),
    #[error("Session data error: {0}")]
    Serialization(#[from] SessionError),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Task queue closed")]
    Closed,
    #[error("Failed to submit job: {0}")]
    Submit(String),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Failed to queue entity changes: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),
    #[error("Entity not found: {0}")]
    EntityNotFound(String),
    #[error("{0}")]
    Precondition(String),
    #[error("Session {session_id} is busy, retry later: {source}")]
    Concurrency {
        session_id: Uuid,
        #[source]
        source: StoreError,
    },
    #[error("Extraction failed: {0}")]
    Extraction(#[from] ExtractionError),
    #[error("Entity resolution failed: {0}")]
    Resolution(#[from] ResolveError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Store(StoreError),
}

impl PipelineError {
    /// Short machine-readable kind for API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::SessionNotFound(_) => "not_found",
            PipelineError::EntityNotFound(_) => "entity_not_found",
            PipelineError::Precondition(_) => "validation_error",
            PipelineError::Concurrency { .. } => "concurrency_conflict",
            PipelineError::Extraction(_) => "extraction_error",
            PipelineError::Resolution(_) => "resolution_error",
            PipelineError::Queue(_) => "queue_error",
            PipelineError::Sink(_) => "persistence_error",
            PipelineError::Store(_) => "store_error",
        }
    }
}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => PipelineError::SessionNotFound(id),
            StoreError::LockTimeout(session_id) => PipelineError::Concurrency {
                session_id,
                source: StoreError::LockTimeout(session_id),
            },
            other => PipelineError::Store(other),
        }
    }
}

impl From<SessionError> for PipelineError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Serialization(_) | SessionError::UnsupportedVersion { .. } => {
                PipelineError::Store(StoreError::Serialization(e))
            }
            other => PipelineError::Precondition(other.to_string()),
        }
    }
}
