use thiserror::Error;

use crate::model::ResolutionStatus;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid entity type: {0}")]
    UnknownEntityType(String),
    #[error("Invalid conversation key: {0}")]
    InvalidConversationKey(String),
    #[error("Unsupported session document version {found} (expected {expected})")]
    UnsupportedVersion { found: u64, expected: u64 },
    #[error("Cannot {action} an entity whose status is '{from}'")]
    IllegalTransition {
        action: &'static str,
        from: ResolutionStatus,
    },
    #[error("Invalid NES entity ID: {0}")]
    InvalidRegistryId(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
