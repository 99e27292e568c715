//! Serializable extraction session shared by every pipeline stage.

pub mod change;
pub mod conversation;
pub mod error;
pub mod metadata;
pub mod model;
pub mod session;
pub mod taxonomy;

pub use change::{ChangeType, EntityChange};
pub use conversation::{Author, Conversation, ConversationKey, Message};
pub use error::SessionError;
pub use metadata::{DocumentMetadata, DocumentType, parse_publication_date};
pub use model::{
    EntityMatchCandidate, EntityMatchState, EntityName, Language, Resolution, ResolutionStatus,
    ResolvedEntity, ReviewAction, new_entity_id, validate_registry_id,
};
pub use session::{ExtractionSession, ProgressSummary, SESSION_FORMAT_VERSION};
pub use taxonomy::{EntityKind, EntitySubType, EntityType};
