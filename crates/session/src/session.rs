use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::conversation::{Conversation, ConversationKey};
use crate::error::SessionError;
use crate::metadata::DocumentMetadata;
use crate::model::{EntityMatchState, ResolutionStatus};

/// Version written into every serialized session document.
pub const SESSION_FORMAT_VERSION: u64 = 1;

/// One document's extraction and resolution workflow.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExtractionSession {
    #[serde(default)]
    pub source_document: Option<PathBuf>,
    #[serde(default)]
    pub guidance: Option<String>,
    #[serde(default)]
    pub metadata: Option<DocumentMetadata>,
    #[serde(default)]
    pub conversations: BTreeMap<String, Conversation>,
    #[serde(default)]
    pub entities: Vec<EntityMatchState>,
}

#[derive(Serialize, Deserialize)]
struct VersionedDocument {
    version: u64,
    session: ExtractionSession,
}

/// Entity counts by resolution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProgressSummary {
    pub total: usize,
    pub pending: usize,
    pub needs_review: usize,
    pub matched: usize,
    pub create_new: usize,
    pub skipped: usize,
}

impl ExtractionSession {
    pub fn new(source_document: Option<PathBuf>, guidance: Option<String>) -> Self {
        Self {
            source_document,
            guidance: guidance.filter(|g| !g.trim().is_empty()),
            ..Default::default()
        }
    }

    /// Get the conversation for `key`, creating an empty one on first use.
    pub fn get_conversation(&mut self, key: &ConversationKey) -> &mut Conversation {
        self.conversations.entry(key.to_string()).or_default()
    }

    pub fn conversation(&self, key: &ConversationKey) -> Option<&Conversation> {
        self.conversations.get(&key.to_string())
    }

    pub fn entity_index(&self, entity_id: &str) -> Option<usize> {
        self.entities.iter().position(|e| e.entity_id == entity_id)
    }

    pub fn entity(&self, entity_id: &str) -> Option<&EntityMatchState> {
        self.entities.iter().find(|e| e.entity_id == entity_id)
    }

    pub fn entity_mut(&mut self, entity_id: &str) -> Option<&mut EntityMatchState> {
        self.entities.iter_mut().find(|e| e.entity_id == entity_id)
    }

    /// Replace the entity carrying the same id. Returns false if it is gone.
    pub fn replace_entity(&mut self, entity: EntityMatchState) -> bool {
        match self.entity_mut(&entity.entity_id) {
            Some(slot) => {
                *slot = entity;
                true
            }
            None => false,
        }
    }

    pub fn progress(&self) -> ProgressSummary {
        let mut summary = ProgressSummary {
            total: self.entities.len(),
            ..Default::default()
        };
        for entity in &self.entities {
            match entity.status() {
                ResolutionStatus::Pending => summary.pending += 1,
                ResolutionStatus::NeedsReview => summary.needs_review += 1,
                ResolutionStatus::Matched => summary.matched += 1,
                ResolutionStatus::CreateNew => summary.create_new += 1,
                ResolutionStatus::Skipped => summary.skipped += 1,
            }
        }
        summary
    }

    /// Index and status of every entity not yet eligible for persistence.
    pub fn unresolved(&self) -> Vec<(usize, ResolutionStatus)> {
        self.entities
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.status().is_resolved())
            .map(|(i, e)| (i, e.status()))
            .collect()
    }

    /// Serialize into the versioned JSON document stored between stages.
    pub fn to_document(&self) -> Result<Value, SessionError> {
        let doc = VersionedDocument {
            version: SESSION_FORMAT_VERSION,
            session: self.clone(),
        };
        Ok(serde_json::to_value(doc)?)
    }

    pub fn from_document(value: Value) -> Result<Self, SessionError> {
        let found = value.get("version").and_then(Value::as_u64).unwrap_or(0);
        if found != SESSION_FORMAT_VERSION {
            return Err(SessionError::UnsupportedVersion {
                found,
                expected: SESSION_FORMAT_VERSION,
            });
        }
        let doc: VersionedDocument = serde_json::from_value(value)?;
        Ok(doc.session)
    }
}
