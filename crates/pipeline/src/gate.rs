//! Persistence gate: a session may only be written to the registry once every
//! entity has a final decision.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use session::{EntityChange, ExtractionSession};

use crate::error::{PipelineError, SinkError};

/// A queued registry change awaiting application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovedChange {
    pub id: Uuid,
    #[serde(flatten)]
    pub change: EntityChange,
    pub description: String,
    pub approved_by: Option<String>,
    pub approved_at: DateTime<Utc>,
}

/// Destination for approved entity changes.
#[async_trait]
pub trait ChangeSink: Send + Sync {
    /// Queue every change or none of them, returning the assigned ids in order.
    async fn queue_changes(
        &self,
        changes: &[EntityChange],
        description: &str,
        approved_by: Option<&str>,
    ) -> Result<Vec<Uuid>, SinkError>;
}

#[derive(Debug, Default)]
pub struct InMemoryChangeSink {
    changes: Mutex<Vec<ApprovedChange>>,
}

impl InMemoryChangeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn changes(&self) -> Vec<ApprovedChange> {
        self.changes
            .lock()
            .map(|changes| changes.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChangeSink for InMemoryChangeSink {
    async fn queue_changes(
        &self,
        changes: &[EntityChange],
        description: &str,
        approved_by: Option<&str>,
    ) -> Result<Vec<Uuid>, SinkError> {
        let approved_at = Utc::now();
        let batch: Vec<ApprovedChange> = changes
            .iter()
            .map(|change| ApprovedChange {
                id: Uuid::new_v4(),
                change: change.clone(),
                description: description.to_string(),
                approved_by: approved_by.map(str::to_string),
                approved_at,
            })
            .collect();
        let ids = batch.iter().map(|c| c.id).collect();

        self.changes
            .lock()
            .map_err(|_| SinkError::Rejected("change queue lock poisoned".into()))?
            .extend(batch);

        info!(changes = changes.len(), "Entity changes queued");
        Ok(ids)
    }
}

/// Reject the session unless every entity is matched, marked for creation or
/// skipped.
pub fn validate_all_resolved(session: &ExtractionSession) -> Result<(), PipelineError> {
    let unresolved = session.unresolved();
    if unresolved.is_empty() {
        return Ok(());
    }

    let details: Vec<String> = unresolved
        .iter()
        .map(|(index, status)| format!("Entity {}: {}", index, status))
        .collect();
    Err(PipelineError::Precondition(format!(
        "Unresolved entities: {}",
        details.join(", ")
    )))
}

/// Change records for the session. Skipped entities produce none.
pub fn build_changes(session: &ExtractionSession) -> Result<Vec<EntityChange>, PipelineError> {
    validate_all_resolved(session)?;
    Ok(session
        .entities
        .iter()
        .filter_map(EntityChange::from_entity)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use session::{
        ChangeType, EntityKind, EntityMatchState, EntityName, Language, Resolution,
        ResolvedEntity,
    };

    fn entity(kind: &str, name: &str, resolution: Resolution) -> EntityMatchState {
        let mut entity = EntityMatchState::new(
            EntityKind::parse(kind).unwrap(),
            ResolvedEntity {
                names: vec![EntityName {
                    name: name.into(),
                    language: Language::En,
                    is_primary: true,
                }],
                ..Default::default()
            },
        );
        entity.resolution = resolution;
        entity
    }

    fn three_entity_session() -> ExtractionSession {
        let mut session = ExtractionSession::default();
        session.entities = vec![
            entity(
                "person",
                "Ram Bahadur Thapa",
                Resolution::Matched {
                    nes_id: "entity:person/ram-bahadur-thapa".into(),
                },
            ),
            entity("organization/political_party", "Old Party", Resolution::Skipped { reason: None }),
            entity("organization/ngo", "Unknown NGO XYZ", Resolution::CreateNew),
        ];
        session.entities[2]
            .proposed_changes
            .insert("slug".into(), "unknown-ngo-xyz".into());
        session
    }

    #[test]
    fn test_skipped_entities_produce_no_change() {
        let changes = build_changes(&three_entity_session()).unwrap();

        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].change_type, ChangeType::Update);
        assert_eq!(
            changes[0].entity_id.as_deref(),
            Some("entity:person/ram-bahadur-thapa")
        );
        assert_eq!(changes[1].change_type, ChangeType::Create);
        assert_eq!(changes[1].entity_id, None);
        assert_eq!(changes[1].entity_data["slug"], "unknown-ngo-xyz");
    }

    #[test]
    fn test_unresolved_entities_are_listed() {
        let mut session = three_entity_session();
        session.entities[0].resolution = Resolution::NeedsReview;
        session
            .entities
            .push(entity("person", "Sita Sharma", Resolution::Pending));

        let err = build_changes(&session).unwrap_err();
        match err {
            PipelineError::Precondition(message) => {
                assert!(message.starts_with("Unresolved entities: "));
                assert!(message.contains("Entity 0: needs_review"));
                assert!(message.contains("Entity 3: pending"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_sink_records_batch() {
        let sink = InMemoryChangeSink::new();
        let changes = build_changes(&three_entity_session()).unwrap();

        let ids = sink
            .queue_changes(&changes, "Budget speech entities", Some("reviewer"))
            .await
            .unwrap();

        let stored = sink.changes();
        assert_eq!(ids.len(), 2);
        assert_eq!(stored.iter().map(|c| c.id).collect::<Vec<_>>(), ids);
        assert!(stored.iter().all(|c| c.approved_by.as_deref() == Some("reviewer")));

        let value = serde_json::to_value(&stored[1]).unwrap();
        assert_eq!(value["change_type"], "create");
        assert_eq!(value["entity_type"], "organization");
    }
}
