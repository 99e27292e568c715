use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::{EntityMatchState, Resolution};
use crate::taxonomy::EntityKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Update,
}

/// A change destined for the registry, produced from one resolved entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityChange {
    pub change_type: ChangeType,
    #[serde(flatten)]
    pub kind: EntityKind,
    /// Registry id of the record being updated; `None` for creations.
    pub entity_id: Option<String>,
    pub entity_data: Map<String, Value>,
}

impl EntityChange {
    /// `None` for entities that produce no change (skipped) or are not resolved.
    pub fn from_entity(entity: &EntityMatchState) -> Option<Self> {
        let (change_type, entity_id) = match &entity.resolution {
            Resolution::Matched { nes_id } => (ChangeType::Update, Some(nes_id.clone())),
            Resolution::CreateNew => (ChangeType::Create, None),
            _ => return None,
        };
        Some(Self {
            change_type,
            kind: entity.kind,
            entity_id,
            entity_data: entity.proposed_changes.clone(),
        })
    }
}
