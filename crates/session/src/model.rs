//! Per-entity state: what was extracted, what the registry offered, and how
//! the entity has been resolved.

use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::LazyLock;

use crate::error::SessionError;
use crate::taxonomy::EntityKind;

const ENTITY_ID_LEN: usize = 8;
const ENTITY_ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

static REGISTRY_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^entity:([a-z_]+)(?:/[a-z_]+)?/[a-z0-9]+(?:-[a-z0-9]+)*$")
        .expect("registry id pattern compiles")
});

/// Fresh opaque entity identifier. Uniqueness is only relied on within a session.
pub fn new_entity_id() -> String {
    let mut rng = rand::thread_rng();
    (0..ENTITY_ID_LEN)
        .map(|_| ENTITY_ID_CHARSET[rng.gen_range(0..ENTITY_ID_CHARSET.len())] as char)
        .collect()
}

/// Check a registry id like `entity:person/ram-bahadur-thapa` against the
/// entity kind it is being matched to.
pub fn validate_registry_id(nes_id: &str, kind: &EntityKind) -> Result<(), SessionError> {
    let captures = REGISTRY_ID
        .captures(nes_id)
        .ok_or_else(|| SessionError::InvalidRegistryId(nes_id.to_string()))?;
    if &captures[1] != kind.entity_type.as_str() {
        return Err(SessionError::InvalidRegistryId(nes_id.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    En,
    Ne,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityName {
    pub name: String,
    pub language: Language,
    #[serde(default)]
    pub is_primary: bool,
}

/// Entity as the model described it in the document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResolvedEntity {
    #[serde(default)]
    pub names: Vec<EntityName>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub mentions: Vec<String>,
}

impl ResolvedEntity {
    /// The name flagged primary, falling back to the first one.
    pub fn primary_name(&self) -> Option<&str> {
        self.names
            .iter()
            .find(|n| n.is_primary)
            .or_else(|| self.names.first())
            .map(|n| n.name.as_str())
    }
}

/// A registry search hit, optionally scored by the extraction engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMatchCandidate {
    pub nes_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nes_record: Option<Value>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl EntityMatchCandidate {
    pub fn new(nes_id: impl Into<String>, nes_record: Option<Value>) -> Self {
        Self {
            nes_id: nes_id.into(),
            nes_record,
            confidence: None,
            reasoning: None,
        }
    }
}

/// Flat status used for reporting and persistence checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    Pending,
    Matched,
    CreateNew,
    NeedsReview,
    Skipped,
}

impl ResolutionStatus {
    /// Matched, create-new and skipped entities may pass the persistence gate.
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            ResolutionStatus::Matched | ResolutionStatus::CreateNew | ResolutionStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStatus::Pending => "pending",
            ResolutionStatus::Matched => "matched",
            ResolutionStatus::CreateNew => "create_new",
            ResolutionStatus::NeedsReview => "needs_review",
            ResolutionStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for ResolutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolution state with the data each state requires. A matched entity always
/// carries its registry id; nothing else does.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Resolution {
    #[default]
    Pending,
    Matched {
        nes_id: String,
    },
    CreateNew,
    NeedsReview,
    Skipped {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl Resolution {
    pub fn status(&self) -> ResolutionStatus {
        match self {
            Resolution::Pending => ResolutionStatus::Pending,
            Resolution::Matched { .. } => ResolutionStatus::Matched,
            Resolution::CreateNew => ResolutionStatus::CreateNew,
            Resolution::NeedsReview => ResolutionStatus::NeedsReview,
            Resolution::Skipped { .. } => ResolutionStatus::Skipped,
        }
    }
}

/// A reviewer's decision for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReviewAction {
    Match {
        nes_id: String,
    },
    Create,
    Skip {
        #[serde(default)]
        reason: Option<String>,
    },
}

/// One entity mention extracted from the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMatchState {
    pub entity_id: String,
    #[serde(flatten)]
    pub kind: EntityKind,
    pub resolved_entity: ResolvedEntity,
    #[serde(default)]
    pub resolution: Resolution,
    #[serde(default)]
    pub candidates: Vec<EntityMatchCandidate>,
    #[serde(default)]
    pub proposed_changes: Map<String, Value>,
}

impl EntityMatchState {
    /// A freshly extracted, unresolved entity with a new id.
    pub fn new(kind: EntityKind, resolved_entity: ResolvedEntity) -> Self {
        Self {
            entity_id: new_entity_id(),
            kind,
            resolved_entity,
            resolution: Resolution::Pending,
            candidates: Vec::new(),
            proposed_changes: Map::new(),
        }
    }

    pub fn status(&self) -> ResolutionStatus {
        self.resolution.status()
    }

    pub fn matched_nes_id(&self) -> Option<&str> {
        match &self.resolution {
            Resolution::Matched { nes_id } => Some(nes_id),
            _ => None,
        }
    }

    pub fn needs_creation(&self) -> bool {
        matches!(self.resolution, Resolution::CreateNew)
    }

    pub fn primary_name(&self) -> Option<&str> {
        self.resolved_entity.primary_name()
    }

    /// Take a refined description of this entity. Id and resolution are kept,
    /// unless the kind changed: the match and its candidates then belong to the
    /// old type, so the entity goes back to review. Returns whether it did.
    pub fn apply_update(&mut self, kind: EntityKind, resolved_entity: ResolvedEntity) -> bool {
        let kind_changed = self.kind != kind;
        self.kind = kind;
        self.resolved_entity = resolved_entity;
        if kind_changed {
            self.resolution = Resolution::NeedsReview;
            self.candidates.clear();
            self.proposed_changes.clear();
        }
        kind_changed
    }

    /// Apply a reviewer decision, enforcing the review transitions.
    pub fn apply_review(&mut self, action: &ReviewAction) -> Result<ResolutionStatus, SessionError> {
        let from = self.status();
        match action {
            ReviewAction::Match { nes_id } => {
                if !matches!(from, ResolutionStatus::NeedsReview | ResolutionStatus::Matched) {
                    return Err(SessionError::IllegalTransition { action: "match", from });
                }
                validate_registry_id(nes_id, &self.kind)?;
                self.resolution = Resolution::Matched {
                    nes_id: nes_id.clone(),
                };
            }
            ReviewAction::Create => {
                if !matches!(
                    from,
                    ResolutionStatus::NeedsReview
                        | ResolutionStatus::Matched
                        | ResolutionStatus::CreateNew
                ) {
                    return Err(SessionError::IllegalTransition { action: "create", from });
                }
                self.resolution = Resolution::CreateNew;
            }
            ReviewAction::Skip { reason } => {
                self.resolution = Resolution::Skipped {
                    reason: reason.clone(),
                };
            }
        }
        Ok(self.status())
    }
}
