//! Closed entity taxonomy shared by extraction, search and persistence.
//!
//! The taxonomy is a single table of [`EntityKind`] rows. Everything that needs
//! to enumerate kinds (the extraction schema enum, type parsing, the
//! proposed-changes schema dispatch in `extract`) reads from [`EntityKind::ALL`].

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Person,
    Organization,
    Location,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitySubType {
    PoliticalParty,
    GovernmentBody,
    Ngo,
    InternationalOrg,
    Media,
    FinancialInstitution,
    Hospital,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Person => "person",
            EntityType::Organization => "organization",
            EntityType::Location => "location",
        }
    }
}

impl EntitySubType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntitySubType::PoliticalParty => "political_party",
            EntitySubType::GovernmentBody => "government_body",
            EntitySubType::Ngo => "ngo",
            EntitySubType::InternationalOrg => "international_org",
            EntitySubType::Media => "media",
            EntitySubType::FinancialInstitution => "financial_institution",
            EntitySubType::Hospital => "hospital",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for EntitySubType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A (type, subtype) pair from the closed taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKind {
    pub entity_type: EntityType,
    pub entity_subtype: Option<EntitySubType>,
}

impl EntityKind {
    /// Every kind the pipeline accepts, in the order offered to the model.
    pub const ALL: &'static [EntityKind] = &[
        EntityKind::new(EntityType::Person, None),
        EntityKind::new(EntityType::Organization, Some(EntitySubType::PoliticalParty)),
        EntityKind::new(EntityType::Organization, Some(EntitySubType::GovernmentBody)),
        EntityKind::new(EntityType::Organization, Some(EntitySubType::Ngo)),
        EntityKind::new(EntityType::Organization, Some(EntitySubType::InternationalOrg)),
        EntityKind::new(EntityType::Organization, Some(EntitySubType::Media)),
        EntityKind::new(EntityType::Organization, Some(EntitySubType::FinancialInstitution)),
        EntityKind::new(EntityType::Organization, Some(EntitySubType::Hospital)),
        EntityKind::new(EntityType::Location, None),
    ];

    pub const fn new(entity_type: EntityType, entity_subtype: Option<EntitySubType>) -> Self {
        Self {
            entity_type,
            entity_subtype,
        }
    }

    /// Parse the combined form used in prompts, e.g. `organization/ngo`.
    pub fn parse(value: &str) -> Result<Self, SessionError> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.to_string() == value.trim())
            .ok_or_else(|| SessionError::UnknownEntityType(value.to_string()))
    }

    /// Combined strings for the extraction schema enum.
    pub fn combined_names() -> Vec<String> {
        Self::ALL.iter().map(|k| k.to_string()).collect()
    }

    /// Human readable form used in prompts ("political_party organization").
    pub fn describe(&self) -> String {
        match self.entity_subtype {
            Some(subtype) => format!("{} {}", subtype, self.entity_type),
            None => self.entity_type.to_string(),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.entity_subtype {
            Some(subtype) => write!(f, "{}/{}", self.entity_type, subtype),
            None => write!(f, "{}", self.entity_type),
        }
    }
}
