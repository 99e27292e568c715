pub mod error;
pub mod search;

pub use error::{ResolveError, SearchError};
pub use search::{NesSearchClient, RegistrySearch, parse_search_response};

use std::sync::Arc;
use tracing::{info, warn};

use extract::Extractor;
use session::{
    DocumentMetadata, EntityMatchCandidate, EntityMatchState, ExtractionSession, Resolution,
};

/// A top candidate scoring strictly above this is matched without review.
pub const AUTO_MATCH_THRESHOLD: f64 = 0.9;
pub const DEFAULT_CANDIDATE_LIMIT: usize = 5;

/// Result of resolving every entity of a session in one pass.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub resolved: Vec<String>,
    pub failed: Vec<(String, ResolveError)>,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Matches extracted entities against the registry: search, score, decide.
pub struct MatchResolver {
    search: Arc<dyn RegistrySearch>,
    extractor: Arc<Extractor>,
    candidate_limit: usize,
}

impl MatchResolver {
    pub fn new(search: Arc<dyn RegistrySearch>, extractor: Arc<Extractor>) -> Self {
        Self {
            search,
            extractor,
            candidate_limit: DEFAULT_CANDIDATE_LIMIT,
        }
    }

    pub fn with_candidate_limit(mut self, limit: usize) -> Self {
        self.candidate_limit = limit;
        self
    }

    /// Resolve one entity of the session in place. On failure the session is
    /// left exactly as it was.
    pub async fn resolve(
        &self,
        session: &mut ExtractionSession,
        entity_id: &str,
    ) -> Result<EntityMatchState, ResolveError> {
        let entity = session
            .entity(entity_id)
            .cloned()
            .ok_or_else(|| ResolveError::EntityNotFound(entity_id.to_string()))?;

        let resolved = self.resolve_entity(entity, session.metadata.as_ref()).await?;
        session.replace_entity(resolved.clone());
        Ok(resolved)
    }

    pub async fn resolve_entity(
        &self,
        mut entity: EntityMatchState,
        metadata: Option<&DocumentMetadata>,
    ) -> Result<EntityMatchState, ResolveError> {
        let name = entity
            .primary_name()
            .ok_or_else(|| ResolveError::MissingName(entity.entity_id.clone()))?
            .to_string();

        entity.candidates = self
            .search
            .find_matches(&entity.kind, &name, self.candidate_limit)
            .await?;

        let (mut candidates, proposed_changes) = self
            .extractor
            .resolve_entity_candidates(&entity, metadata)
            .await?;

        sort_candidates(&mut candidates);
        entity.resolution = decide(&candidates);
        entity.candidates = candidates;
        entity.proposed_changes = proposed_changes;

        info!(
            entity_id = %entity.entity_id,
            name = %name,
            candidates = entity.candidates.len(),
            status = %entity.status(),
            "Entity resolved"
        );
        Ok(entity)
    }

    /// Resolve every entity one after another. A failure is recorded against
    /// its entity and leaves that entity unchanged; the others still resolve.
    pub async fn resolve_all(&self, session: &mut ExtractionSession) -> BatchReport {
        let ids: Vec<String> = session.entities.iter().map(|e| e.entity_id.clone()).collect();
        let mut report = BatchReport::default();

        for id in ids {
            match self.resolve(session, &id).await {
                Ok(_) => report.resolved.push(id),
                Err(e) => {
                    warn!(entity_id = %id, error = %e, "Entity resolution failed");
                    report.failed.push((id, e));
                }
            }
        }
        report
    }
}

/// Highest confidence first. Unscored candidates count as zero and ties keep
/// search order.
pub fn sort_candidates(candidates: &mut [EntityMatchCandidate]) {
    candidates.sort_by(|a, b| {
        b.confidence
            .unwrap_or(0.0)
            .total_cmp(&a.confidence.unwrap_or(0.0))
    });
}

/// Resolution for candidates already sorted by [`sort_candidates`].
pub fn decide(candidates: &[EntityMatchCandidate]) -> Resolution {
    match candidates.first() {
        None => Resolution::CreateNew,
        Some(top) if top.confidence.is_some_and(|c| c > AUTO_MATCH_THRESHOLD) => {
            Resolution::Matched {
                nes_id: top.nes_id.clone(),
            }
        }
        Some(_) => Resolution::NeedsReview,
    }
}
