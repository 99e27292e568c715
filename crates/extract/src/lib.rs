pub mod error;
pub mod llm;
pub mod prompt;
pub mod retry;
pub mod schema;

pub use error::{ExtractionError, ProviderError};
pub use llm::{OllamaClient, StructuredExtractor};
pub use prompt::ExtractionTask;
pub use retry::RetryPolicy;

use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use session::{
    Conversation, ConversationKey, DocumentMetadata, DocumentType, EntityKind,
    EntityMatchCandidate, EntityMatchState, EntityName, ExtractionSession, ResolvedEntity,
    parse_publication_date,
};

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    /// Retries after the first attempt.
    pub max_retries: usize,
    /// Wall-clock limit for a single provider call.
    pub timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: Duration::from_secs(60),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Outcome of one provider attempt inside the retry loop.
enum Attempt {
    Provider(ProviderError),
    Fatal(ExtractionError),
}

impl fmt::Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attempt::Provider(e) => write!(f, "{}", e),
            Attempt::Fatal(e) => write!(f, "{}", e),
        }
    }
}

#[derive(Deserialize)]
struct RawMetadata {
    title: Option<String>,
    summary: Option<String>,
    author: Option<String>,
    publication_date: Option<String>,
    document_type: Option<DocumentType>,
    source: Option<String>,
}

#[derive(Deserialize)]
struct RawEntity {
    entity_type: String,
    #[serde(default)]
    names: Vec<EntityName>,
    #[serde(default)]
    attributes: Map<String, Value>,
    #[serde(default)]
    mentions: Vec<String>,
}

#[derive(Deserialize)]
struct CandidateScore {
    nes_id: String,
    confidence: f64,
    reasoning: Option<String>,
}

/// AI-backed extraction. Every call goes through one primitive that bounds the
/// call with a timeout, retries provider failures with backoff, and rejects
/// responses that do not match the requested schema.
pub struct Extractor {
    provider: Arc<dyn StructuredExtractor>,
    config: ExtractorConfig,
    retry: RetryPolicy,
}

impl Extractor {
    pub fn new(provider: Arc<dyn StructuredExtractor>, config: ExtractorConfig) -> Self {
        let retry = RetryPolicy::new(
            config.max_retries,
            config.initial_backoff.as_millis() as u64,
            config.max_backoff.as_millis() as u64,
        );
        Self {
            provider,
            config,
            retry,
        }
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Extract metadata and a first entity pass from `document`, storing both
    /// (and the document path) on the session.
    pub async fn extract_metadata(
        &self,
        document: &Path,
        session: &mut ExtractionSession,
    ) -> Result<(DocumentMetadata, Vec<EntityMatchState>), ExtractionError> {
        info!(document = %document.display(), "Starting metadata extraction");

        let content = read_document(document).await?;
        let conversation = session
            .get_conversation(&ConversationKey::MetadataExtraction)
            .clone();

        let system = prompt::build_system_prompt(
            ExtractionTask::Metadata,
            session.guidance.as_deref(),
            None,
            None,
        );
        let user = prompt::build_prompt(
            ExtractionTask::Metadata,
            &content,
            session.guidance.as_deref(),
            Some(&conversation),
            None,
            None,
        );

        let raw = self
            .extract_with_ai("extract_metadata", &user, &system, &schema::extraction_schema())
            .await?;

        let mut metadata = parse_metadata(&raw["metadata"])?;
        metadata.file_name = document
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
        metadata.file_size = tokio::fs::metadata(document).await.ok().map(|m| m.len());

        let entities = parse_entities(&raw["entities"])?;

        session.metadata = Some(metadata.clone());
        session.entities = entities.clone();
        session.source_document = Some(document.to_path_buf());

        info!(
            document = %document.display(),
            entities = entities.len(),
            "Metadata extraction complete"
        );
        Ok((metadata, entities))
    }

    /// Re-run entity extraction with the existing metadata and the
    /// entity-extraction conversation as context. Replaces the session's entities.
    pub async fn extract_entities(
        &self,
        document: &Path,
        session: &mut ExtractionSession,
    ) -> Result<Vec<EntityMatchState>, ExtractionError> {
        let metadata = session.metadata.clone().ok_or_else(|| {
            ExtractionError::Precondition("Metadata must be extracted before entities".to_string())
        })?;

        info!(document = %document.display(), "Starting entity extraction");

        let content = read_document(document).await?;
        let conversation = session
            .get_conversation(&ConversationKey::EntityExtraction)
            .clone();

        let system = prompt::build_system_prompt(
            ExtractionTask::Entities,
            session.guidance.as_deref(),
            Some(&metadata),
            None,
        );
        let user = prompt::build_prompt(
            ExtractionTask::Entities,
            &content,
            session.guidance.as_deref(),
            Some(&conversation),
            Some(&metadata),
            None,
        );

        let raw = self
            .extract_with_ai("extract_entities", &user, &system, &schema::entities_schema())
            .await?;
        let entities = parse_entities(&raw["entities"])?;
        session.entities = entities.clone();

        info!(
            document = %document.display(),
            entities = entities.len(),
            "Entity extraction complete"
        );
        Ok(entities)
    }

    /// Score the entity's candidates and diff against the best one, or, when it
    /// has none, synthesize the data for a new registry record. Candidates come
    /// back in their original order.
    pub async fn resolve_entity_candidates(
        &self,
        entity: &EntityMatchState,
        metadata: Option<&DocumentMetadata>,
    ) -> Result<(Vec<EntityMatchCandidate>, Map<String, Value>), ExtractionError> {
        let entity_context = json!({
            "entity_type": entity.kind.to_string(),
            "resolved_entity": entity.resolved_entity,
        });
        let metadata_context = metadata
            .and_then(|m| serde_json::to_value(m).ok())
            .unwrap_or_else(|| json!({}));

        if entity.candidates.is_empty() {
            info!(entity_id = %entity.entity_id, "Generating new entity data");

            let system = prompt::build_new_entity_system_prompt(&entity.kind);
            let user = prompt::build_new_entity_prompt(&entity_context, &metadata_context);
            let raw = self
                .extract_with_ai(
                    "generate_new_entity",
                    &user,
                    &system,
                    &schema::proposed_changes_schema(&entity.kind),
                )
                .await?;

            return Ok((Vec::new(), into_object(raw)));
        }

        info!(
            entity_id = %entity.entity_id,
            candidates = entity.candidates.len(),
            "Evaluating candidates"
        );

        let candidates_context: Vec<Value> = entity
            .candidates
            .iter()
            .map(|c| {
                json!({
                    "nes_id": c.nes_id,
                    "initial_confidence": c.confidence,
                    "candidate_details": c.nes_record,
                })
            })
            .collect();

        let system = prompt::build_evaluate_candidates_system_prompt(&entity.kind);
        let user = prompt::build_evaluate_candidates_prompt(
            &entity_context,
            &Value::Array(candidates_context),
            &metadata_context,
        );
        let mut raw = self
            .extract_with_ai(
                "evaluate_candidates",
                &user,
                &system,
                &schema::candidate_evaluation_schema(&entity.kind),
            )
            .await?;

        let scores: Vec<CandidateScore> = serde_json::from_value(raw["candidates"].take())
            .map_err(|e| ExtractionError::InvalidShape(e.to_string()))?;

        let candidates = entity
            .candidates
            .iter()
            .cloned()
            .map(|mut candidate| {
                if let Some(score) = scores.iter().find(|s| s.nes_id == candidate.nes_id) {
                    candidate.confidence = Some(score.confidence);
                    candidate.reasoning = score.reasoning.clone();
                }
                candidate
            })
            .collect();

        Ok((candidates, into_object(raw["proposed_changes"].take())))
    }

    /// Refine one entity from the reviewer conversation. The returned entity keeps
    /// the original id and resolution; a changed kind sends it back to review.
    pub async fn update_entity(
        &self,
        entity: &EntityMatchState,
        session: &ExtractionSession,
        conversation: &Conversation,
    ) -> Result<EntityMatchState, ExtractionError> {
        let document = session.source_document.as_deref().ok_or_else(|| {
            ExtractionError::Precondition("No document available for entity update".to_string())
        })?;

        info!(entity_id = %entity.entity_id, "Starting entity update");

        let content = read_document(document).await?;
        let system = prompt::build_system_prompt(
            ExtractionTask::EntityUpdate,
            session.guidance.as_deref(),
            None,
            Some(entity),
        );
        let user = prompt::build_prompt(
            ExtractionTask::EntityUpdate,
            &content,
            session.guidance.as_deref(),
            Some(conversation),
            None,
            Some(entity),
        );

        let raw = self
            .extract_with_ai("update_entity", &user, &system, &schema::entities_schema())
            .await?;
        let updated = parse_entities(&raw["entities"])?
            .into_iter()
            .next()
            .ok_or_else(|| {
                ExtractionError::InvalidShape("No updated entity returned".to_string())
            })?;

        let mut refined = entity.clone();
        if refined.apply_update(updated.kind, updated.resolved_entity) {
            warn!(
                entity_id = %entity.entity_id,
                from = %entity.kind,
                to = %refined.kind,
                "Entity kind changed, resolution reset to review"
            );
        }
        info!(entity_id = %entity.entity_id, kind = %refined.kind, "Entity update complete");
        Ok(refined)
    }

    async fn extract_with_ai(
        &self,
        operation: &str,
        user_prompt: &str,
        system_prompt: &str,
        response_schema: &Value,
    ) -> Result<Value, ExtractionError> {
        debug!(operation, prompt_bytes = user_prompt.len(), "Calling model provider");

        let provider = self.provider.as_ref();
        let timeout = self.config.timeout;

        let result = self
            .retry
            .retry_if(
                operation,
                |attempt: &Attempt| matches!(attempt, Attempt::Provider(_)),
                move || async move {
                    let value = match tokio::time::timeout(
                        timeout,
                        provider.extract_structured_data(user_prompt, response_schema, system_prompt),
                    )
                    .await
                    {
                        Err(_) => return Err(Attempt::Fatal(ExtractionError::Timeout(timeout))),
                        Ok(Err(e)) => return Err(Attempt::Provider(e)),
                        Ok(Ok(value)) => value,
                    };

                    if !value.is_object() {
                        return Err(Attempt::Fatal(ExtractionError::InvalidShape(format!(
                            "expected a JSON object, got {}",
                            value
                        ))));
                    }
                    schema::validate(response_schema, &value)
                        .map_err(|e| Attempt::Fatal(ExtractionError::InvalidShape(e)))?;
                    Ok(value)
                },
            )
            .await;

        result.map_err(|attempt| match attempt {
            Attempt::Provider(source) => ExtractionError::Unavailable {
                attempts: self.retry.max_attempts(),
                source,
            },
            Attempt::Fatal(e) => {
                warn!(operation, error = %e, "Extraction failed without retry");
                e
            }
        })
    }
}

async fn read_document(path: &Path) -> Result<String, ExtractionError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ExtractionError::Document {
            path: path.to_path_buf(),
            source,
        })
}

fn into_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn parse_metadata(raw: &Value) -> Result<DocumentMetadata, ExtractionError> {
    let raw: RawMetadata = serde_json::from_value(raw.clone())
        .map_err(|e| ExtractionError::InvalidShape(format!("metadata: {}", e)))?;

    let publication_date = raw.publication_date.as_deref().and_then(|value| {
        let parsed = parse_publication_date(value);
        if parsed.is_none() {
            warn!(value, "Dropping unparseable publication date");
        }
        parsed
    });

    Ok(DocumentMetadata {
        file_name: None,
        file_size: None,
        title: raw.title,
        summary: raw.summary,
        author: raw.author,
        publication_date,
        document_type: raw.document_type,
        source: raw.source,
    })
}

/// Turn model output into fresh, unresolved entities. Unknown types and
/// nameless entities are rejected rather than dropped.
fn parse_entities(raw: &Value) -> Result<Vec<EntityMatchState>, ExtractionError> {
    let raw: Vec<RawEntity> = serde_json::from_value(raw.clone())
        .map_err(|e| ExtractionError::InvalidShape(format!("entities: {}", e)))?;

    raw.into_iter()
        .map(|entity| {
            let kind = EntityKind::parse(&entity.entity_type)?;
            if entity.names.is_empty() {
                return Err(ExtractionError::InvalidShape(format!(
                    "{} entity without names",
                    kind
                )));
            }
            Ok(EntityMatchState::new(
                kind,
                ResolvedEntity {
                    names: entity.names,
                    attributes: entity.attributes,
                    mentions: entity.mentions,
                },
            ))
        })
        .collect()
}
