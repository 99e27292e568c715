//! Outward operations consumed by the HTTP layer. Requests that break a
//! precondition are rejected before anything is written.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use session::{
    Author, Conversation, ConversationKey, DocumentMetadata, EntityMatchState, ExtractionSession,
    ProgressSummary, ResolutionStatus, ReviewAction,
};

use crate::error::PipelineError;
use crate::gate::{ChangeSink, build_changes};
use crate::jobs::{fail_session, remove_document};
use crate::lock::{LockPolicy, begin_locked, with_session_lock};
use crate::queue::{Job, TaskQueue};
use crate::record::{BackgroundTask, SessionStatus, StoredSession, TaskStatus, TaskType};
use crate::store::SessionStore;

/// Upload extensions accepted by [`PipelineService::create_session`].
pub const ALLOWED_EXTENSIONS: &[&str] = &["txt", "md", "doc", "docx", "pdf"];

/// Everything a reviewer needs to see about one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub id: Uuid,
    pub status: SessionStatus,
    pub error_message: Option<String>,
    pub progress: ProgressSummary,
    pub document_name: Option<String>,
    pub guidance: Option<String>,
    pub metadata: Option<DocumentMetadata>,
    pub entities: Vec<EntityMatchState>,
    pub conversations: BTreeMap<String, Conversation>,
    pub tasks: Vec<BackgroundTask>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionView {
    fn from_record(record: StoredSession, session: ExtractionSession) -> Self {
        Self {
            id: record.id,
            status: record.status,
            error_message: record.error_message,
            progress: record.progress,
            document_name: record
                .document
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
            guidance: session.guidance,
            metadata: session.metadata,
            entities: session.entities,
            conversations: session.conversations,
            tasks: record.tasks,
            created_by: record.created_by,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PostedMessage {
    pub message_id: String,
    /// Set when the message queued an entity update.
    pub task_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersistOutcome {
    pub change_ids: Vec<Uuid>,
}

pub fn validate_document(path: &Path) -> Result<(), PipelineError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match extension {
        Some(ext) if ALLOWED_EXTENSIONS.contains(&ext.as_str()) => Ok(()),
        _ => Err(PipelineError::Precondition(format!(
            "File type not allowed: {}. Allowed: .txt, .md, .doc, .docx, .pdf",
            path.display()
        ))),
    }
}

fn require_status(record: &StoredSession, expected: SessionStatus) -> Result<(), PipelineError> {
    if record.status == expected {
        Ok(())
    } else {
        Err(PipelineError::Precondition(format!(
            "Session must be {} for this operation, currently {}",
            expected, record.status
        )))
    }
}

fn entity_at(
    session: &mut ExtractionSession,
    index: usize,
) -> Result<&mut EntityMatchState, PipelineError> {
    let total = session.entities.len();
    session.entities.get_mut(index).ok_or_else(|| {
        PipelineError::EntityNotFound(format!("index {} (session has {} entities)", index, total))
    })
}

pub struct PipelineService {
    store: Arc<dyn SessionStore>,
    queue: Arc<dyn TaskQueue>,
    sink: Arc<dyn ChangeSink>,
    lock: LockPolicy,
}

impl PipelineService {
    pub fn new(
        store: Arc<dyn SessionStore>,
        queue: Arc<dyn TaskQueue>,
        sink: Arc<dyn ChangeSink>,
        lock: LockPolicy,
    ) -> Self {
        Self {
            store,
            queue,
            sink,
            lock,
        }
    }

    /// Register an uploaded document and queue its background research.
    pub async fn create_session(
        &self,
        document: PathBuf,
        guidance: Option<String>,
        created_by: Option<String>,
    ) -> Result<StoredSession, PipelineError> {
        validate_document(&document)?;

        let session = ExtractionSession::new(Some(document.clone()), guidance);
        let mut record = StoredSession::new(document, &session, created_by)?;
        let task_id = record.add_task(TaskType::ExtractMetadata, None);
        let session_id = record.id;
        self.store.insert(record).await?;
        info!(session_id = %session_id, "Session created");

        let job = Job::BackgroundResearch {
            session_id,
            task_id,
        };
        if let Err(e) = self.submit(session_id, task_id, job).await {
            let message = format!("Failed to queue background research: {}", e);
            fail_session(self.store.as_ref(), &self.lock, session_id, Some(task_id), &message).await;
            return Err(e);
        }

        Ok(self.store.get(session_id).await?)
    }

    pub async fn get_session(&self, session_id: Uuid) -> Result<SessionView, PipelineError> {
        let record = self.store.get(session_id).await?;
        let session = record.session()?;
        Ok(SessionView::from_record(record, session))
    }

    pub async fn progress(&self, session_id: Uuid) -> Result<ProgressSummary, PipelineError> {
        Ok(self.store.get(session_id).await?.progress)
    }

    /// Apply a reviewer decision to the entity at `index`.
    pub async fn resolve_entity(
        &self,
        session_id: Uuid,
        index: usize,
        action: ReviewAction,
    ) -> Result<ResolutionStatus, PipelineError> {
        let status = with_session_lock(self.store.as_ref(), session_id, &self.lock, |record| {
            require_status(record, SessionStatus::AwaitingReview)?;
            let mut session = record.session()?;
            let status = entity_at(&mut session, index)?.apply_review(&action)?;
            record.store_session(&session)?;
            Ok(status)
        })
        .await?;

        info!(session_id = %session_id, index, status = %status, "Entity reviewed");
        Ok(status)
    }

    /// Remove the entity at `index` together with its conversation.
    pub async fn delete_entity(
        &self,
        session_id: Uuid,
        index: usize,
    ) -> Result<ProgressSummary, PipelineError> {
        let progress = with_session_lock(self.store.as_ref(), session_id, &self.lock, |record| {
            require_status(record, SessionStatus::AwaitingReview)?;
            let mut session = record.session()?;
            let entity_id = entity_at(&mut session, index)?.entity_id.clone();
            session.entities.remove(index);
            session
                .conversations
                .remove(&ConversationKey::Entity(entity_id).to_string());
            record.store_session(&session)?;
            Ok(record.progress)
        })
        .await?;

        info!(session_id = %session_id, index, "Entity deleted");
        Ok(progress)
    }

    /// Append a reviewer message to a conversation. Messages on an entity
    /// conversation also queue an update of that entity.
    pub async fn post_message(
        &self,
        session_id: Uuid,
        key: &str,
        text: &str,
    ) -> Result<PostedMessage, PipelineError> {
        let key: ConversationKey = key.parse()?;
        let text = text.trim();
        if text.is_empty() {
            return Err(PipelineError::Precondition("Message text is required".into()));
        }

        let posted = with_session_lock(self.store.as_ref(), session_id, &self.lock, |record| {
            if record.status.is_terminal() {
                return Err(PipelineError::Precondition(format!(
                    "Session is already {}",
                    record.status
                )));
            }
            let mut session = record.session()?;

            let task_id = match &key {
                ConversationKey::Entity(entity_id) => {
                    require_status(record, SessionStatus::AwaitingReview)?;
                    if session.entity(entity_id).is_none() {
                        return Err(PipelineError::EntityNotFound(entity_id.clone()));
                    }
                    Some(record.add_task(TaskType::UpdateEntity, Some(entity_id.clone())))
                }
                _ => None,
            };

            let conversation = session.get_conversation(&key);
            conversation.add(Author::User, text);
            let message_id = format!("msg_{}_{}_{}", record.id, key, conversation.len());
            record.store_session(&session)?;

            Ok(PostedMessage {
                message_id,
                task_id,
            })
        })
        .await?;

        if let (Some(task_id), ConversationKey::Entity(entity_id)) = (posted.task_id, &key) {
            let job = Job::UpdateEntity {
                session_id,
                task_id,
                entity_id: entity_id.clone(),
            };
            if let Err(e) = self.submit(session_id, task_id, job).await {
                self.abandon_task(session_id, task_id).await;
                return Err(e);
            }
        }

        info!(session_id = %session_id, message_id = %posted.message_id, "Message posted");
        Ok(posted)
    }

    /// Extract the entity list again and re-run resolution for every entity.
    pub async fn reextract_entities(&self, session_id: Uuid) -> Result<Uuid, PipelineError> {
        let task_id = with_session_lock(self.store.as_ref(), session_id, &self.lock, |record| {
            require_status(record, SessionStatus::AwaitingReview)?;
            if record.session()?.metadata.is_none() {
                return Err(PipelineError::Precondition(
                    "Metadata must be extracted before entities".into(),
                ));
            }
            let task_id = record.add_task(TaskType::ExtractEntities, None);
            record.set_status(SessionStatus::ProcessingEntities);
            Ok(task_id)
        })
        .await?;

        let job = Job::ReextractEntities {
            session_id,
            task_id,
        };
        if let Err(e) = self.submit(session_id, task_id, job).await {
            let message = format!("Failed to queue entity extraction: {}", e);
            fail_session(self.store.as_ref(), &self.lock, session_id, Some(task_id), &message).await;
            return Err(e);
        }

        info!(session_id = %session_id, "Entity re-extraction queued");
        Ok(task_id)
    }

    /// Write the reviewed entities to the change queue and complete the
    /// session. The row stays locked until the outcome is recorded, so
    /// nothing can change the entities in between.
    pub async fn request_persistence(
        &self,
        session_id: Uuid,
        description: &str,
        approved_by: Option<&str>,
    ) -> Result<PersistOutcome, PipelineError> {
        let mut txn = begin_locked(self.store.as_ref(), session_id, &self.lock).await?;
        let record = txn.record();
        require_status(record, SessionStatus::AwaitingReview)?;
        let changes = build_changes(&record.session()?)?;

        match self
            .sink
            .queue_changes(&changes, description, approved_by)
            .await
        {
            Ok(change_ids) => {
                let record = txn.record();
                record.set_status(SessionStatus::Completed);
                let document = record.document.clone();
                txn.commit().await?;

                remove_document(&document).await;
                info!(session_id = %session_id, changes = change_ids.len(), "Session persisted");
                Ok(PersistOutcome { change_ids })
            }
            Err(e) => {
                drop(txn);
                let message = format!("Persistence failed: {}", e);
                fail_session(self.store.as_ref(), &self.lock, session_id, None, &message).await;
                Err(e.into())
            }
        }
    }

    async fn submit(&self, session_id: Uuid, task_id: Uuid, job: Job) -> Result<(), PipelineError> {
        let job_id = self.queue.submit(job).await?;
        with_session_lock(self.store.as_ref(), session_id, &self.lock, |record| {
            record.set_job_id(task_id, &job_id);
            Ok(())
        })
        .await
    }

    async fn abandon_task(&self, session_id: Uuid, task_id: Uuid) {
        let result = with_session_lock(self.store.as_ref(), session_id, &self.lock, |record| {
            record.set_task_status(task_id, TaskStatus::Failed);
            Ok(())
        })
        .await;
        if let Err(e) = result {
            warn!(session_id = %session_id, task_id = %task_id, error = %e, "Failed to mark task failed");
        }
    }
}
