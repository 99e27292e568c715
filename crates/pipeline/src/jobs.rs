//! Background jobs. Each job reads the session, does its slow work with no
//! lock held, then applies the result in one locked write against the
//! current row.

use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use extract::Extractor;
use resolve::{MatchResolver, ResolveError};
use session::{Author, ConversationKey, ExtractionSession, ResolutionStatus};

use crate::error::PipelineError;
use crate::lock::{LockPolicy, with_session_lock};
use crate::queue::{Job, TaskQueue};
use crate::record::{SessionStatus, StoredSession, TaskStatus, TaskType};
use crate::store::SessionStore;

/// What a finished task did to the session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanIn {
    /// The session was already terminal; nothing was written.
    Ignored,
    Waiting(usize),
    /// This task was the last one and moved the session to review.
    EnteredReview,
}

/// Mark `task_id` finished and, if no task is left running while entities are
/// being processed, move the session to review. Must run under the row lock.
pub fn finish_task(record: &mut StoredSession, task_id: Uuid, status: TaskStatus) -> FanIn {
    if !record.set_task_status(task_id, status) {
        warn!(session_id = %record.id, task_id = %task_id, "Finished task is not recorded on the session");
    }

    let remaining = record.active_tasks();
    if remaining == 0 && record.status == SessionStatus::ProcessingEntities {
        record.set_status(SessionStatus::AwaitingReview);
        FanIn::EnteredReview
    } else {
        FanIn::Waiting(remaining)
    }
}

/// Delete the uploaded document. A file that is already gone is fine.
pub async fn remove_document(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => info!(document = %path.display(), "Source document removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(document = %path.display(), "Source document already removed")
        }
        Err(e) => warn!(document = %path.display(), error = %e, "Failed to remove source document"),
    }
}

/// Mark the session FAILED with `message` and remove its document. Never
/// fails: a vanished or already terminal session is logged and left alone.
pub async fn fail_session(
    store: &dyn SessionStore,
    lock: &LockPolicy,
    session_id: Uuid,
    task_id: Option<Uuid>,
    message: &str,
) {
    error!(session_id = %session_id, error = message, "Marking session failed");

    let result = with_session_lock(store, session_id, lock, |record| {
        if record.status.is_terminal() {
            return Ok(None);
        }
        if let Some(task_id) = task_id {
            record.set_task_status(task_id, TaskStatus::Failed);
        }
        record.mark_failed(message);
        Ok(Some(record.document.clone()))
    })
    .await;

    match result {
        Ok(Some(document)) => remove_document(&document).await,
        Ok(None) => info!(session_id = %session_id, "Session already finished, not marking failed"),
        Err(PipelineError::SessionNotFound(_)) => {
            warn!(session_id = %session_id, "Session vanished before it could be marked failed")
        }
        Err(e) => error!(session_id = %session_id, error = %e, "Failed to mark session failed"),
    }
}

fn resolution_error(e: ResolveError) -> PipelineError {
    match e {
        ResolveError::EntityNotFound(id) => PipelineError::EntityNotFound(id),
        other => PipelineError::Resolution(other),
    }
}

pub struct JobRunner {
    store: Arc<dyn SessionStore>,
    extractor: Arc<Extractor>,
    resolver: Arc<MatchResolver>,
    queue: Arc<dyn TaskQueue>,
    lock: LockPolicy,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn SessionStore>,
        extractor: Arc<Extractor>,
        resolver: Arc<MatchResolver>,
        queue: Arc<dyn TaskQueue>,
        lock: LockPolicy,
    ) -> Self {
        Self {
            store,
            extractor,
            resolver,
            queue,
            lock,
        }
    }

    /// Execute one job. Jobs for finished sessions and redelivered jobs whose
    /// task already finished do nothing.
    pub async fn run(&self, job: Job) -> Result<(), PipelineError> {
        let record = self.store.get(job.session_id()).await.map_err(|e| {
            error!(session_id = %job.session_id(), job = job.name(), error = %e, "Session not loaded");
            PipelineError::from(e)
        })?;

        if record.status.is_terminal() {
            info!(session_id = %record.id, job = job.name(), status = %record.status, "Session already finished, skipping job");
            return Ok(());
        }
        if let Some(task) = record.task(job.task_id()) {
            if !task.status.is_active() {
                info!(session_id = %record.id, job = job.name(), task_id = %task.task_id, "Task already finished, skipping job");
                return Ok(());
            }
        }

        match job {
            Job::BackgroundResearch { task_id, .. } => self.background_research(record, task_id).await,
            Job::ResolveEntity {
                task_id, entity_id, ..
            } => self.resolve_entity(record, task_id, &entity_id).await,
            Job::UpdateEntity {
                task_id, entity_id, ..
            } => self.update_entity(record, task_id, &entity_id).await,
            Job::ReextractEntities { task_id, .. } => self.reextract_entities(record, task_id).await,
        }
    }

    async fn background_research(
        &self,
        record: StoredSession,
        task_id: Uuid,
    ) -> Result<(), PipelineError> {
        info!(session_id = %record.id, "Starting background research");
        let result = self.research(&record, task_id).await;
        self.fail_on_error(record.id, task_id, "Background research", result)
            .await
    }

    async fn research(&self, record: &StoredSession, task_id: Uuid) -> Result<(), PipelineError> {
        with_session_lock(self.store.as_ref(), record.id, &self.lock, |record| {
            record.set_status(SessionStatus::ProcessingMetadata);
            record.set_task_status(task_id, TaskStatus::Running);
            Ok(())
        })
        .await?;

        let mut session = record.session()?;
        self.extractor
            .extract_metadata(&record.document, &mut session)
            .await?;
        self.fan_out(record.id, task_id, &session).await
    }

    async fn reextract_entities(
        &self,
        record: StoredSession,
        task_id: Uuid,
    ) -> Result<(), PipelineError> {
        info!(session_id = %record.id, "Starting entity re-extraction");
        let result = self.reextract(&record, task_id).await;
        self.fail_on_error(record.id, task_id, "Entity extraction", result)
            .await
    }

    async fn reextract(&self, record: &StoredSession, task_id: Uuid) -> Result<(), PipelineError> {
        self.mark_running(record.id, task_id).await?;
        let mut session = record.session()?;
        self.extractor
            .extract_entities(&record.document, &mut session)
            .await?;
        self.fan_out(record.id, task_id, &session).await
    }

    async fn fail_on_error(
        &self,
        session_id: Uuid,
        task_id: Uuid,
        stage: &str,
        result: Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        match result {
            Ok(()) => Ok(()),
            Err(e @ PipelineError::SessionNotFound(_)) => {
                warn!(session_id = %session_id, "Session vanished during {}", stage);
                Err(e)
            }
            Err(e) => {
                let message = format!("{} failed: {}", stage, e);
                fail_session(self.store.as_ref(), &self.lock, session_id, Some(task_id), &message)
                    .await;
                Err(e)
            }
        }
    }

    /// Save freshly extracted metadata and entities, finish the extraction task
    /// and queue one resolution job per entity. The resolution tasks are
    /// registered in the same write that enters PROCESSING_ENTITIES, before
    /// any job is submitted.
    async fn fan_out(
        &self,
        session_id: Uuid,
        extraction_task: Uuid,
        extracted: &ExtractionSession,
    ) -> Result<(), PipelineError> {
        let registered = with_session_lock(self.store.as_ref(), session_id, &self.lock, |record| {
            if record.status.is_terminal() {
                return Ok(Vec::new());
            }

            let mut current = record.session()?;
            current.metadata = extracted.metadata.clone();
            current.entities = extracted.entities.clone();
            if extracted.source_document.is_some() {
                current.source_document = extracted.source_document.clone();
            }
            record.store_session(&current)?;
            record.set_task_status(extraction_task, TaskStatus::Completed);

            let tasks: Vec<(Uuid, String)> = current
                .entities
                .iter()
                .map(|entity| {
                    let task_id =
                        record.add_task(TaskType::UpdateEntity, Some(entity.entity_id.clone()));
                    (task_id, entity.entity_id.clone())
                })
                .collect();

            if tasks.is_empty() && record.active_tasks() == 0 {
                record.set_status(SessionStatus::AwaitingReview);
            } else {
                record.set_status(SessionStatus::ProcessingEntities);
            }
            Ok(tasks)
        })
        .await?;

        if registered.is_empty() {
            info!(session_id = %session_id, "No entities extracted, session ready for review");
            return Ok(());
        }

        let mut submitted = Vec::with_capacity(registered.len());
        for (task_id, entity_id) in registered {
            let job_id = self
                .queue
                .submit(Job::ResolveEntity {
                    session_id,
                    task_id,
                    entity_id,
                })
                .await?;
            submitted.push((task_id, job_id));
        }

        with_session_lock(self.store.as_ref(), session_id, &self.lock, |record| {
            for (task_id, job_id) in &submitted {
                record.set_job_id(*task_id, job_id);
            }
            Ok(())
        })
        .await?;

        info!(session_id = %session_id, jobs = submitted.len(), "Entity resolution jobs queued");
        Ok(())
    }

    async fn mark_running(&self, session_id: Uuid, task_id: Uuid) -> Result<(), PipelineError> {
        with_session_lock(self.store.as_ref(), session_id, &self.lock, |record| {
            if record.task(task_id).is_some_and(|t| t.status == TaskStatus::Queued) {
                record.set_task_status(task_id, TaskStatus::Running);
            }
            Ok(())
        })
        .await
    }

    /// Resolve one entity, then record the outcome and run the fan-in check
    /// under the lock. A failed resolution marks the task FAILED and leaves
    /// the entity for the reviewer; the session itself keeps going.
    async fn resolve_entity(
        &self,
        record: StoredSession,
        task_id: Uuid,
        entity_id: &str,
    ) -> Result<(), PipelineError> {
        let session_id = record.id;
        self.mark_running(session_id, task_id).await?;

        let mut session = record.session()?;
        let outcome = self.resolver.resolve(&mut session, entity_id).await;
        let resolved = outcome.as_ref().ok().cloned();
        let task_status = if resolved.is_some() {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };

        let fan_in = with_session_lock(self.store.as_ref(), session_id, &self.lock, |record| {
            if record.status.is_terminal() {
                return Ok(FanIn::Ignored);
            }
            if let Some(entity) = &resolved {
                let mut current = record.session()?;
                let pending = current
                    .entity(entity_id)
                    .is_some_and(|e| e.status() == ResolutionStatus::Pending);
                if pending && current.replace_entity(entity.clone()) {
                    record.store_session(&current)?;
                } else {
                    warn!(session_id = %session_id, entity_id, "Resolved entity no longer pending in session");
                }
            }
            Ok(finish_task(record, task_id, task_status))
        })
        .await?;

        match fan_in {
            FanIn::EnteredReview => {
                info!(session_id = %session_id, "All entity tasks finished, session awaiting review")
            }
            FanIn::Waiting(remaining) => {
                debug!(session_id = %session_id, entity_id, remaining, "Entity task finished")
            }
            FanIn::Ignored => {}
        }

        outcome.map(|_| ()).map_err(resolution_error)
    }

    /// Refine one entity from its reviewer conversation. Failure is reported
    /// to the caller and does not fail the session.
    async fn update_entity(
        &self,
        record: StoredSession,
        task_id: Uuid,
        entity_id: &str,
    ) -> Result<(), PipelineError> {
        let session_id = record.id;
        self.mark_running(session_id, task_id).await?;

        let session = record.session()?;
        let key = ConversationKey::Entity(entity_id.to_string());
        let outcome = match session.entity(entity_id) {
            None => Err(PipelineError::EntityNotFound(entity_id.to_string())),
            Some(entity) => {
                let conversation = session.conversation(&key).cloned().unwrap_or_default();
                self.extractor
                    .update_entity(entity, &session, &conversation)
                    .await
                    .map_err(PipelineError::from)
            }
        };
        let updated = outcome.as_ref().ok().cloned();
        let task_status = if updated.is_some() {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };

        with_session_lock(self.store.as_ref(), session_id, &self.lock, |record| {
            if record.status.is_terminal() {
                return Ok(FanIn::Ignored);
            }
            if let Some(refined) = &updated {
                // merge into the entity as it is now; a review decision made
                // during the model call must survive
                let mut current = record.session()?;
                if let Some(entity) = current.entity_mut(entity_id) {
                    if entity.apply_update(refined.kind, refined.resolved_entity.clone()) {
                        warn!(
                            session_id = %session_id,
                            entity_id,
                            kind = %entity.kind,
                            "Entity kind changed, resolution reset to review"
                        );
                    }
                    let note = format!(
                        "Updated {} entity {}",
                        entity.kind,
                        entity.primary_name().unwrap_or(entity_id)
                    );
                    current.get_conversation(&key).add(Author::Ai, note);
                    record.store_session(&current)?;
                }
            }
            Ok(finish_task(record, task_id, task_status))
        })
        .await?;

        match &outcome {
            Ok(_) => info!(session_id = %session_id, entity_id, "Entity updated"),
            Err(e) => warn!(session_id = %session_id, entity_id, error = %e, "Entity update failed"),
        }
        outcome.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemorySessionStore;

    fn processing_record(tasks: usize) -> (StoredSession, Vec<Uuid>) {
        let mut record =
            StoredSession::new("doc.txt".into(), &ExtractionSession::default(), None).unwrap();
        record.set_status(SessionStatus::ProcessingEntities);
        let ids = (0..tasks)
            .map(|i| record.add_task(TaskType::UpdateEntity, Some(format!("entity{}", i))))
            .collect();
        (record, ids)
    }

    #[test]
    fn test_last_task_enters_review_once() {
        let (mut record, tasks) = processing_record(3);

        assert_eq!(finish_task(&mut record, tasks[2], TaskStatus::Completed), FanIn::Waiting(2));
        assert_eq!(finish_task(&mut record, tasks[0], TaskStatus::Failed), FanIn::Waiting(1));
        assert_eq!(finish_task(&mut record, tasks[1], TaskStatus::Completed), FanIn::EnteredReview);
        assert_eq!(record.status, SessionStatus::AwaitingReview);

        // a redelivered completion does not re-enter review
        assert_eq!(finish_task(&mut record, tasks[1], TaskStatus::Completed), FanIn::Waiting(0));
        assert_eq!(record.times_entered(SessionStatus::AwaitingReview), 1);
    }

    #[test]
    fn test_user_task_in_review_does_not_change_status() {
        let mut record =
            StoredSession::new("doc.txt".into(), &ExtractionSession::default(), None).unwrap();
        record.set_status(SessionStatus::AwaitingReview);
        let task = record.add_task(TaskType::UpdateEntity, Some("abc".into()));

        assert_eq!(finish_task(&mut record, task, TaskStatus::Completed), FanIn::Waiting(0));
        assert_eq!(record.status, SessionStatus::AwaitingReview);
    }

    #[tokio::test]
    async fn test_fail_session_tolerates_vanished_session_and_missing_file() {
        let store = InMemorySessionStore::default();
        fail_session(&store, &LockPolicy::default(), Uuid::new_v4(), None, "boom").await;

        let dir = tempfile::tempdir().unwrap();
        let document = dir.path().join("gone.txt");
        let record =
            StoredSession::new(document.clone(), &ExtractionSession::default(), None).unwrap();
        let id = record.id;
        store.insert(record).await.unwrap();

        fail_session(&store, &LockPolicy::default(), id, None, "Persistence failed: sink down").await;
        fail_session(&store, &LockPolicy::default(), id, None, "second failure").await;

        let stored = store.get(id).await.unwrap();
        assert_eq!(stored.status, SessionStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("Persistence failed: sink down"));
        assert_eq!(stored.times_entered(SessionStatus::Failed), 1);
    }
}
