use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::jobs::JobRunner;

/// A unit of background work. Every job carries the id of the task record
/// registered for it before submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum Job {
    BackgroundResearch {
        session_id: Uuid,
        task_id: Uuid,
    },
    ResolveEntity {
        session_id: Uuid,
        task_id: Uuid,
        entity_id: String,
    },
    UpdateEntity {
        session_id: Uuid,
        task_id: Uuid,
        entity_id: String,
    },
    ReextractEntities {
        session_id: Uuid,
        task_id: Uuid,
    },
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::BackgroundResearch { .. } => "background_research",
            Job::ResolveEntity { .. } => "resolve_entity",
            Job::UpdateEntity { .. } => "update_entity",
            Job::ReextractEntities { .. } => "reextract_entities",
        }
    }

    pub fn session_id(&self) -> Uuid {
        match self {
            Job::BackgroundResearch { session_id, .. }
            | Job::ResolveEntity { session_id, .. }
            | Job::UpdateEntity { session_id, .. }
            | Job::ReextractEntities { session_id, .. } => *session_id,
        }
    }

    pub fn task_id(&self) -> Uuid {
        match self {
            Job::BackgroundResearch { task_id, .. }
            | Job::ResolveEntity { task_id, .. }
            | Job::UpdateEntity { task_id, .. }
            | Job::ReextractEntities { task_id, .. } => *task_id,
        }
    }
}

/// Submission side of the task queue. Delivery is at least once.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a job and return the queue's id for it.
    async fn submit(&self, job: Job) -> Result<String, QueueError>;
}

/// In-process queue backed by an unbounded channel; pair with [`run_worker`].
#[derive(Clone)]
pub struct ChannelTaskQueue {
    sender: mpsc::UnboundedSender<(String, Job)>,
}

impl ChannelTaskQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, Job)>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl TaskQueue for ChannelTaskQueue {
    async fn submit(&self, job: Job) -> Result<String, QueueError> {
        let job_id = format!("job-{}", Uuid::new_v4().simple());
        info!(job_id = %job_id, job = job.name(), session_id = %job.session_id(), "Job submitted");
        self.sender
            .send((job_id.clone(), job))
            .map_err(|_| QueueError::Closed)?;
        Ok(job_id)
    }
}

/// Execute jobs from `receiver`, at most `max_concurrent` at a time, until
/// every queue handle has been dropped.
pub async fn run_worker(
    mut receiver: mpsc::UnboundedReceiver<(String, Job)>,
    runner: Arc<JobRunner>,
    max_concurrent: usize,
) {
    let permits = Arc::new(Semaphore::new(max_concurrent.max(1)));

    while let Some((job_id, job)) = receiver.recv().await {
        let permit = match permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!("Worker semaphore closed");
                break;
            }
        };
        let runner = runner.clone();

        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = runner.run(job.clone()).await {
                error!(
                    job_id = %job_id,
                    job = job.name(),
                    session_id = %job.session_id(),
                    error = %e,
                    "Job failed"
                );
            }
        });
    }

    info!("Task queue closed, worker stopping");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_queue_assigns_ids_in_order() {
        let (queue, mut receiver) = ChannelTaskQueue::new();
        let session_id = Uuid::new_v4();

        let first = queue
            .submit(Job::BackgroundResearch {
                session_id,
                task_id: Uuid::new_v4(),
            })
            .await
            .unwrap();
        let second = queue
            .submit(Job::ResolveEntity {
                session_id,
                task_id: Uuid::new_v4(),
                entity_id: "ab12cd34".into(),
            })
            .await
            .unwrap();

        assert_ne!(first, second);
        let (id, job) = receiver.recv().await.unwrap();
        assert_eq!(id, first);
        assert_eq!(job.name(), "background_research");
        assert_eq!(receiver.recv().await.unwrap().1.session_id(), session_id);
    }

    #[tokio::test]
    async fn test_submit_after_receiver_dropped() {
        let (queue, receiver) = ChannelTaskQueue::new();
        drop(receiver);
        let err = queue
            .submit(Job::ReextractEntities {
                session_id: Uuid::new_v4(),
                task_id: Uuid::new_v4(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Closed));
    }

    #[test]
    fn test_job_serializes_with_tag() {
        let job = Job::UpdateEntity {
            session_id: Uuid::nil(),
            task_id: Uuid::nil(),
            entity_id: "x1".into(),
        };
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["job"], "update_entity");
        assert_eq!(value["entity_id"], "x1");
    }
}
