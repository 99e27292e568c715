//! The durable session row: serialized session plus status, task bookkeeping
//! and audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use session::{ExtractionSession, ProgressSummary, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    ProcessingMetadata,
    ProcessingEntities,
    AwaitingReview,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::ProcessingMetadata => "processing_metadata",
            SessionStatus::ProcessingEntities => "processing_entities",
            SessionStatus::AwaitingReview => "awaiting_review",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    ExtractMetadata,
    ExtractEntities,
    UpdateEntity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Queued | TaskStatus::Running)
    }
}

/// A background job recorded against the session. Never removed once added.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundTask {
    pub task_id: Uuid,
    /// Id handed out by the task queue; empty until the job is submitted.
    pub job_id: Option<String>,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub entity_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: SessionStatus,
    pub to: SessionStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSession {
    pub id: Uuid,
    pub document: PathBuf,
    pub session_data: Value,
    pub status: SessionStatus,
    pub tasks: Vec<BackgroundTask>,
    pub error_message: Option<String>,
    pub progress: ProgressSummary,
    pub history: Vec<StatusChange>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredSession {
    pub fn new(
        document: PathBuf,
        session: &ExtractionSession,
        created_by: Option<String>,
    ) -> Result<Self, SessionError> {
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            document,
            session_data: session.to_document()?,
            status: SessionStatus::Pending,
            tasks: Vec::new(),
            error_message: None,
            progress: session.progress(),
            history: Vec::new(),
            created_by,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn session(&self) -> Result<ExtractionSession, SessionError> {
        ExtractionSession::from_document(self.session_data.clone())
    }

    /// Write the session payload back and refresh the progress counts.
    pub fn store_session(&mut self, session: &ExtractionSession) -> Result<(), SessionError> {
        self.session_data = session.to_document()?;
        self.progress = session.progress();
        self.touch();
        Ok(())
    }

    pub fn set_status(&mut self, status: SessionStatus) {
        if self.status != status {
            self.history.push(StatusChange {
                from: self.status,
                to: status,
                at: Utc::now(),
            });
            self.status = status;
        }
        self.touch();
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.set_status(SessionStatus::Failed);
        self.error_message = Some(message.into());
    }

    /// Record a queued task and return its id.
    pub fn add_task(&mut self, task_type: TaskType, entity_id: Option<String>) -> Uuid {
        let task_id = Uuid::new_v4();
        self.tasks.push(BackgroundTask {
            task_id,
            job_id: None,
            task_type,
            status: TaskStatus::Queued,
            entity_id,
            created_at: Utc::now(),
        });
        self.touch();
        task_id
    }

    pub fn task(&self, task_id: Uuid) -> Option<&BackgroundTask> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    pub fn set_task_status(&mut self, task_id: Uuid, status: TaskStatus) -> bool {
        match self.tasks.iter_mut().find(|t| t.task_id == task_id) {
            Some(task) => {
                task.status = status;
                self.touch();
                true
            }
            None => false,
        }
    }

    pub fn set_job_id(&mut self, task_id: Uuid, job_id: &str) -> bool {
        match self.tasks.iter_mut().find(|t| t.task_id == task_id) {
            Some(task) => {
                task.job_id = Some(job_id.to_string());
                self.touch();
                true
            }
            None => false,
        }
    }

    pub fn active_tasks(&self) -> usize {
        self.tasks.iter().filter(|t| t.status.is_active()).count()
    }

    /// How many times the session has entered `status`.
    pub fn times_entered(&self, status: SessionStatus) -> usize {
        self.history.iter().filter(|c| c.to == status).count()
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
