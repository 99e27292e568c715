//! Session orchestration: the durable session record, row locking, the task
//! queue and its jobs, and the persistence gate.

pub mod error;
pub mod gate;
pub mod jobs;
pub mod lock;
pub mod queue;
pub mod record;
pub mod service;
pub mod store;

pub use error::{PipelineError, QueueError, SinkError, StoreError};
pub use gate::{ApprovedChange, ChangeSink, InMemoryChangeSink, build_changes, validate_all_resolved};
pub use jobs::{FanIn, JobRunner, fail_session, finish_task};
pub use lock::{LockPolicy, begin_locked, with_session_lock};
pub use queue::{ChannelTaskQueue, Job, TaskQueue, run_worker};
pub use record::{BackgroundTask, SessionStatus, StatusChange, StoredSession, TaskStatus, TaskType};
pub use service::{ALLOWED_EXTENSIONS, PersistOutcome, PipelineService, PostedMessage, SessionView};
pub use store::{InMemorySessionStore, SessionStore, SessionTransaction};
