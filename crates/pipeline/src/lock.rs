use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use extract::RetryPolicy;

use crate::error::{PipelineError, StoreError};
use crate::record::StoredSession;
use crate::store::{SessionStore, SessionTransaction};

/// Retry policy for locked session writes.
#[derive(Debug, Clone)]
pub struct LockPolicy {
    /// Total attempts, including the first.
    pub attempts: usize,
    pub base_delay: Duration,
    pub jitter: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            attempts: 2,
            base_delay: Duration::from_millis(100),
            jitter: Duration::from_millis(50),
        }
    }
}

impl LockPolicy {
    fn retry_policy(&self) -> RetryPolicy {
        let base_ms = self.base_delay.as_millis() as u64;
        RetryPolicy::new(
            self.attempts.saturating_sub(1),
            base_ms,
            base_ms.saturating_mul(1 << self.attempts.min(16)),
        )
        .with_jitter(self.jitter.as_millis() as u64)
    }
}

enum LockFailure {
    Store(StoreError),
    Callback(PipelineError),
}

impl fmt::Display for LockFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockFailure::Store(e) => write!(f, "{}", e),
            LockFailure::Callback(e) => write!(f, "{}", e),
        }
    }
}

fn into_pipeline_error(store: &dyn SessionStore, id: Uuid, error: StoreError) -> PipelineError {
    if store.is_retryable(&error) {
        PipelineError::Concurrency {
            session_id: id,
            source: error,
        }
    } else {
        error.into()
    }
}

/// Run `update` against the freshly locked session row and commit its changes
/// in one transaction. Retryable store failures re-run the whole transaction,
/// so `update` may execute more than once and must only touch the record it is
/// given. An error from `update` rolls back without retrying.
pub async fn with_session_lock<T, F>(
    store: &dyn SessionStore,
    id: Uuid,
    policy: &LockPolicy,
    update: F,
) -> Result<T, PipelineError>
where
    F: Fn(&mut StoredSession) -> Result<T, PipelineError>,
{
    let update = &update;
    policy
        .retry_policy()
        .retry_if(
            "session_write",
            |failure: &LockFailure| matches!(failure, LockFailure::Store(e) if store.is_retryable(e)),
            move || async move {
                let mut txn = store.begin(id).await.map_err(LockFailure::Store)?;
                let value = update(txn.record()).map_err(LockFailure::Callback)?;
                txn.commit().await.map_err(LockFailure::Store)?;
                Ok(value)
            },
        )
        .await
        .map_err(|failure| match failure {
            LockFailure::Store(e) => into_pipeline_error(store, id, e),
            LockFailure::Callback(e) => e,
        })
}

/// Acquire the row lock with the same retry policy and hand the open
/// transaction to the caller, for updates that must await while locked.
pub async fn begin_locked(
    store: &dyn SessionStore,
    id: Uuid,
    policy: &LockPolicy,
) -> Result<Box<dyn SessionTransaction>, PipelineError> {
    policy
        .retry_policy()
        .retry_if(
            "session_lock",
            |e: &StoreError| store.is_retryable(e),
            move || store.begin(id),
        )
        .await
        .map_err(|e| into_pipeline_error(store, id, e))
}
