//! Durable session storage.
//!
//! Plain `get`/`save` work outside a transaction. `begin` takes the exclusive
//! row lock and returns a transaction holding a working copy; nothing is
//! written until `commit`, and dropping the transaction discards it.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::error::StoreError;
use crate::record::StoredSession;

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, record: StoredSession) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<StoredSession, StoreError>;

    async fn save(&self, record: &StoredSession) -> Result<(), StoreError>;

    /// Exclusive read-for-update of one session.
    async fn begin(&self, id: Uuid) -> Result<Box<dyn SessionTransaction>, StoreError>;

    /// Whether a failed operation may succeed if tried again (lock wait
    /// timeout, serialization failure, deadlock).
    fn is_retryable(&self, error: &StoreError) -> bool;
}

#[async_trait]
pub trait SessionTransaction: Send {
    fn record(&mut self) -> &mut StoredSession;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

struct Slot {
    committed: Mutex<StoredSession>,
    writer: Arc<tokio::sync::Mutex<()>>,
}

/// Single-process store. Each session has its own writer lock; readers see
/// the last committed version and never wait on writers.
#[derive(Clone)]
pub struct InMemorySessionStore {
    slots: Arc<DashMap<Uuid, Arc<Slot>>>,
    lock_wait: Duration,
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl InMemorySessionStore {
    pub fn new(lock_wait: Duration) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            lock_wait,
        }
    }

    pub fn remove(&self, id: Uuid) -> bool {
        self.slots.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, id: Uuid) -> Result<Arc<Slot>, StoreError> {
        self.slots
            .get(&id)
            .map(|slot| slot.value().clone())
            .ok_or(StoreError::NotFound(id))
    }
}

fn read(slot: &Slot) -> Result<StoredSession, StoreError> {
    slot.committed
        .lock()
        .map(|record| record.clone())
        .map_err(|_| StoreError::Backend("poisoned session slot".to_string()))
}

fn write(slot: &Slot, record: StoredSession) -> Result<(), StoreError> {
    let mut committed = slot
        .committed
        .lock()
        .map_err(|_| StoreError::Backend("poisoned session slot".to_string()))?;
    *committed = record;
    Ok(())
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn insert(&self, record: StoredSession) -> Result<(), StoreError> {
        let id = record.id;
        if self.slots.contains_key(&id) {
            return Err(StoreError::Duplicate(id));
        }
        self.slots.insert(
            id,
            Arc::new(Slot {
                committed: Mutex::new(record),
                writer: Arc::new(tokio::sync::Mutex::new(())),
            }),
        );
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<StoredSession, StoreError> {
        let slot = self.slot(id)?;
        read(&slot)
    }

    async fn save(&self, record: &StoredSession) -> Result<(), StoreError> {
        let slot = self.slot(record.id)?;
        write(&slot, record.clone())
    }

    async fn begin(&self, id: Uuid) -> Result<Box<dyn SessionTransaction>, StoreError> {
        let slot = self.slot(id)?;
        let guard = tokio::time::timeout(self.lock_wait, slot.writer.clone().lock_owned())
            .await
            .map_err(|_| StoreError::LockTimeout(id))?;
        let working = read(&slot)?;
        Ok(Box::new(InMemoryTransaction {
            slot,
            working,
            _guard: guard,
        }))
    }

    fn is_retryable(&self, error: &StoreError) -> bool {
        matches!(error, StoreError::LockTimeout(_) | StoreError::Conflict(_))
    }
}

struct InMemoryTransaction {
    slot: Arc<Slot>,
    working: StoredSession,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl SessionTransaction for InMemoryTransaction {
    fn record(&mut self) -> &mut StoredSession {
        &mut self.working
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let InMemoryTransaction { slot, working, _guard } = *self;
        write(&slot, working)
    }
}
