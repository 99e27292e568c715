#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

use extract::{Extractor, ExtractorConfig, ProviderError, StructuredExtractor};
use pipeline::{
    ChangeSink, InMemoryChangeSink, InMemorySessionStore, Job, JobRunner, LockPolicy,
    PipelineError, PipelineService, QueueError, SessionStore, SessionTransaction, StoreError,
    StoredSession, TaskQueue,
};
use resolve::{MatchResolver, RegistrySearch, SearchError};
use session::{EntityKind, EntityMatchCandidate};

/// Provider that answers by the shape of the requested schema.
#[derive(Default)]
pub struct RuleProvider {
    pub extraction: Mutex<Option<Value>>,
    pub reextraction: Mutex<Option<Value>>,
    pub update: Mutex<Option<Value>>,
    /// Candidate scores by registry id.
    pub scores: Mutex<HashMap<String, f64>>,
    pub fail_everything: AtomicBool,
    pub calls: AtomicUsize,
    /// When set, entity updates signal `update_entered` and wait for `release_update`.
    pub hold_updates: AtomicBool,
    pub update_entered: Notify,
    pub release_update: Notify,
}

impl RuleProvider {
    pub fn with_extraction(extraction: Value) -> Self {
        let provider = Self::default();
        *provider.extraction.lock().unwrap() = Some(extraction);
        provider
    }

    pub fn score(self, nes_id: &str, confidence: f64) -> Self {
        self.scores.lock().unwrap().insert(nes_id.into(), confidence);
        self
    }
}

fn has_property(schema: &Value, name: &str) -> bool {
    schema
        .get("properties")
        .and_then(|p| p.get(name))
        .is_some()
}

#[async_trait]
impl StructuredExtractor for RuleProvider {
    async fn extract_structured_data(
        &self,
        text: &str,
        schema: &Value,
        _instructions: &str,
    ) -> Result<Value, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_everything.load(Ordering::SeqCst) {
            return Err(ProviderError::Other("model offline".into()));
        }

        let reply = if has_property(schema, "metadata") {
            self.extraction.lock().unwrap().clone()
        } else if has_property(schema, "candidates") {
            let candidates: Vec<Value> = self
                .scores
                .lock()
                .unwrap()
                .iter()
                .map(|(id, confidence)| json!({"nes_id": id, "confidence": confidence}))
                .collect();
            Some(json!({"candidates": candidates, "proposed_changes": {"tags": ["reviewed"]}}))
        } else if has_property(schema, "entities") {
            if text.contains("## Entity Being Updated") {
                if self.hold_updates.load(Ordering::SeqCst) {
                    self.update_entered.notify_one();
                    self.release_update.notified().await;
                }
                self.update.lock().unwrap().clone()
            } else {
                self.reextraction.lock().unwrap().clone()
            }
        } else {
            Some(json!({"names": [{"name": "Generated", "language": "en"}], "tags": ["new"]}))
        };

        reply.ok_or_else(|| ProviderError::Other("no scripted reply".into()))
    }
}

/// Registry search answering from a fixed table keyed by query name.
#[derive(Default)]
pub struct FakeSearch {
    pub results: HashMap<String, Vec<String>>,
    pub failing: Vec<String>,
}

impl FakeSearch {
    pub fn with(mut self, name: &str, ids: &[&str]) -> Self {
        self.results
            .insert(name.into(), ids.iter().map(|id| id.to_string()).collect());
        self
    }

    pub fn failing(mut self, name: &str) -> Self {
        self.failing.push(name.into());
        self
    }
}

#[async_trait]
impl RegistrySearch for FakeSearch {
    async fn find_matches(
        &self,
        _kind: &EntityKind,
        query_name: &str,
        limit: usize,
    ) -> Result<Vec<EntityMatchCandidate>, SearchError> {
        if self.failing.iter().any(|n| n == query_name) {
            return Err(SearchError::InvalidResponse("search index unavailable".into()));
        }
        Ok(self
            .results
            .get(query_name)
            .map(|ids| {
                ids.iter()
                    .take(limit)
                    .map(|id| EntityMatchCandidate::new(id.clone(), Some(json!({"id": id}))))
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Queue that only records submissions; tests decide when jobs run.
#[derive(Default)]
pub struct RecordingQueue {
    pub jobs: Mutex<Vec<(String, Job)>>,
    pub closed: AtomicBool,
    counter: AtomicUsize,
}

impl RecordingQueue {
    pub fn take(&self) -> Vec<Job> {
        self.jobs
            .lock()
            .unwrap()
            .drain(..)
            .map(|(_, job)| job)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }
}

#[async_trait]
impl TaskQueue for RecordingQueue {
    async fn submit(&self, job: Job) -> Result<String, QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        let job_id = format!("job-{}", self.counter.fetch_add(1, Ordering::SeqCst));
        self.jobs.lock().unwrap().push((job_id.clone(), job));
        Ok(job_id)
    }
}

/// Store whose first `failures` lock attempts time out.
pub struct FlakyStore {
    pub inner: InMemorySessionStore,
    pub failures: AtomicUsize,
    pub begins: AtomicUsize,
}

impl FlakyStore {
    pub fn new(failures: usize) -> Self {
        Self {
            inner: InMemorySessionStore::default(),
            failures: AtomicUsize::new(failures),
            begins: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SessionStore for FlakyStore {
    async fn insert(&self, record: StoredSession) -> Result<(), StoreError> {
        self.inner.insert(record).await
    }

    async fn get(&self, id: Uuid) -> Result<StoredSession, StoreError> {
        self.inner.get(id).await
    }

    async fn save(&self, record: &StoredSession) -> Result<(), StoreError> {
        self.inner.save(record).await
    }

    async fn begin(&self, id: Uuid) -> Result<Box<dyn SessionTransaction>, StoreError> {
        self.begins.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::LockTimeout(id));
        }
        self.inner.begin(id).await
    }

    fn is_retryable(&self, error: &StoreError) -> bool {
        self.inner.is_retryable(error)
    }
}

pub fn test_lock_policy() -> LockPolicy {
    LockPolicy {
        attempts: 2,
        base_delay: Duration::from_millis(1),
        jitter: Duration::ZERO,
    }
}

pub struct Harness {
    pub store: Arc<dyn SessionStore>,
    pub queue: Arc<RecordingQueue>,
    pub sink: Arc<InMemoryChangeSink>,
    pub provider: Arc<RuleProvider>,
    pub runner: Arc<JobRunner>,
    pub service: PipelineService,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub fn new(provider: RuleProvider, search: FakeSearch) -> Self {
        Self::with_store(Arc::new(InMemorySessionStore::default()), provider, search)
    }

    pub fn with_store(
        store: Arc<dyn SessionStore>,
        provider: RuleProvider,
        search: FakeSearch,
    ) -> Self {
        let provider = Arc::new(provider);
        let extractor = Arc::new(Extractor::new(
            provider.clone(),
            ExtractorConfig {
                max_retries: 1,
                timeout: Duration::from_secs(5),
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
            },
        ));
        let resolver = Arc::new(MatchResolver::new(Arc::new(search), extractor.clone()));
        let queue = Arc::new(RecordingQueue::default());
        let sink = Arc::new(InMemoryChangeSink::new());

        let runner = Arc::new(JobRunner::new(
            store.clone(),
            extractor,
            resolver,
            queue.clone(),
            test_lock_policy(),
        ));
        let service = PipelineService::new(
            store.clone(),
            queue.clone(),
            sink.clone() as Arc<dyn ChangeSink>,
            test_lock_policy(),
        );

        Self {
            store,
            queue,
            sink,
            provider,
            runner,
            service,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn document(&self, name: &str, body: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    /// Upload a document and run every job it causes, one at a time.
    pub async fn create_and_drain(&self) -> Uuid {
        let path = self.document("budget.txt", DOCUMENT);
        let record = self
            .service
            .create_session(path, None, Some("reviewer".into()))
            .await
            .unwrap();
        self.drain().await;
        record.id
    }

    /// Run queued jobs until the queue stays empty.
    pub async fn drain(&self) -> Vec<Result<(), PipelineError>> {
        let mut results = Vec::new();
        loop {
            let jobs = self.queue.take();
            if jobs.is_empty() {
                return results;
            }
            for job in jobs {
                results.push(self.runner.run(job).await);
            }
        }
    }

    pub async fn record(&self, id: Uuid) -> StoredSession {
        self.store.get(id).await.unwrap()
    }
}

pub const DOCUMENT: &str = "Finance Minister Ram Bahadur Thapa presented the budget. \
The Nepal Health Foundation and Sita Sharma objected.";

pub fn person(name: &str) -> Value {
    json!({"entity_type": "person", "names": [{"name": name, "language": "en", "is_primary": true}]})
}

pub fn ngo(name: &str) -> Value {
    json!({"entity_type": "organization/ngo", "names": [{"name": name, "language": "en"}]})
}

pub fn extraction(entities: Vec<Value>) -> Value {
    json!({
        "metadata": {
            "title": "Budget Speech 2081",
            "author": "Ministry of Finance",
            "publication_date": "2024-05-28",
            "document_type": "budget_document"
        },
        "entities": entities
    })
}
