mod common;

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use uuid::Uuid;

use common::{
    DOCUMENT, FakeSearch, FlakyStore, Harness, RuleProvider, extraction, person, test_lock_policy,
};
use extract::ExtractionError;
use pipeline::{
    ChangeSink, InMemorySessionStore, PipelineError, PipelineService, SessionStatus, SinkError,
    TaskStatus,
};
use session::{EntityChange, ReviewAction};

#[tokio::test]
async fn test_research_failure_marks_session_failed() {
    let provider = RuleProvider::with_extraction(extraction(vec![person("Ram Bahadur Thapa")]));
    provider.fail_everything.store(true, Ordering::SeqCst);
    let h = Harness::new(provider, FakeSearch::default());

    let path = h.document("budget.txt", DOCUMENT);
    let record = h.service.create_session(path.clone(), None, None).await.unwrap();
    let results = h.drain().await;

    assert_eq!(results.len(), 1);
    match &results[0] {
        Err(PipelineError::Extraction(ExtractionError::Unavailable { attempts, .. })) => {
            assert_eq!(*attempts, 2)
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(h.provider.calls.load(Ordering::SeqCst), 2);

    let stored = h.record(record.id).await;
    assert_eq!(stored.status, SessionStatus::Failed);
    assert!(
        stored
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("Background research failed:")
    );
    assert_eq!(stored.tasks[0].status, TaskStatus::Failed);
    assert!(!path.exists());

    // a failed session takes no further input
    let err = h
        .service
        .post_message(record.id, "metadata_extraction", "retry please")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Precondition(_)));
}

#[tokio::test]
async fn test_unreadable_document_fails_session() {
    let h = Harness::new(
        RuleProvider::with_extraction(extraction(vec![])),
        FakeSearch::default(),
    );
    let path = h.document("gone.md", DOCUMENT);
    let id = h.service.create_session(path.clone(), None, None).await.unwrap().id;
    std::fs::remove_file(&path).unwrap();

    let results = h.drain().await;
    assert!(matches!(
        results[0],
        Err(PipelineError::Extraction(ExtractionError::Document { .. }))
    ));
    assert_eq!(h.record(id).await.status, SessionStatus::Failed);
}

#[tokio::test]
async fn test_vanished_session_is_reported_not_failed() {
    let store = Arc::new(InMemorySessionStore::default());
    let h = Harness::with_store(
        store.clone(),
        RuleProvider::with_extraction(extraction(vec![person("Ram Bahadur Thapa")])),
        FakeSearch::default(),
    );

    let path = h.document("budget.txt", DOCUMENT);
    let id = h.service.create_session(path.clone(), None, None).await.unwrap().id;
    assert!(store.remove(id));

    let results = h.drain().await;
    assert!(matches!(results[0], Err(PipelineError::SessionNotFound(found)) if found == id));
    assert!(path.exists());

    let err = h.service.get_session(id).await.unwrap_err();
    assert_eq!(err.kind(), "not_found");
    let err = h.service.progress(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, PipelineError::SessionNotFound(_)));
}

#[tokio::test]
async fn test_lock_timeout_is_retried() {
    let store = Arc::new(FlakyStore::new(0));
    let h = Harness::with_store(
        store.clone(),
        RuleProvider::with_extraction(extraction(vec![person("Ram Bahadur Thapa")])),
        FakeSearch::default(),
    );
    let id = h.create_and_drain().await;

    store.failures.store(1, Ordering::SeqCst);
    let begins = store.begins.load(Ordering::SeqCst);
    let status = h
        .service
        .resolve_entity(id, 0, ReviewAction::Skip { reason: None })
        .await
        .unwrap();
    assert_eq!(status, session::ResolutionStatus::Skipped);
    assert_eq!(store.begins.load(Ordering::SeqCst), begins + 2);

    store.failures.store(2, Ordering::SeqCst);
    let err = h
        .service
        .resolve_entity(id, 0, ReviewAction::Create)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Concurrency { session_id, .. } if session_id == id));
    assert_eq!(err.kind(), "concurrency_conflict");
    assert_eq!(h.service.progress(id).await.unwrap().skipped, 1);
}

struct RejectingSink;

#[async_trait]
impl ChangeSink for RejectingSink {
    async fn queue_changes(
        &self,
        _changes: &[EntityChange],
        _description: &str,
        _approved_by: Option<&str>,
    ) -> Result<Vec<Uuid>, SinkError> {
        Err(SinkError::Rejected("registry queue offline".into()))
    }
}

#[tokio::test]
async fn test_sink_failure_marks_session_failed() {
    let h = Harness::new(
        RuleProvider::with_extraction(extraction(vec![person("Ram Bahadur Thapa")])),
        FakeSearch::default(),
    );
    let id = h.create_and_drain().await;
    let document = h.record(id).await.document;

    let service = PipelineService::new(
        h.store.clone(),
        h.queue.clone(),
        Arc::new(RejectingSink),
        test_lock_policy(),
    );
    let err = service
        .request_persistence(id, "Budget", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "persistence_error");

    let record = h.record(id).await;
    assert_eq!(record.status, SessionStatus::Failed);
    assert_eq!(
        record.error_message.as_deref(),
        Some("Persistence failed: Failed to queue entity changes: registry queue offline")
    );
    assert!(!document.exists());
}

#[tokio::test]
async fn test_closed_queue_fails_new_session() {
    let h = Harness::new(
        RuleProvider::with_extraction(extraction(vec![])),
        FakeSearch::default(),
    );
    h.queue.closed.store(true, Ordering::SeqCst);
    let path = h.document("budget.txt", DOCUMENT);

    let err = h
        .service
        .create_session(path.clone(), None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "queue_error");
    assert!(!path.exists());
}
