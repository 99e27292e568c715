mod common;

use std::sync::Arc;
use tokio::task::JoinSet;

use common::{DOCUMENT, FakeSearch, Harness, RuleProvider, extraction, person};
use pipeline::{Job, SessionStatus, TaskStatus};

fn crowd(n: usize) -> Harness {
    let names: Vec<String> = (0..n).map(|i| format!("Official {}", i)).collect();
    let entities = names.iter().map(|name| person(name)).collect();

    let mut search = FakeSearch::default();
    for (i, name) in names.iter().enumerate() {
        if i % 2 == 0 {
            search = search.with(name, &["entity:person/official"]);
        }
    }
    let provider =
        RuleProvider::with_extraction(extraction(entities)).score("entity:person/official", 0.7);
    Harness::new(provider, search)
}

async fn research_only(h: &Harness) -> (uuid::Uuid, Vec<Job>) {
    let path = h.document("officials.txt", DOCUMENT);
    let record = h.service.create_session(path, None, None).await.unwrap();
    for job in h.queue.take() {
        h.runner.run(job).await.unwrap();
    }
    (record.id, h.queue.take())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resolutions_enter_review_once() {
    let h = crowd(8);
    let (id, jobs) = research_only(&h).await;
    assert_eq!(jobs.len(), 8);
    assert_eq!(h.record(id).await.status, SessionStatus::ProcessingEntities);

    let mut set = JoinSet::new();
    for job in jobs.iter().cloned() {
        let runner = Arc::clone(&h.runner);
        set.spawn(async move { runner.run(job).await });
    }
    while let Some(result) = set.join_next().await {
        result.unwrap().unwrap();
    }

    let record = h.record(id).await;
    assert_eq!(record.status, SessionStatus::AwaitingReview);
    assert_eq!(record.times_entered(SessionStatus::AwaitingReview), 1);
    assert_eq!(record.active_tasks(), 0);
    assert_eq!(record.progress.total, 8);
    assert_eq!(record.progress.needs_review, 4);
    assert_eq!(record.progress.create_new, 4);
    assert_eq!(record.progress.pending, 0);

    // at-least-once delivery: running every job again changes nothing
    let before = h.record(id).await;
    for job in jobs {
        h.runner.run(job).await.unwrap();
    }
    let after = h.record(id).await;
    assert_eq!(after.session_data, before.session_data);
    assert_eq!(after.history, before.history);
}

#[tokio::test]
async fn test_reverse_order_completion() {
    let h = crowd(3);
    let (id, mut jobs) = research_only(&h).await;
    jobs.reverse();

    let last = jobs.pop().unwrap();
    for job in jobs {
        h.runner.run(job).await.unwrap();
        assert_eq!(h.record(id).await.status, SessionStatus::ProcessingEntities);
    }
    h.runner.run(last).await.unwrap();

    let record = h.record(id).await;
    assert_eq!(record.status, SessionStatus::AwaitingReview);
    assert_eq!(record.times_entered(SessionStatus::AwaitingReview), 1);
}

#[tokio::test]
async fn test_redelivered_research_job_is_ignored() {
    let h = crowd(2);
    let path = h.document("officials.txt", DOCUMENT);
    let record = h.service.create_session(path, None, None).await.unwrap();
    let research = h.queue.take().pop().unwrap();

    h.runner.run(research.clone()).await.unwrap();
    let resolution_jobs = h.queue.take();
    assert_eq!(resolution_jobs.len(), 2);
    let entities_before = h.service.get_session(record.id).await.unwrap().entities;

    h.runner.run(research).await.unwrap();
    assert_eq!(h.queue.len(), 0);
    assert_eq!(
        h.service.get_session(record.id).await.unwrap().entities,
        entities_before
    );

    for job in resolution_jobs {
        h.runner.run(job).await.unwrap();
    }
    assert_eq!(h.record(record.id).await.status, SessionStatus::AwaitingReview);
}

#[tokio::test]
async fn test_failed_resolution_still_fans_in() {
    let provider = RuleProvider::with_extraction(extraction(vec![
        person("Ram Bahadur Thapa"),
        person("Sita Sharma"),
    ]));
    let search = FakeSearch::default().failing("Sita Sharma");
    let h = Harness::new(provider, search);

    let path = h.document("budget.txt", DOCUMENT);
    let id = h.service.create_session(path, None, None).await.unwrap().id;
    let results = h.drain().await;
    assert_eq!(results.iter().filter(|r| r.is_err()).count(), 1);

    let record = h.record(id).await;
    assert_eq!(record.status, SessionStatus::AwaitingReview);
    assert_eq!(record.times_entered(SessionStatus::AwaitingReview), 1);
    assert_eq!(
        record
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .count(),
        1
    );
    assert_eq!(record.progress.pending, 1);
    assert_eq!(record.progress.create_new, 1);

    let err = h
        .service
        .request_persistence(id, "Budget", None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Entity 1: pending"));

    h.service
        .resolve_entity(id, 1, session::ReviewAction::Skip { reason: None })
        .await
        .unwrap();
    let outcome = h.service.request_persistence(id, "Budget", None).await.unwrap();
    assert_eq!(outcome.change_ids.len(), 1);
}
