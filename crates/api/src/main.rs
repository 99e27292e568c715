mod config;
mod metrics;
mod routes;

use anyhow::Context;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use extract::{Extractor, OllamaClient};
use pipeline::{
    ChannelTaskQueue, InMemoryChangeSink, InMemorySessionStore, JobRunner, PipelineService,
    SessionStore, TaskQueue, run_worker,
};
use resolve::{MatchResolver, NesSearchClient};

use crate::config::AppConfig;
use crate::metrics::Metrics;
use crate::routes::{AppState, build_router};

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,pipeline=debug".into());
    let json = std::env::var("AGNI_LOG_JSON")
        .is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::from_env()?;
    info!(
        llm = %config.llm.base_url,
        model = %config.llm.model,
        nes = %config.search.nes_url,
        "Starting entity pipeline"
    );

    let provider = Arc::new(OllamaClient::new(
        config.llm.base_url.clone(),
        config.llm.model.clone(),
    ));
    let extractor = Arc::new(Extractor::new(provider, config.extractor_config()));

    let search = NesSearchClient::new(&config.search.nes_url, config.search_timeout())
        .context("Failed to build NES search client")?;
    let resolver = Arc::new(
        MatchResolver::new(Arc::new(search), extractor.clone())
            .with_candidate_limit(config.search.candidate_limit),
    );

    let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new(config.lock_wait()));
    let (queue, jobs) = ChannelTaskQueue::new();
    let queue: Arc<dyn TaskQueue> = Arc::new(queue);

    let runner = Arc::new(JobRunner::new(
        store.clone(),
        extractor,
        resolver,
        queue.clone(),
        config.lock_policy(),
    ));
    tokio::spawn(run_worker(jobs, runner, config.queue.max_concurrent_jobs));

    let service = PipelineService::new(
        store,
        queue,
        Arc::new(InMemoryChangeSink::new()),
        config.lock_policy(),
    );

    for dir in [&config.server.inbox_dir, &config.server.upload_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    }

    let state = AppState {
        service: Arc::new(service),
        metrics: Metrics::new(),
        inbox_dir: config.server.inbox_dir.clone(),
        upload_dir: config.server.upload_dir.clone(),
        probes: vec![
            ("llm".to_string(), format!("{}/api/tags", config.llm.base_url.trim_end_matches('/'))),
            ("nes".to_string(), config.search.nes_url.clone()),
        ],
    };

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    info!("Server listening on http://{}", config.server.bind);

    axum::serve(listener, build_router(state)).await?;
    Ok(())
}
