use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use extract::ExtractorConfig;
use pipeline::LockPolicy;

/// Service configuration. Defaults suit a local Ollama; every field that
/// changes between deployments can be overridden with an `AGNI_` variable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub extraction: ExtractionConfig,
    pub search: SearchConfig,
    pub store: StoreConfig,
    pub queue: QueueConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    pub max_retries: usize,
    pub timeout_secs: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    pub nes_url: String,
    pub timeout_secs: u64,
    pub candidate_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub lock_attempts: usize,
    pub lock_base_delay_ms: u64,
    pub lock_jitter_ms: u64,
    pub lock_wait_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub max_concurrent_jobs: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind: String,
    /// Sessions can only be created from documents inside this directory.
    pub inbox_dir: PathBuf,
    /// Uploaded documents are copied here and removed when their session ends.
    pub upload_dir: PathBuf,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.1".to_string(),
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout_secs: 60,
            initial_backoff_ms: 1000,
            max_backoff_ms: 60000,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            nes_url: "https://nes.newnepal.org".to_string(),
            timeout_secs: 30,
            candidate_limit: resolve::DEFAULT_CANDIDATE_LIMIT,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_attempts: 2,
            lock_base_delay_ms: 100,
            lock_jitter_ms: 50,
            lock_wait_secs: 5,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
            inbox_dir: PathBuf::from("data/inbox"),
            upload_dir: PathBuf::from("data/uploads"),
        }
    }
}

fn parse<T>(key: &str, value: String) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid value for {}: {:?}", key, value))
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(v) = lookup("AGNI_LLM_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = lookup("AGNI_LLM_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = lookup("AGNI_LLM_TIMEOUT_SECS") {
            self.extraction.timeout_secs = parse("AGNI_LLM_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = lookup("AGNI_MAX_RETRIES") {
            self.extraction.max_retries = parse("AGNI_MAX_RETRIES", v)?;
        }
        if let Some(v) = lookup("AGNI_NES_URL") {
            self.search.nes_url = v;
        }
        if let Some(v) = lookup("AGNI_CANDIDATE_LIMIT") {
            self.search.candidate_limit = parse("AGNI_CANDIDATE_LIMIT", v)?;
        }
        if let Some(v) = lookup("AGNI_MAX_CONCURRENT_JOBS") {
            self.queue.max_concurrent_jobs = parse("AGNI_MAX_CONCURRENT_JOBS", v)?;
        }
        if let Some(v) = lookup("AGNI_BIND") {
            self.server.bind = v;
        }
        if let Some(v) = lookup("AGNI_INBOX_DIR") {
            self.server.inbox_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("AGNI_UPLOAD_DIR") {
            self.server.upload_dir = PathBuf::from(v);
        }
        Ok(())
    }

    pub fn extractor_config(&self) -> ExtractorConfig {
        ExtractorConfig {
            max_retries: self.extraction.max_retries,
            timeout: Duration::from_secs(self.extraction.timeout_secs),
            initial_backoff: Duration::from_millis(self.extraction.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.extraction.max_backoff_ms),
        }
    }

    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy {
            attempts: self.store.lock_attempts,
            base_delay: Duration::from_millis(self.store.lock_base_delay_ms),
            jitter: Duration::from_millis(self.store.lock_jitter_ms),
        }
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.store.lock_wait_secs)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.bind, "0.0.0.0:3000");
        assert_eq!(config.search.nes_url, "https://nes.newnepal.org");
        assert_eq!(config.extractor_config().max_retries, 3);
        assert_eq!(config.extractor_config().timeout, Duration::from_secs(60));
        assert_eq!(config.lock_policy().attempts, 2);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("AGNI_NES_URL", "http://localhost:8195"),
            ("AGNI_MAX_RETRIES", "5"),
            ("AGNI_MAX_CONCURRENT_JOBS", " 8 "),
            ("AGNI_INBOX_DIR", "/srv/agni/inbox"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.search.nes_url, "http://localhost:8195");
        assert_eq!(config.extraction.max_retries, 5);
        assert_eq!(config.queue.max_concurrent_jobs, 8);
        assert_eq!(config.server.inbox_dir, PathBuf::from("/srv/agni/inbox"));
        assert_eq!(config.llm.model, "llama3.1");
    }

    #[test]
    fn test_bad_number_is_rejected() {
        let mut config = AppConfig::default();
        let err = config
            .apply_overrides(|key| (key == "AGNI_MAX_RETRIES").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("AGNI_MAX_RETRIES"));
    }
}
