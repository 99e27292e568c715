use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

use session::{EntityKind, EntityMatchCandidate};

use crate::error::SearchError;

/// Lookup of existing registry records by name.
#[async_trait]
pub trait RegistrySearch: Send + Sync {
    /// Up to `limit` unscored candidates, in the registry's ranking order.
    async fn find_matches(
        &self,
        kind: &EntityKind,
        query_name: &str,
        limit: usize,
    ) -> Result<Vec<EntityMatchCandidate>, SearchError>;
}

/// HTTP client for the NES `/entities` search endpoint.
#[derive(Clone)]
pub struct NesSearchClient {
    base_url: String,
    client: reqwest::Client,
}

impl NesSearchClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SearchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("agni-resolve/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl RegistrySearch for NesSearchClient {
    async fn find_matches(
        &self,
        kind: &EntityKind,
        query_name: &str,
        limit: usize,
    ) -> Result<Vec<EntityMatchCandidate>, SearchError> {
        let mut params = vec![
            ("entity_type", kind.entity_type.to_string()),
            ("query", query_name.to_string()),
            ("limit", limit.to_string()),
            ("offset", "0".to_string()),
        ];
        if let Some(subtype) = kind.entity_subtype {
            params.push(("sub_type", subtype.to_string()));
        }

        let response = self
            .client
            .get(format!("{}/entities", self.base_url))
            .query(&params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = response.json().await?;
        let candidates = parse_search_response(body)?;
        info!(query = query_name, kind = %kind, found = candidates.len(), "NES search complete");
        Ok(candidates)
    }
}

/// Candidates from a `{"entities": [...]}` body; each record keeps its full JSON.
pub fn parse_search_response(mut body: Value) -> Result<Vec<EntityMatchCandidate>, SearchError> {
    let entities = match body.get_mut("entities").map(Value::take) {
        Some(Value::Array(entities)) => entities,
        Some(Value::Null) | None => return Ok(Vec::new()),
        Some(other) => {
            return Err(SearchError::InvalidResponse(format!(
                "'entities' is not an array: {}",
                other
            )));
        }
    };

    entities
        .into_iter()
        .map(|record| {
            let id = record
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| SearchError::InvalidResponse("record without an id".to_string()))?
                .to_string();
            debug!(nes_id = %id, "Search hit");
            Ok(EntityMatchCandidate::new(id, Some(record)))
        })
        .collect()
}
