use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::ProviderError;

/// A model provider able to answer with JSON conforming to a schema.
#[async_trait]
pub trait StructuredExtractor: Send + Sync {
    async fn extract_structured_data(
        &self,
        text: &str,
        schema: &Value,
        instructions: &str,
    ) -> Result<Value, ProviderError>;
}

#[derive(Clone)]
pub struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
    format: &'a Value, // JSON schema for structured output
}

#[derive(Deserialize)]
struct OllamaResponse {
    response: String,
}

impl OllamaClient {
    pub fn new(base_url: String, model: String) -> Self {
        Self {
            base_url,
            model,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }
}

impl Default for OllamaClient {
    fn default() -> Self {
        Self::new(
            "http://localhost:11434".to_string(),
            "llama3".to_string(),
        )
    }
}

#[async_trait]
impl StructuredExtractor for OllamaClient {
    async fn extract_structured_data(
        &self,
        text: &str,
        schema: &Value,
        instructions: &str,
    ) -> Result<Value, ProviderError> {
        let url = format!("{}/api/generate", self.base_url.trim_end_matches('/'));

        let request = OllamaRequest {
            model: &self.model,
            prompt: text,
            system: instructions,
            stream: false,
            format: schema,
        };

        let response = self.client
            .post(&url)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let ollama_response: OllamaResponse = response.json().await?;
        debug!(model = %self.model, bytes = ollama_response.response.len(), "Ollama response received");

        Ok(serde_json::from_str(&ollama_response.response)?)
    }
}
