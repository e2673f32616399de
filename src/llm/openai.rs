//! OpenAI-compatible embedding client
//!
//! POSTs `{"model": ..., "input": [...]}` to `{base_url}/embeddings` and
//! reorders the returned vectors by their `index` field.

use crate::llm::{Embedder, LlmError};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the embedding client
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// Base URL, e.g. "https://api.openai.com/v1"
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "text-embedding-3-small".to_string(),
            api_key: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Embedding client for OpenAI-compatible APIs
pub struct OpenAiEmbedder {
    client: Client,
    config: OpenAiConfig,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    pub fn new(config: OpenAiConfig) -> Result<Self, LlmError> {
        if config.base_url.is_empty() {
            return Err(LlmError::Config("embedding url is empty".into()));
        }
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        format!("{}/embeddings", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn name(&self) -> &str {
        "openai"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = EmbeddingRequest {
            model: &self.config.model,
            input: texts,
        };
        let mut request = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout
            } else if e.is_connect() {
                LlmError::Unavailable
            } else {
                LlmError::Request(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: EmbeddingResponse = response.json().await?;
        order_embeddings(parsed.data, texts.len())
    }
}

/// Place each embedding at its input index, requiring exactly one per input
fn order_embeddings(data: Vec<EmbeddingData>, expected: usize) -> Result<Vec<Vec<f32>>, LlmError> {
    if data.len() != expected {
        return Err(LlmError::InvalidResponse(format!(
            "expected {} embeddings, got {}",
            expected,
            data.len()
        )));
    }

    let mut ordered: Vec<Option<Vec<f32>>> = vec![None; expected];
    for item in data {
        let slot = ordered.get_mut(item.index).ok_or_else(|| {
            LlmError::InvalidResponse(format!("embedding index {} out of range", item.index))
        })?;
        *slot = Some(item.embedding);
    }

    ordered
        .into_iter()
        .enumerate()
        .map(|(i, v)| {
            v.ok_or_else(|| LlmError::InvalidResponse(format!("missing embedding {}", i)))
        })
        .collect()
}
