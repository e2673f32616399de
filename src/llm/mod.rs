//! LLM collaborators
//!
//! The storage engine never computes embeddings or rewrites content itself.
//! It consumes two traits:
//! - `Embedder`: text chunks → one embedding vector per chunk
//! - `Rewriter`: feed → transformed feed, or `None` to drop it
//!
//! Implementations:
//! - `OpenAiEmbedder`: any OpenAI-compatible `/embeddings` endpoint
//! - `HashingEmbedder`: deterministic local feature hashing (offline default)

mod hashing;
mod openai;

pub use hashing::HashingEmbedder;
pub use openai::{OpenAiConfig, OpenAiEmbedder};

use crate::storage::{Feed, StorageError};
use async_trait::async_trait;
use thiserror::Error;

/// Produces embedding vectors
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Provider name for logs
    fn name(&self) -> &str;

    /// Embed every text, returning exactly one vector per input in order
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError>;
}

/// Transforms feeds before they are stored
#[async_trait]
pub trait Rewriter: Send + Sync {
    /// `Ok(None)` drops the feed
    async fn rewrite(&self, feed: Feed) -> Result<Option<Feed>, LlmError>;
}

/// Errors from LLM collaborators
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error {status}: {message}")]
    ApiError { status: u16, message: String },

    #[error("Request timed out")]
    Timeout,

    #[error("Provider unavailable")]
    Unavailable,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<LlmError> for StorageError {
    fn from(err: LlmError) -> Self {
        StorageError::Embedding(err.to_string())
    }
}
