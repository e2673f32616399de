//! Deterministic feature-hashing embedder
//!
//! Lowercased alphanumeric tokens are hashed with CRC32 into `dimension`
//! buckets; the hash's top bit picks the sign. The result is L2-normalized,
//! so texts sharing vocabulary score high under cosine similarity. Needs no
//! network and gives identical vectors across runs.

use crate::llm::{Embedder, LlmError};
use async_trait::async_trait;

pub const DEFAULT_DIMENSION: usize = 256;

#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSION)
    }
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Embed a single text
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimension];

        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let hash = crc32fast::hash(token.to_lowercase().as_bytes());
            let bucket = (hash as usize) % self.dimension;
            let sign = if hash & 0x8000_0000 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn name(&self) -> &str {
        "hashing"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::cosine_similarity;

    #[test]
    fn test_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new(64);
        let a = embedder.embed_text("Rust 1.80 released");
        let b = embedder.embed_text("rust 1.80 RELEASED!");

        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_shared_vocabulary_scores_higher() {
        let embedder = HashingEmbedder::default();
        let query = embedder.embed_text("rust compiler release");
        let close = embedder.embed_text("new rust compiler release notes");
        let far = embedder.embed_text("gardening tips for tomatoes");

        let near_score = cosine_similarity(&query, &close).unwrap();
        let far_score = cosine_similarity(&query, &far).unwrap();
        assert!(near_score > far_score);
    }

    #[tokio::test]
    async fn test_embed_batch() {
        let embedder = HashingEmbedder::new(16);
        let texts = vec!["one".to_string(), "two".to_string(), String::new()];
        let vectors = embedder.embed(&texts).await.unwrap();

        assert_eq!(vectors.len(), 3);
        assert!(vectors.iter().all(|v| v.len() == 16));
        assert!(vectors[2].iter().all(|v| *v == 0.0));
    }
}
