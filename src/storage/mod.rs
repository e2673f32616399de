//! Feedline Storage Engine
//!
//! This module provides the time-partitioned feed storage:
//!
//! - **types**: Core data structures (Feed, Labels, FeedRef, QueryOptions)
//! - **chunk**: Append-only chunk files holding raw feed records
//! - **block**: One time-partitioned unit with its own indexes
//! - **chain**: Block lifecycle and query fan-out
//! - **engine**: Append/query entry points wired to the LLM collaborators
//! - **error**: Error types
//!
//! # Architecture
//!
//! ```text
//! Write Path:
//!   Feed → Rewrite → Embed → Head Block → Chunk + Primary/Vector/Label index
//!
//! Read Path:
//!   Query → Embed → Overlapping Blocks (concurrent) → TopK merge → Results
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use feedline::config::Config;
//! use feedline::llm::HashingEmbedder;
//! use feedline::storage::{Feed, FeedStorage, Labels, QueryOptions};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let storage = FeedStorage::new(Config::default(), Arc::new(HashingEmbedder::default()), None).await?;
//!
//!     let feed = Feed::new(1, Labels::new().with("source", "rss").with("title", "Rust 1.80"));
//!     storage.append(vec![feed]).await?;
//!
//!     let hits = storage.query(QueryOptions::new().query("rust release")).await?;
//!     for hit in hits {
//!         println!("{:.3} {}", hit.score, hit.feed.id);
//!     }
//!
//!     storage.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod block;
pub mod chain;
pub mod chunk;
pub mod engine;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use block::{Block, BlockOptions, BlockQuery, BlockState, BlockStats};
pub use chain::{BlockChain, ChainOptions, StorageStats};
pub use chunk::{ChunkRecord, ChunkStore};
pub use engine::{AppendSummary, FeedStorage};
pub use error::{StorageError, StorageResult};
pub use types::{
    Feed, FeedRef, FilterOp, Label, LabelFilter, Labels, QueryOptions, ScoredFeed, TimeRange,
};
