//! # Feedline
//!
//! Time-partitioned feed storage with semantic retrieval. Feeds are appended
//! into fixed-duration blocks, each carrying its own exact-lookup index, an
//! HNSW-style vector index and a label index; queries fan out over the blocks
//! that overlap the requested window and merge through a bounded heap.
//!
//! ## Modules
//!
//! - [`storage`]: Blocks, block chain lifecycle, append/query engine
//! - [`index`]: Primary, vector and label index structures
//! - [`heap`]: Bounded top-k heap used for result merging
//! - [`llm`]: Embedding and rewrite collaborators
//! - [`config`]: TOML configuration with environment overrides

pub mod config;
pub mod heap;
pub mod index;
pub mod llm;
pub mod storage;

// Re-export top-level types for convenience
pub use storage::{
    AppendSummary, Block, BlockChain, BlockState, Feed, FeedRef, FeedStorage, LabelFilter, Labels,
    QueryOptions, ScoredFeed, StorageError, StorageResult, StorageStats, TimeRange,
};

pub use index::{IndexStats, LabelIndex, PrimaryIndex, VectorIndex, VectorIndexConfig};

pub use heap::TopK;

pub use llm::{Embedder, HashingEmbedder, LlmError, OpenAiConfig, OpenAiEmbedder, Rewriter};

pub use config::{Config, ConfigError, EmbeddingProvider};
