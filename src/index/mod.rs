//! Feedline Index Structures
//!
//! Each block owns one of each:
//!
//! - **PrimaryIndex**: exact feed id → chunk location
//! - **VectorIndex**: HNSW-style graph for semantic similarity search
//! - **LabelIndex**: inverted index for label filters
//!
//! # Architecture
//!
//! ```text
//! Query: "rust release notes" where source=github
//!        ↓
//! LabelIndex:   source=github          → {3, 8, 12, 40}
//! VectorIndex:  embed(query), search   → {8: 0.91, 40: 0.77, 51: 0.74}
//!        ↓ intersect
//! PrimaryIndex: 8 → (chunk 0, offset 4096), 40 → (chunk 1, offset 128)
//!        ↓
//! Read only the matching records
//! ```
//!
//! Every index is guarded by its own RwLock; no lock spans indexes.

pub mod codec;
mod inverted;
mod primary;
pub mod quantize;
mod vector;

pub use inverted::LabelIndex;
pub use primary::PrimaryIndex;
pub use vector::{cosine_similarity, max_similarity, VectorIndex, VectorIndexConfig};

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read guard, recovering the data if a writer panicked
pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Acquire a write guard, recovering the data if a writer panicked
pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Statistics about one block's indexes
#[derive(Debug, Clone, Default)]
pub struct IndexStats {
    /// Entries in the primary index
    pub feeds: u32,
    /// Nodes in the vector graph
    pub vectors: usize,
    /// Members per vector layer, layer 0 first
    pub vector_layers: Vec<usize>,
    /// Distinct label keys
    pub label_keys: usize,
}
