//! Label Index - inverted index for label-based filtering
//!
//! Maps `key → value → {feed ids}` for label equality and inequality
//! filters.
//!
//! # Example
//! ```ignore
//! // Query: feeds from github that are not releases
//! let ids = index.search(&[
//!     LabelFilter::eq("source", "github"),
//!     LabelFilter::ne("type", "release"),
//! ]);
//! ```
//!
//! # Design Notes
//! - In-memory with versioned JSON persistence
//! - Deduplicates ids automatically
//! - `!=` is evaluated against the set of ids this index has seen

use crate::index::{read_lock, write_lock};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{FilterOp, LabelFilter, Labels};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::sync::RwLock;

const LABEL_INDEX_VERSION: u32 = 1;

#[derive(Debug, Default)]
struct Postings {
    /// key → value → ids
    labels: HashMap<String, HashMap<String, HashSet<u64>>>,
    /// Every indexed id
    ids: HashSet<u64>,
}

/// Serialization format for JSON persistence
#[derive(Serialize, Deserialize)]
struct LabelIndexData {
    version: u32,
    labels: HashMap<String, HashMap<String, Vec<u64>>>,
}

/// Inverted index over feed labels
#[derive(Debug, Default)]
pub struct LabelIndex {
    postings: RwLock<Postings>,
}

impl LabelIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index every label of a feed
    pub fn add(&self, id: u64, labels: &Labels) {
        let mut postings = write_lock(&self.postings);
        postings.ids.insert(id);
        for label in labels.iter() {
            postings
                .labels
                .entry(label.key.clone())
                .or_default()
                .entry(label.value.clone())
                .or_default()
                .insert(id);
        }
    }

    /// Ids matching every filter (intersection). No filters matches all ids.
    pub fn search(&self, filters: &[LabelFilter]) -> HashSet<u64> {
        let postings = read_lock(&self.postings);
        let mut result: Option<HashSet<u64>> = None;

        for filter in filters {
            let matching = postings
                .labels
                .get(&filter.key)
                .and_then(|values| values.get(&filter.value));

            let ids: HashSet<u64> = match filter.op {
                FilterOp::Equal => matching.cloned().unwrap_or_default(),
                FilterOp::NotEqual => match matching {
                    Some(m) => postings.ids.difference(m).copied().collect(),
                    None => postings.ids.clone(),
                },
            };

            result = Some(match result {
                Some(existing) => existing.intersection(&ids).copied().collect(),
                None => ids,
            });

            if result.as_ref().map_or(false, |r| r.is_empty()) {
                break;
            }
        }

        result.unwrap_or_else(|| postings.ids.clone())
    }

    /// All distinct values seen for a label key
    pub fn values(&self, key: &str) -> Vec<String> {
        read_lock(&self.postings)
            .labels
            .get(key)
            .map(|values| values.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// All known label keys
    pub fn keys(&self) -> Vec<String> {
        read_lock(&self.postings).labels.keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        read_lock(&self.postings).ids.len()
    }

    pub fn encode_to<W: Write>(&self, w: &mut W) -> StorageResult<()> {
        let postings = read_lock(&self.postings);
        let data = LabelIndexData {
            version: LABEL_INDEX_VERSION,
            labels: postings
                .labels
                .iter()
                .map(|(key, values)| {
                    let values = values
                        .iter()
                        .map(|(value, ids)| {
                            let mut ids: Vec<u64> = ids.iter().copied().collect();
                            ids.sort_unstable();
                            (value.clone(), ids)
                        })
                        .collect();
                    (key.clone(), values)
                })
                .collect(),
        };

        serde_json::to_writer(w, &data).map_err(|e| {
            StorageError::Serialization(format!("Failed to persist label index: {}", e))
        })
    }

    /// Replace the contents with a decoded index
    pub fn decode_from<R: Read>(&self, r: &mut R) -> StorageResult<()> {
        let data: LabelIndexData = serde_json::from_reader(r).map_err(|e| {
            StorageError::Serialization(format!("Failed to load label index: {}", e))
        })?;
        if data.version != LABEL_INDEX_VERSION {
            return Err(StorageError::InvalidFormat(format!(
                "label index: unsupported version {}",
                data.version
            )));
        }

        let mut decoded = Postings::default();
        for (key, values) in data.labels {
            let entry = decoded.labels.entry(key).or_default();
            for (value, ids) in values {
                decoded.ids.extend(ids.iter().copied());
                entry.insert(value, ids.into_iter().collect());
            }
        }

        *write_lock(&self.postings) = decoded;
        Ok(())
    }
}
