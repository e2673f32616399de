//! Core data types for the Feedline storage engine
//!
//! This module defines the fundamental types used throughout the storage layer:
//! - `Feed`: one ingested content item
//! - `Labels`: ordered key-value semantic tags attached to a feed
//! - `FeedRef`: where a feed lives inside a block's chunk store
//! - `TimeRange`: a half-open time interval
//! - `LabelFilter` and `QueryOptions`: the query request consumed by storage
//! - `ScoredFeed`: one query hit

use crate::storage::error::{StorageError, StorageResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Default similarity threshold for semantic queries
pub const DEFAULT_THRESHOLD: f32 = 0.5;

/// Default number of results
pub const DEFAULT_LIMIT: usize = 10;

/// Upper bound on the number of results per query
pub const MAX_LIMIT: usize = 500;

/// Default query window, ending now
pub const DEFAULT_WINDOW_HOURS: i64 = 24;

/// A single semantic tag
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Label {
    pub key: String,
    pub value: String,
}

impl Label {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Ordered list of labels (source, title, content, pub_time, link, type, ...)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Labels(Vec<Label>);

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set a label, replacing any existing value for the key
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.put(key, value);
        self
    }

    /// Set a label in place, keeping the original position of an existing key
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|l| l.key == key) {
            Some(label) => label.value = value,
            None => self.0.push(Label { key, value }),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|l| l.key == key)
            .map(|l| l.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Render labels as `key: value` lines, the text form fed to embedding
    pub fn render(&self) -> String {
        let mut out = String::new();
        for label in &self.0 {
            out.push_str(&label.key);
            out.push_str(": ");
            out.push_str(&label.value);
            out.push('\n');
        }
        out
    }

    /// Split the rendered text into pieces of at most `max_chars` characters.
    ///
    /// Lines are kept together while they fit; a single line longer than
    /// `max_chars` is split on character boundaries.
    pub fn embedding_chunks(&self, max_chars: usize) -> Vec<String> {
        let max_chars = max_chars.max(1);
        let mut chunks = Vec::new();
        let mut current = String::new();
        let mut current_len = 0usize;

        for line in self.render().lines() {
            let line_len = line.chars().count() + 1;
            if current_len + line_len > max_chars && !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }

            if line_len > max_chars {
                let chars: Vec<char> = line.chars().collect();
                for piece in chars.chunks(max_chars) {
                    chunks.push(piece.iter().collect());
                }
                continue;
            }

            current.push_str(line);
            current.push('\n');
            current_len += line_len;
        }

        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }
}

impl FromIterator<(String, String)> for Labels {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut labels = Labels::new();
        for (k, v) in iter {
            labels.put(k, v);
        }
        labels
    }
}

/// One ingested content item
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Feed {
    /// Globally unique feed identifier
    pub id: u64,
    /// Semantic tags
    pub labels: Labels,
    /// Ingestion timestamp
    #[serde(default = "Utc::now")]
    pub time: DateTime<Utc>,
}

impl Feed {
    /// Create a feed stamped with the current time
    pub fn new(id: u64, labels: Labels) -> Self {
        Self {
            id,
            labels,
            time: Utc::now(),
        }
    }

    /// Builder: set the ingestion timestamp
    pub fn at(mut self, time: DateTime<Utc>) -> Self {
        self.time = time;
        self
    }

    /// Structural validation applied before a feed is accepted for append
    pub fn validate(&self) -> StorageResult<()> {
        if self.id == 0 {
            return Err(StorageError::InvalidFeed("id must be non-zero".into()));
        }
        if self.labels.is_empty() {
            return Err(StorageError::InvalidFeed(format!(
                "feed {} has no labels",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        for label in self.labels.iter() {
            if label.key.is_empty() {
                return Err(StorageError::InvalidFeed(format!(
                    "feed {} has an empty label key",
                    self.id
                )));
            }
            if !seen.insert(label.key.as_str()) {
                return Err(StorageError::InvalidFeed(format!(
                    "feed {} has duplicate label {:?}",
                    self.id, label.key
                )));
            }
        }
        Ok(())
    }
}

/// Location of a feed inside a block's chunk store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeedRef {
    /// Chunk file identifier
    pub chunk: u32,
    /// Byte offset of the record within the chunk file
    pub offset: u64,
    /// Feed timestamp (UTC)
    pub time: DateTime<Utc>,
}

/// Time range (half-open interval: [start, end))
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Start (inclusive)
    pub start: DateTime<Utc>,
    /// End (exclusive)
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Create a time range, rejecting empty or inverted intervals
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> StorageResult<Self> {
        Self::try_new(start, end).ok_or(StorageError::InvalidTimeRange)
    }

    /// Create a time range, returning None if invalid
    pub fn try_new(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Self> {
        if start < end {
            Some(Self { start, end })
        } else {
            None
        }
    }

    /// Create a range for the last N hours from now
    pub fn last_hours(hours: i64) -> Self {
        let end = Utc::now();
        Self {
            start: end - Duration::hours(hours),
            end,
        }
    }

    /// Check if a timestamp falls within this range
    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        time >= self.start && time < self.end
    }

    /// Check if this range overlaps with another
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && self.end > other.start
    }

    /// Check if `other` lies entirely inside this range
    pub fn covers(&self, other: &TimeRange) -> bool {
        self.start <= other.start && self.end >= other.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Get intersection with another range, if any
    pub fn intersection(&self, other: &TimeRange) -> Option<Self> {
        Self::try_new(self.start.max(other.start), self.end.min(other.end))
    }
}

/// Comparison used by a label filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Equal,
    NotEqual,
}

/// A parsed `key=value` or `key!=value` label filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelFilter {
    pub key: String,
    pub op: FilterOp,
    pub value: String,
}

impl LabelFilter {
    pub fn eq(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            op: FilterOp::Equal,
            value: value.into(),
        }
    }

    pub fn ne(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            op: FilterOp::NotEqual,
            value: value.into(),
        }
    }
}

impl FromStr for LabelFilter {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, op, value) = if let Some((k, v)) = s.split_once("!=") {
            (k, FilterOp::NotEqual, v)
        } else if let Some((k, v)) = s.split_once('=') {
            (k, FilterOp::Equal, v)
        } else {
            return Err(StorageError::InvalidQuery(format!(
                "label filter {:?} must be key=value or key!=value",
                s
            )));
        };

        let key = key.trim();
        if key.is_empty() {
            return Err(StorageError::InvalidQuery(format!(
                "label filter {:?} has an empty key",
                s
            )));
        }

        Ok(Self {
            key: key.to_string(),
            op,
            value: value.trim().to_string(),
        })
    }
}

impl fmt::Display for LabelFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op {
            FilterOp::Equal => write!(f, "{}={}", self.key, self.value),
            FilterOp::NotEqual => write!(f, "{}!={}", self.key, self.value),
        }
    }
}

/// Query request consumed by the storage layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "QueryRequest")]
pub struct QueryOptions {
    /// Natural-language query; empty means label/time filtering only
    #[serde(default)]
    pub query: String,
    /// Minimum similarity score in [0, 1]
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    /// Label filters in `key=value` / `key!=value` form
    #[serde(default)]
    pub label_filters: Vec<String>,
    /// Maximum number of results
    #[serde(default = "default_limit")]
    pub limit: usize,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Wire form of `QueryOptions`. A missing `end` means now and a missing
/// `start` means 24 hours before `end`.
#[derive(Deserialize)]
struct QueryRequest {
    #[serde(default)]
    query: String,
    #[serde(default = "default_threshold")]
    threshold: f32,
    #[serde(default)]
    label_filters: Vec<String>,
    #[serde(default = "default_limit")]
    limit: usize,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

impl From<QueryRequest> for QueryOptions {
    fn from(raw: QueryRequest) -> Self {
        let end = raw.end.unwrap_or_else(Utc::now);
        Self {
            query: raw.query,
            threshold: raw.threshold,
            label_filters: raw.label_filters,
            limit: raw.limit,
            start: raw
                .start
                .unwrap_or_else(|| end - Duration::hours(DEFAULT_WINDOW_HOURS)),
            end,
        }
    }
}

fn default_threshold() -> f32 {
    DEFAULT_THRESHOLD
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryOptions {
    /// Defaults: threshold 0.5, limit 10, window now-24h..now
    pub fn new() -> Self {
        let end = Utc::now();
        Self {
            query: String::new(),
            threshold: DEFAULT_THRESHOLD,
            label_filters: Vec::new(),
            limit: DEFAULT_LIMIT,
            start: end - Duration::hours(DEFAULT_WINDOW_HOURS),
            end,
        }
    }

    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    pub fn threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.label_filters.push(filter.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn range(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    /// Validate parameters, returning the parsed filters and time window
    pub fn validate(&self) -> StorageResult<(Vec<LabelFilter>, TimeRange)> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(StorageError::InvalidQuery(format!(
                "threshold {} must be within [0, 1]",
                self.threshold
            )));
        }
        if self.limit == 0 || self.limit > MAX_LIMIT {
            return Err(StorageError::InvalidQuery(format!(
                "limit {} must be within [1, {}]",
                self.limit, MAX_LIMIT
            )));
        }
        if self.end <= self.start {
            return Err(StorageError::InvalidQuery(
                "end must be strictly after start".into(),
            ));
        }

        let filters = self
            .label_filters
            .iter()
            .map(|f| f.parse())
            .collect::<StorageResult<Vec<LabelFilter>>>()?;

        Ok((
            filters,
            TimeRange {
                start: self.start,
                end: self.end,
            },
        ))
    }
}

/// One query hit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredFeed {
    pub feed: Feed,
    /// Similarity score; 0 when the query had no semantic component
    pub score: f32,
}

impl PartialEq for ScoredFeed {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScoredFeed {}

impl PartialOrd for ScoredFeed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Ordered by score, then recency, then id
impl Ord for ScoredFeed {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| self.feed.time.cmp(&other.feed.time))
            .then_with(|| self.feed.id.cmp(&other.feed.id))
    }
}
