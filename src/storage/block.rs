//! Block - one time-partitioned storage unit
//!
//! A block covers a half-open time range and owns its chunk store plus one
//! primary, vector and label index. Directory layout:
//!
//! ```text
//! {root}/20240101T000000Z~20240102T000000Z/
//!   meta.json             start, end, state
//!   chunks/000000.dat     raw feed records
//!   index/primary.idx     id → chunk location
//!   index/vector.idx      HNSW-style graph
//!   index/labels.json     inverted label index
//! ```
//!
//! A Hot block accepts appends and persists its indexes from a background
//! flush loop. A Cold block is read-only: the final flush has happened, the
//! loop is stopped and the chunk writer is closed.

use crate::index::{IndexStats, LabelIndex, PrimaryIndex, VectorIndex, VectorIndexConfig};
use crate::storage::chunk::ChunkStore;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{Feed, FeedRef, LabelFilter, ScoredFeed, TimeRange};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Directory name timestamp format
const DIR_TIME_FORMAT: &str = "%Y%m%dT%H%M%SZ";

const META_FILE: &str = "meta.json";
const PRIMARY_FILE: &str = "primary.idx";
const VECTOR_FILE: &str = "vector.idx";
const LABELS_FILE: &str = "labels.json";

/// Block lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockState {
    Hot,
    Cold,
}

impl std::fmt::Display for BlockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockState::Hot => write!(f, "hot"),
            BlockState::Cold => write!(f, "cold"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BlockMeta {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    state: BlockState,
}

/// Per-block tunables
#[derive(Debug, Clone, Copy)]
pub struct BlockOptions {
    pub flush_interval: Duration,
    pub chunk_max_bytes: u64,
    pub vector: VectorIndexConfig,
}

impl Default for BlockOptions {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(30),
            chunk_max_bytes: 64 * 1024 * 1024,
            vector: VectorIndexConfig::default(),
        }
    }
}

/// A block-local query, shared by every block of a fan-out
#[derive(Debug, Clone)]
pub struct BlockQuery {
    /// Query embeddings; empty for label/time-only queries
    pub vectors: Vec<Vec<f32>>,
    pub threshold: f32,
    pub filters: Vec<LabelFilter>,
    pub range: TimeRange,
    pub limit: usize,
}

/// Summary of one block
#[derive(Debug, Clone)]
pub struct BlockStats {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub state: BlockState,
    pub index: IndexStats,
    pub size_bytes: u64,
}

/// One time-partitioned storage unit
pub struct Block {
    range: TimeRange,
    dir: PathBuf,
    state: Mutex<BlockState>,
    chunks: ChunkStore,
    primary: PrimaryIndex,
    vectors: VectorIndex,
    labels: LabelIndex,
    /// Serializes appends against flushes so persisted indexes agree
    writer: Mutex<()>,
    dirty: AtomicBool,
    flush_interval: watch::Sender<Duration>,
    shutdown: watch::Sender<bool>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl Block {
    /// Directory name for a block's range
    pub fn dir_name(range: &TimeRange) -> String {
        format!(
            "{}~{}",
            range.start.format(DIR_TIME_FORMAT),
            range.end.format(DIR_TIME_FORMAT)
        )
    }

    /// Create a new Hot block under `root`
    pub fn create(root: &Path, range: TimeRange, options: BlockOptions) -> StorageResult<Arc<Self>> {
        let dir = root.join(Self::dir_name(&range));
        if dir.join(META_FILE).exists() {
            return Err(StorageError::BlockOverlap(format!(
                "block directory {:?} already exists",
                dir
            )));
        }
        std::fs::create_dir_all(dir.join("index"))?;

        let chunks = ChunkStore::open(dir.join("chunks"), options.chunk_max_bytes)?;
        let block = Self::assemble(dir, range, BlockState::Hot, chunks, options);
        block.write_meta()?;

        tracing::info!(
            "Created block {} ({} → {})",
            Self::dir_name(&range),
            range.start,
            range.end
        );
        Ok(Arc::new(block))
    }

    /// Load a block directory. Any index that fails to decode fails the open.
    pub fn open(dir: &Path, options: BlockOptions) -> StorageResult<Arc<Self>> {
        let meta: BlockMeta =
            serde_json::from_reader(BufReader::new(File::open(dir.join(META_FILE))?))?;
        let range = TimeRange::new(meta.start, meta.end)?;

        let chunks = match meta.state {
            BlockState::Hot => ChunkStore::open(dir.join("chunks"), options.chunk_max_bytes)?,
            BlockState::Cold => ChunkStore::open_sealed(dir.join("chunks"), options.chunk_max_bytes)?,
        };
        let block = Self::assemble(dir.to_path_buf(), range, meta.state, chunks, options);

        let index_dir = dir.join("index");
        let loaded = [
            block.load_index(&index_dir.join(PRIMARY_FILE), |r| block.primary.decode_from(r))?,
            block.load_index(&index_dir.join(VECTOR_FILE), |r| block.vectors.decode_from(r))?,
            block.load_index(&index_dir.join(LABELS_FILE), |r| block.labels.decode_from(r))?,
        ];

        match meta.state {
            BlockState::Hot => block.recover()?,
            BlockState::Cold if loaded.iter().any(|l| !l) => {
                return Err(StorageError::Corruption(format!(
                    "cold block {:?} is missing index files",
                    dir
                )));
            }
            BlockState::Cold => block.primary.shrink_to_fit(),
        }

        tracing::info!(
            "Opened {} block {} with {} feeds",
            meta.state,
            Self::dir_name(&range),
            block.primary.count()
        );
        Ok(Arc::new(block))
    }

    fn assemble(
        dir: PathBuf,
        range: TimeRange,
        state: BlockState,
        chunks: ChunkStore,
        options: BlockOptions,
    ) -> Self {
        let (flush_interval, _) = watch::channel(options.flush_interval);
        let (shutdown, _) = watch::channel(false);
        Self {
            range,
            dir,
            state: Mutex::new(state),
            chunks,
            primary: PrimaryIndex::new(),
            vectors: VectorIndex::new(options.vector),
            labels: LabelIndex::new(),
            writer: Mutex::new(()),
            dirty: AtomicBool::new(false),
            flush_interval,
            shutdown,
            flush_task: Mutex::new(None),
        }
    }

    /// Decode an index file if present; Ok(false) when it does not exist
    fn load_index<F>(&self, path: &Path, decode: F) -> StorageResult<bool>
    where
        F: FnOnce(&mut BufReader<File>) -> StorageResult<()>,
    {
        if !path.exists() {
            return Ok(false);
        }
        let mut reader = BufReader::new(File::open(path)?);
        decode(&mut reader).map_err(|e| {
            tracing::error!("Failed to decode {:?}: {}", path, e);
            e
        })?;
        Ok(true)
    }

    /// Re-index chunk records written after the last flush
    fn recover(&self) -> StorageResult<()> {
        let mut recovered = 0usize;
        for (location, record) in self.chunks.scan()? {
            if self.primary.contains(record.feed.id) {
                continue;
            }
            self.vectors.add(record.feed.id, record.vectors)?;
            self.labels.add(record.feed.id, &record.feed.labels);
            self.primary.add(record.feed.id, location);
            recovered += 1;
        }

        if recovered > 0 {
            tracing::info!(
                "Recovered {} feeds from chunks of block {}",
                recovered,
                Self::dir_name(&self.range)
            );
            self.dirty.store(true, Ordering::Release);
        }
        Ok(())
    }

    fn lock_writer(&self) -> StorageResult<MutexGuard<'_, ()>> {
        self.writer
            .lock()
            .map_err(|e| StorageError::Lock(format!("Failed to acquire block writer: {}", e)))
    }

    fn set_state(&self, state: BlockState) {
        match self.state.lock() {
            Ok(mut s) => *s = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }

    pub fn state(&self) -> BlockState {
        match self.state.lock() {
            Ok(s) => *s,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn range(&self) -> TimeRange {
        self.range
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.range.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.range.end
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn contains_feed(&self, id: u64) -> bool {
        self.primary.contains(id)
    }

    pub fn feed_count(&self) -> u32 {
        self.primary.count()
    }

    /// Look up and read one feed
    pub fn get(&self, id: u64) -> StorageResult<Option<Feed>> {
        match self.primary.search(id) {
            Some(location) => Ok(Some(self.chunks.read(&location)?.feed)),
            None => Ok(None),
        }
    }

    /// Append a feed with its embedding vectors. Appending an id this block
    /// already holds returns the existing location.
    pub fn append(&self, feed: &Feed, vectors: Vec<Vec<f32>>) -> StorageResult<FeedRef> {
        let _guard = self.lock_writer()?;

        if self.state() != BlockState::Hot {
            return Err(StorageError::BlockNotWritable(format!(
                "block {} is cold",
                Self::dir_name(&self.range)
            )));
        }
        if !self.range.contains(feed.time) {
            return Err(StorageError::BlockNotWritable(format!(
                "feed time {} is outside block {}",
                feed.time,
                Self::dir_name(&self.range)
            )));
        }
        if let Some(existing) = self.primary.search(feed.id) {
            tracing::debug!("Feed {} already stored, skipping", feed.id);
            return Ok(existing);
        }
        self.vectors.check_dimension(&vectors)?;

        let location = self.chunks.append(feed, &vectors)?;
        self.vectors.add(feed.id, vectors)?;
        self.labels.add(feed.id, &feed.labels);
        self.primary.add(feed.id, location);
        self.dirty.store(true, Ordering::Release);

        Ok(location)
    }

    /// Run a query against this block, best hits first
    pub fn query(&self, query: &BlockQuery) -> StorageResult<Vec<ScoredFeed>> {
        let Some(window) = self.range.intersection(&query.range) else {
            return Ok(Vec::new());
        };
        let partial_window = !window.covers(&self.range);

        let allowed = if query.filters.is_empty() {
            None
        } else {
            Some(self.labels.search(&query.filters))
        };

        let scored: Vec<(u64, f32)> = if query.vectors.is_empty() {
            let ids = match allowed {
                Some(ids) => ids,
                None => self.primary.ids(),
            };
            ids.into_iter().map(|id| (id, 0.0)).collect()
        } else if allowed.is_none() && !partial_window {
            self.vectors
                .search(&query.vectors, query.threshold, query.limit)?
                .into_iter()
                .collect()
        } else {
            // Filter inside the graph walk so feeds outside the label set or
            // window cannot take result slots.
            let admit = |id: u64| {
                allowed.as_ref().map_or(true, |a| a.contains(&id))
                    && self
                        .primary
                        .search(id)
                        .map_or(false, |loc| window.contains(loc.time))
            };
            self.vectors
                .search_filtered(&query.vectors, query.threshold, query.limit, admit)?
                .into_iter()
                .collect()
        };

        let mut located: Vec<(f32, FeedRef, u64)> = scored
            .into_iter()
            .filter_map(|(id, score)| self.primary.search(id).map(|loc| (score, loc, id)))
            .filter(|(_, loc, _)| window.contains(loc.time))
            .collect();

        located.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then_with(|| b.1.time.cmp(&a.1.time))
                .then_with(|| b.2.cmp(&a.2))
        });
        located.truncate(query.limit);

        located
            .into_iter()
            .map(|(score, location, _)| {
                let record = self.chunks.read(&location)?;
                Ok(ScoredFeed {
                    feed: record.feed,
                    score,
                })
            })
            .collect()
    }

    fn write_meta(&self) -> StorageResult<()> {
        let meta = BlockMeta {
            start: self.range.start,
            end: self.range.end,
            state: self.state(),
        };
        write_atomic(&self.dir.join(META_FILE), |w| {
            serde_json::to_writer_pretty(w, &meta).map_err(StorageError::from)
        })
    }

    /// Persist indexes; caller holds the writer lock
    fn persist(&self) -> StorageResult<()> {
        self.chunks.sync()?;

        let index_dir = self.dir.join("index");
        write_atomic(&index_dir.join(PRIMARY_FILE), |w| self.primary.encode_to(w))?;
        write_atomic(&index_dir.join(VECTOR_FILE), |w| self.vectors.encode_to(w))?;
        write_atomic(&index_dir.join(LABELS_FILE), |w| self.labels.encode_to(w))?;

        self.dirty.store(false, Ordering::Release);
        tracing::debug!(
            "Flushed block {} ({} feeds)",
            Self::dir_name(&self.range),
            self.primary.count()
        );
        Ok(())
    }

    /// Persist all indexes to disk
    pub fn flush(&self) -> StorageResult<()> {
        let _guard = self.lock_writer()?;
        if self.state() == BlockState::Cold {
            return Ok(());
        }
        self.persist()
    }

    /// Flush only if something changed since the last flush
    pub fn flush_if_dirty(&self) -> StorageResult<()> {
        if self.dirty.load(Ordering::Acquire) {
            self.flush()
        } else {
            Ok(())
        }
    }

    /// Start the background flush loop (Hot blocks only)
    pub fn start_flush_loop(self: &Arc<Self>) {
        if self.state() != BlockState::Hot {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                "No async runtime; block {} will only flush on close",
                Self::dir_name(&self.range)
            );
            return;
        };

        let block: Weak<Self> = Arc::downgrade(self);
        let mut interval_rx = self.flush_interval.subscribe();
        let mut shutdown_rx = self.shutdown.subscribe();

        let handle = runtime.spawn(async move {
            loop {
                let period = *interval_rx.borrow_and_update();
                tokio::select! {
                    _ = tokio::time::sleep(period) => {
                        let Some(block) = block.upgrade() else { break };
                        if let Err(e) = block.flush_if_dirty() {
                            tracing::error!(
                                "Background flush of block {} failed: {}",
                                Block::dir_name(&block.range),
                                e
                            );
                        }
                    }
                    changed = interval_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        if let Ok(mut task) = self.flush_task.lock() {
            if let Some(previous) = task.replace(handle) {
                previous.abort();
            }
        }
    }

    /// Change the flush period; takes effect on the next tick
    pub fn set_flush_interval(&self, interval: Duration) {
        self.flush_interval.send_replace(interval);
    }

    pub fn flush_interval(&self) -> Duration {
        *self.flush_interval.borrow()
    }

    fn stop_flush_loop(&self) {
        self.shutdown.send_replace(true);
        if let Ok(mut task) = self.flush_task.lock() {
            task.take();
        }
    }

    /// Demote to Cold: final flush, stop the loop, seal the chunk store
    pub fn transform_to_cold(&self) -> StorageResult<()> {
        let _guard = self.lock_writer()?;
        if self.state() == BlockState::Cold {
            return Ok(());
        }

        self.persist()?;
        self.chunks.seal()?;
        self.set_state(BlockState::Cold);
        self.write_meta()?;
        self.stop_flush_loop();
        self.primary.shrink_to_fit();

        tracing::info!("Block {} is now cold", Self::dir_name(&self.range));
        Ok(())
    }

    /// Stop background work and persist a Hot block
    pub fn close(&self) -> StorageResult<()> {
        self.stop_flush_loop();
        if self.state() == BlockState::Hot {
            self.flush()?;
            self.chunks.sync()?;
        }
        Ok(())
    }

    /// Stop background work and remove the block directory
    pub fn delete(&self) -> StorageResult<()> {
        self.stop_flush_loop();
        std::fs::remove_dir_all(&self.dir)?;
        tracing::info!("Deleted block {}", Self::dir_name(&self.range));
        Ok(())
    }

    pub fn stats(&self) -> BlockStats {
        BlockStats {
            start: self.range.start,
            end: self.range.end,
            state: self.state(),
            index: IndexStats {
                feeds: self.primary.count(),
                vectors: self.vectors.len(),
                vector_layers: self.vectors.layer_sizes(),
                label_keys: self.labels.keys().len(),
            },
            size_bytes: self.chunks.size_bytes(),
        }
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("range", &self.range)
            .field("state", &self.state())
            .field("feeds", &self.primary.count())
            .finish()
    }
}

/// Write through a temp file and rename into place
fn write_atomic<F>(path: &Path, encode: F) -> StorageResult<()>
where
    F: FnOnce(&mut BufWriter<File>) -> StorageResult<()>,
{
    let tmp = path.with_extension("tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        encode(&mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::Labels;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use tempfile::tempdir;

    fn day() -> TimeRange {
        TimeRange::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
        )
        .unwrap()
    }

    fn feed(id: u64, hour: i64, source: &str) -> Feed {
        Feed::new(
            id,
            Labels::new()
                .with("source", source)
                .with("title", format!("item {}", id)),
        )
        .at(day().start + ChronoDuration::hours(hour))
    }

    fn query(vectors: Vec<Vec<f32>>) -> BlockQuery {
        BlockQuery {
            vectors,
            threshold: 0.5,
            filters: Vec::new(),
            range: day(),
            limit: 10,
        }
    }

    fn populated(root: &Path) -> Arc<Block> {
        let block = Block::create(root, day(), BlockOptions::default()).unwrap();
        block.append(&feed(1, 1, "github"), vec![vec![1.0, 0.0, 0.0]]).unwrap();
        block.append(&feed(2, 2, "rss"), vec![vec![0.8, 1.0, 0.0]]).unwrap();
        block
            .append(
                &feed(3, 3, "github"),
                vec![vec![0.8, 0.1, 0.1], vec![0.7, 0.1, 0.9]],
            )
            .unwrap();
        block
    }

    #[test]
    fn test_dir_name() {
        assert_eq!(
            Block::dir_name(&day()),
            "20240101T000000Z~20240102T000000Z"
        );
    }

    #[test]
    fn test_append_and_semantic_query() {
        let dir = tempdir().unwrap();
        let block = populated(dir.path());

        let mut q = query(vec![vec![1.0, 0.0, 0.0]]);
        q.threshold = 0.9;
        let hits = block.query(&q).unwrap();

        let ids: Vec<u64> = hits.iter().map(|h| h.feed.id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        assert!((hits[1].score - 0.9847).abs() < 1e-3);
    }

    #[test]
    fn test_query_with_label_filter() {
        let dir = tempdir().unwrap();
        let block = populated(dir.path());

        let mut q = query(vec![vec![1.0, 0.0, 0.0]]);
        q.threshold = 0.0;
        q.filters = vec![LabelFilter::eq("source", "github")];
        let ids: Vec<u64> = block.query(&q).unwrap().iter().map(|h| h.feed.id).collect();
        assert_eq!(ids, vec![1, 3]);

        // Label-only query ranks by recency
        let mut q = query(Vec::new());
        q.filters = vec![LabelFilter::ne("source", "github")];
        let ids: Vec<u64> = block.query(&q).unwrap().iter().map(|h| h.feed.id).collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn test_query_respects_time_window() {
        let dir = tempdir().unwrap();
        let block = populated(dir.path());

        let mut q = query(Vec::new());
        q.range = TimeRange::new(
            day().start + ChronoDuration::minutes(90),
            day().start + ChronoDuration::hours(3),
        )
        .unwrap();
        let ids: Vec<u64> = block.query(&q).unwrap().iter().map(|h| h.feed.id).collect();
        assert_eq!(ids, vec![2]);

        q.range = TimeRange::new(
            day().end,
            day().end + ChronoDuration::hours(1),
        )
        .unwrap();
        assert!(block.query(&q).unwrap().is_empty());
    }

    #[test]
    fn test_window_match_not_crowded_out_by_closer_feeds() {
        let dir = tempdir().unwrap();
        let block = Block::create(dir.path(), day(), BlockOptions::default()).unwrap();

        // Near-identical feeds early in the day, more than the result limit
        for i in 1..=12u64 {
            let jitter = i as f32 * 0.001;
            block
                .append(&feed(i, 0, "rss"), vec![vec![1.0, jitter, 0.0]])
                .unwrap();
        }
        // One weaker match late in the day
        block
            .append(&feed(100, 20, "github"), vec![vec![1.0, 1.0, 0.0]])
            .unwrap();

        let mut q = query(vec![vec![1.0, 0.0, 0.0]]);
        q.limit = 1;
        q.range = TimeRange::new(
            day().start + ChronoDuration::hours(19),
            day().start + ChronoDuration::hours(21),
        )
        .unwrap();
        let hits = block.query(&q).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].feed.id, 100);
        assert!((hits[0].score - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-4);

        // Same for a label filter that excludes the closer feeds
        let mut q = query(vec![vec![1.0, 0.0, 0.0]]);
        q.limit = 1;
        q.filters = vec![LabelFilter::eq("source", "github")];
        let ids: Vec<u64> = block.query(&q).unwrap().iter().map(|h| h.feed.id).collect();
        assert_eq!(ids, vec![100]);
    }

    #[test]
    fn test_append_rejects_out_of_range_and_bad_dimension() {
        let dir = tempdir().unwrap();
        let block = populated(dir.path());

        let late = feed(9, 30, "rss");
        assert!(matches!(
            block.append(&late, vec![vec![1.0, 0.0, 0.0]]),
            Err(StorageError::BlockNotWritable(_))
        ));

        let err = block.append(&feed(10, 4, "rss"), vec![vec![1.0, 0.0]]).unwrap_err();
        assert!(matches!(err, StorageError::DimensionMismatch { .. }));
        assert!(!block.contains_feed(10));
        assert_eq!(block.feed_count(), 3);
    }

    #[test]
    fn test_flush_and_reopen() {
        let dir = tempdir().unwrap();
        let block_dir = {
            let block = populated(dir.path());
            block.flush().unwrap();
            block.dir().to_path_buf()
        };

        let reopened = Block::open(&block_dir, BlockOptions::default()).unwrap();
        assert_eq!(reopened.state(), BlockState::Hot);
        assert_eq!(reopened.feed_count(), 3);
        assert_eq!(reopened.get(2).unwrap().unwrap().labels.get("source"), Some("rss"));
    }

    #[test]
    fn test_recovery_from_chunks() {
        let dir = tempdir().unwrap();
        let block_dir = {
            let block = populated(dir.path());
            block.flush().unwrap();
            // Appended after the last flush; only the chunk store has it
            block.append(&feed(4, 5, "rss"), vec![vec![0.0, 0.0, 1.0]]).unwrap();
            block.dir().to_path_buf()
        };

        let reopened = Block::open(&block_dir, BlockOptions::default()).unwrap();
        assert_eq!(reopened.feed_count(), 4);

        let hits = reopened.query(&query(vec![vec![0.0, 0.0, 1.0]])).unwrap();
        assert_eq!(hits[0].feed.id, 4);
    }

    #[test]
    fn test_corrupt_index_fails_open() {
        let dir = tempdir().unwrap();
        let block = populated(dir.path());
        block.flush().unwrap();

        let path = block.dir().join("index").join(PRIMARY_FILE);
        std::fs::write(&path, b"not an index at all").unwrap();

        assert!(Block::open(block.dir(), BlockOptions::default()).is_err());
    }

    #[test]
    fn test_transform_to_cold() {
        let dir = tempdir().unwrap();
        let block = populated(dir.path());
        block.transform_to_cold().unwrap();

        assert_eq!(block.state(), BlockState::Cold);
        assert!(matches!(
            block.append(&feed(5, 6, "rss"), vec![vec![1.0, 0.0, 0.0]]),
            Err(StorageError::BlockNotWritable(_))
        ));
        assert_eq!(block.query(&query(vec![vec![1.0, 0.0, 0.0]])).unwrap()[0].feed.id, 1);

        let reopened = Block::open(block.dir(), BlockOptions::default()).unwrap();
        assert_eq!(reopened.state(), BlockState::Cold);
        assert_eq!(reopened.feed_count(), 3);
    }

    #[test]
    fn test_delete_removes_directory() {
        let dir = tempdir().unwrap();
        let block = populated(dir.path());
        let path = block.dir().to_path_buf();

        block.delete().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_background_flush() {
        let dir = tempdir().unwrap();
        let options = BlockOptions {
            flush_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let block = Block::create(dir.path(), day(), options).unwrap();
        block.start_flush_loop();
        block.append(&feed(1, 1, "rss"), vec![vec![1.0, 0.0]]).unwrap();

        block.set_flush_interval(Duration::from_millis(20));
        assert_eq!(block.flush_interval(), Duration::from_millis(20));

        let primary = block.dir().join("index").join(PRIMARY_FILE);
        for _ in 0..100 {
            if primary.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(primary.exists());

        block.close().unwrap();
    }
}
