//! BlockChain - the set of all blocks
//!
//! Selects the writable head block, drives block lifecycle from a periodic
//! reconcile pass and fans queries out across time-overlapping blocks.
//!
//! ```text
//!      expired            cold             cold        hot (head)     hot (next)
//! ─────[──────)───────[──────)───────[──────)───────[──────)───────[──────)──▶ time
//!         ▲                                              ▲
//!   now - retention                                     now
//! ```

use crate::heap::TopK;
use crate::storage::block::{Block, BlockOptions, BlockQuery, BlockState, BlockStats};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{ScoredFeed, TimeRange};
use chrono::{DateTime, Duration, Utc};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::task::JoinSet;

/// How far ahead of the newest block's end the next block is created
pub const HEAD_BUFFER_MINUTES: i64 = 30;

/// Lifecycle tunables
#[derive(Debug, Clone, Copy)]
pub struct ChainOptions {
    pub block_duration: Duration,
    pub retention: Duration,
    pub block: BlockOptions,
}

impl Default for ChainOptions {
    fn default() -> Self {
        Self {
            block_duration: Duration::hours(24),
            retention: Duration::hours(192),
            block: BlockOptions::default(),
        }
    }
}

/// Storage statistics
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub block_count: usize,
    pub hot_blocks: usize,
    pub cold_blocks: usize,
    pub feed_count: u64,
    pub storage_size_bytes: u64,
}

impl std::fmt::Display for StorageStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Blocks: {} ({} hot, {} cold), Feeds: {}, Size: {:.2} MB",
            self.block_count,
            self.hot_blocks,
            self.cold_blocks,
            self.feed_count,
            self.storage_size_bytes as f64 / (1024.0 * 1024.0)
        )
    }
}

/// All blocks, ordered by start time
pub struct BlockChain {
    root: PathBuf,
    blocks: RwLock<Vec<Arc<Block>>>,
    options: RwLock<ChainOptions>,
    /// Serializes head creation so two callers never build the same block
    lifecycle: Mutex<()>,
}

impl BlockChain {
    /// Load every block under `root`. A block that fails to load fails the
    /// whole open.
    pub fn open(root: impl AsRef<Path>, options: ChainOptions) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;

        let mut blocks: Vec<Arc<Block>> = Vec::new();
        for entry in std::fs::read_dir(&root)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            if !path.join("meta.json").exists() {
                tracing::warn!("Skipping {:?}: no block metadata", path);
                continue;
            }
            blocks.push(Block::open(&path, options.block)?);
        }

        blocks.sort_by_key(|b| b.start());
        for pair in blocks.windows(2) {
            if pair[0].range().overlaps(&pair[1].range()) {
                return Err(StorageError::BlockOverlap(format!(
                    "{} and {}",
                    Block::dir_name(&pair[0].range()),
                    Block::dir_name(&pair[1].range())
                )));
            }
        }

        for block in &blocks {
            block.start_flush_loop();
        }
        tracing::info!("Loaded {} blocks from {:?}", blocks.len(), root);

        Ok(Self {
            root,
            blocks: RwLock::new(blocks),
            options: RwLock::new(options),
            lifecycle: Mutex::new(()),
        })
    }

    fn read_blocks(&self) -> RwLockReadGuard<'_, Vec<Arc<Block>>> {
        self.blocks.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_blocks(&self) -> RwLockWriteGuard<'_, Vec<Arc<Block>>> {
        self.blocks.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn options(&self) -> ChainOptions {
        *self.options.read().unwrap_or_else(|p| p.into_inner())
    }

    fn update_options(&self, update: impl FnOnce(&mut ChainOptions)) {
        let mut options = self.options.write().unwrap_or_else(|p| p.into_inner());
        update(&mut options);
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The block whose range contains the current time
    pub fn head(&self) -> Option<Arc<Block>> {
        self.head_at(Utc::now())
    }

    pub fn head_at(&self, now: DateTime<Utc>) -> Option<Arc<Block>> {
        self.get(now).filter(|b| b.state() == BlockState::Hot)
    }

    /// The block whose range contains `time`
    pub fn get(&self, time: DateTime<Utc>) -> Option<Arc<Block>> {
        self.read_blocks()
            .iter()
            .find(|b| b.range().contains(time))
            .cloned()
    }

    /// Snapshot of blocks matching `filter`, ordered by start
    pub fn list<F>(&self, filter: F) -> Vec<Arc<Block>>
    where
        F: Fn(&Block) -> bool,
    {
        self.read_blocks()
            .iter()
            .filter(|b| filter(b))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read_blocks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a block, rejecting one that overlaps an existing block
    pub fn add(&self, block: Arc<Block>) -> StorageResult<()> {
        let mut blocks = self.write_blocks();
        if let Some(existing) = blocks.iter().find(|b| b.range().overlaps(&block.range())) {
            return Err(StorageError::BlockOverlap(format!(
                "{} overlaps {}",
                Block::dir_name(&block.range()),
                Block::dir_name(&existing.range())
            )));
        }

        let pos = blocks.partition_point(|b| b.start() < block.start());
        blocks.insert(pos, block);
        Ok(())
    }

    /// Remove every block ending at or before `before`. With `teardown`, the
    /// removed blocks are deleted from disk after the set lock is released.
    pub fn remove(&self, before: DateTime<Utc>, teardown: bool) -> Vec<Arc<Block>> {
        let removed: Vec<Arc<Block>> = {
            let mut blocks = self.write_blocks();
            let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut *blocks)
                .into_iter()
                .partition(|b| b.end() <= before);
            *blocks = kept;
            gone
        };

        if teardown {
            for block in &removed {
                if let Err(e) = block.delete() {
                    tracing::error!(
                        "Failed to delete block {}: {}",
                        Block::dir_name(&block.range()),
                        e
                    );
                }
            }
        }
        removed
    }

    /// One lifecycle pass. Failures are logged and retried next pass.
    pub fn reconcile(&self, now: DateTime<Utc>) {
        if let Err(e) = self.ensure_head(now) {
            tracing::error!("Failed to ensure head block: {}", e);
        }
        if let Err(e) = self.ensure_cold(now) {
            tracing::warn!("Failed to demote blocks: {}", e);
        }
        let expired = self.ensure_expired(now);
        if expired > 0 {
            tracing::info!("Expired {} blocks", expired);
        }
    }

    /// Create the next block once `now` is within the head buffer of the
    /// newest block's end. Returns the created block.
    pub fn ensure_head(&self, now: DateTime<Utc>) -> StorageResult<Option<Arc<Block>>> {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(|p| p.into_inner());
        let max_end = self.read_blocks().iter().map(|b| b.end()).max();
        let buffer = Duration::minutes(HEAD_BUFFER_MINUTES);

        let start = match max_end {
            Some(end) if now + buffer < end => return Ok(None),
            Some(end) => end.max(now),
            None => now,
        };

        let options = self.options();
        let range = TimeRange::new(start, start + options.block_duration)?;
        let block = Block::create(&self.root, range, options.block)?;
        if let Err(e) = self.add(Arc::clone(&block)) {
            if let Err(cleanup) = block.delete() {
                tracing::error!(
                    "Failed to remove unregistered block {}: {}",
                    Block::dir_name(&range),
                    cleanup
                );
            }
            return Err(e);
        }
        block.start_flush_loop();
        Ok(Some(block))
    }

    /// Demote non-head Hot blocks whose end plus one block duration has passed
    pub fn ensure_cold(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        let grace = self.options().block_duration;
        let stale = self.list(|b| {
            b.state() == BlockState::Hot && !b.range().contains(now) && b.end() + grace <= now
        });

        let mut first_error = None;
        let mut demoted = 0;
        for block in stale {
            match block.transform_to_cold() {
                Ok(()) => demoted += 1,
                Err(e) => {
                    tracing::warn!(
                        "Failed to demote block {}: {}",
                        Block::dir_name(&block.range()),
                        e
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(demoted),
        }
    }

    /// Drop blocks past retention, returning how many were removed
    pub fn ensure_expired(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.options().retention;
        self.remove(cutoff, true).len()
    }

    /// Fan a query out to every overlapping block and merge the hits. Any
    /// block failure fails the whole query; dropping the future aborts the
    /// outstanding block tasks.
    pub async fn query(&self, query: BlockQuery) -> StorageResult<Vec<ScoredFeed>> {
        let blocks = self.list(|b| b.range().overlaps(&query.range));
        if blocks.is_empty() {
            return Ok(Vec::new());
        }

        let merged = Arc::new(Mutex::new(TopK::new(query.limit)));
        let query = Arc::new(query);
        let mut tasks = JoinSet::new();

        for block in blocks {
            let query = Arc::clone(&query);
            let merged = Arc::clone(&merged);
            tasks.spawn_blocking(move || -> StorageResult<()> {
                let hits = block.query(&query)?;
                let mut heap = merged
                    .lock()
                    .map_err(|e| StorageError::Lock(format!("Failed to merge results: {}", e)))?;
                heap.extend(hits);
                Ok(())
            });
        }

        while let Some(joined) = tasks.join_next().await {
            joined??;
        }

        let mut heap = merged
            .lock()
            .map_err(|e| StorageError::Lock(format!("Failed to merge results: {}", e)))?;
        Ok(std::mem::replace(&mut *heap, TopK::new(0)).into_sorted_desc())
    }

    /// Whether any block stores this feed id
    pub fn contains_feed(&self, id: u64) -> bool {
        self.read_blocks().iter().any(|b| b.contains_feed(id))
    }

    /// Propagate a new flush period to every live block
    pub fn set_flush_interval(&self, interval: std::time::Duration) {
        self.update_options(|o| o.block.flush_interval = interval);
        for block in self.read_blocks().iter() {
            block.set_flush_interval(interval);
        }
    }

    /// Applies to blocks created after the call
    pub fn set_block_duration(&self, duration: Duration) {
        self.update_options(|o| o.block_duration = duration);
    }

    pub fn set_retention(&self, retention: Duration) {
        self.update_options(|o| o.retention = retention);
    }

    /// Applies to blocks created after the call
    pub fn set_block_options(&self, block: BlockOptions) {
        let interval = block.flush_interval;
        self.update_options(|o| o.block = block);
        self.set_flush_interval(interval);
    }

    pub fn stats(&self) -> StorageStats {
        let blocks = self.read_blocks();
        let mut stats = StorageStats {
            block_count: blocks.len(),
            ..Default::default()
        };
        for block in blocks.iter() {
            match block.state() {
                BlockState::Hot => stats.hot_blocks += 1,
                BlockState::Cold => stats.cold_blocks += 1,
            }
            stats.feed_count += block.feed_count() as u64;
            stats.storage_size_bytes += block.stats().size_bytes;
        }
        stats
    }

    pub fn block_stats(&self) -> Vec<BlockStats> {
        self.read_blocks().iter().map(|b| b.stats()).collect()
    }

    /// Close every block, persisting Hot ones
    pub fn close(&self) -> StorageResult<()> {
        let blocks = self.list(|_| true);
        let mut result = Ok(());
        for block in blocks {
            if let Err(e) = block.close() {
                tracing::error!(
                    "Failed to close block {}: {}",
                    Block::dir_name(&block.range()),
                    e
                );
                result = Err(e);
            }
        }
        result
    }
}
