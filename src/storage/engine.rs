//! Feedline Storage Engine
//!
//! Orchestrates the block chain and the LLM collaborators:
//! - Write path: Feeds → validate → dedupe → rewrite → embed → head Block
//! - Read path: QueryOptions → embed query → fan out to Blocks → merge
//!
//! Block lifecycle runs on a background reconcile task.

use crate::config::Config;
use crate::llm::{Embedder, Rewriter};
use crate::storage::block::{Block, BlockQuery, BlockStats};
use crate::storage::chain::{BlockChain, StorageStats};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{Feed, QueryOptions, ScoredFeed};
use chrono::Utc;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::time::interval;

/// Outcome of a batch append
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppendSummary {
    /// Feeds committed to the head block
    pub appended: usize,
    /// Duplicates and feeds the rewriter dropped
    pub dropped: usize,
    /// Feeds that failed validation, rewrite, embedding or write
    pub failed: usize,
}

impl std::fmt::Display for AppendSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "appended {}, dropped {}, failed {}",
            self.appended, self.dropped, self.failed
        )
    }
}

/// The main feed storage engine
pub struct FeedStorage {
    config: RwLock<Config>,
    chain: Arc<BlockChain>,
    embedder: Arc<dyn Embedder>,
    rewriter: Option<Arc<dyn Rewriter>>,
    shutdown: Arc<AtomicBool>,
}

impl FeedStorage {
    /// Open storage under `config.storage.dir` and make sure a head block
    /// exists.
    pub async fn new(
        config: Config,
        embedder: Arc<dyn Embedder>,
        rewriter: Option<Arc<dyn Rewriter>>,
    ) -> StorageResult<Self> {
        config
            .validate()
            .map_err(|e| StorageError::Config(e.to_string()))?;

        let chain = BlockChain::open(&config.storage.dir, config.chain_options())?;
        chain.reconcile(Utc::now());

        tracing::info!(
            "Storage opened at {:?} with {} embedder",
            config.storage.dir,
            embedder.name()
        );

        Ok(Self {
            config: RwLock::new(config),
            chain: Arc::new(chain),
            embedder,
            rewriter,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    fn config_snapshot(&self) -> Config {
        self.config
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn chain(&self) -> &BlockChain {
        &self.chain
    }

    pub fn dir(&self) -> PathBuf {
        self.config_snapshot().storage.dir
    }

    /// Append a batch of feeds. Succeeds if at least one feed commits (or
    /// nothing failed); fails with `AllFailed` when every candidate failed.
    pub async fn append(&self, feeds: Vec<Feed>) -> StorageResult<AppendSummary> {
        let mut summary = AppendSummary::default();
        if feeds.is_empty() {
            return Ok(summary);
        }

        let chunk_chars = self.config_snapshot().storage.embedding_chunk_chars;
        let mut seen = HashSet::new();
        let mut last_error = None;

        for feed in feeds {
            if let Err(e) = feed.validate() {
                tracing::warn!("Rejected feed {}: {}", feed.id, e);
                summary.failed += 1;
                last_error = Some(e);
                continue;
            }
            if !seen.insert(feed.id) || self.chain.contains_feed(feed.id) {
                tracing::debug!("Feed {} already stored, dropping", feed.id);
                summary.dropped += 1;
                continue;
            }

            match self.ingest(feed, chunk_chars).await {
                Ok(true) => summary.appended += 1,
                Ok(false) => summary.dropped += 1,
                Err(e) => {
                    tracing::warn!("Failed to append feed: {}", e);
                    summary.failed += 1;
                    last_error = Some(e);
                }
            }
        }

        if summary.appended == 0 && summary.failed > 0 {
            let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
            return Err(StorageError::AllFailed(format!(
                "{} feeds failed, last error: {}",
                summary.failed, reason
            )));
        }

        tracing::debug!("Append batch: {}", summary);
        Ok(summary)
    }

    /// Rewrite, embed and store one feed. Ok(false) means it was dropped.
    async fn ingest(&self, feed: Feed, chunk_chars: usize) -> StorageResult<bool> {
        let id = feed.id;
        let mut feed = match &self.rewriter {
            Some(rewriter) => match rewriter.rewrite(feed).await {
                Ok(Some(rewritten)) => rewritten,
                Ok(None) => {
                    tracing::debug!("Rewriter dropped feed {}", id);
                    return Ok(false);
                }
                Err(e) => return Err(StorageError::Rewrite(format!("feed {}: {}", id, e))),
            },
            None => feed,
        };
        feed.id = id;
        feed.validate()?;

        let texts = feed.labels.embedding_chunks(chunk_chars);
        let vectors = self
            .embedder
            .embed(&texts)
            .await
            .map_err(|e| StorageError::Embedding(format!("feed {}: {}", id, e)))?;
        if vectors.len() != texts.len() {
            return Err(StorageError::Embedding(format!(
                "feed {}: expected {} vectors, got {}",
                id,
                texts.len(),
                vectors.len()
            )));
        }

        let head = self.head_block().await?;
        feed.time = Utc::now();
        match head.append(&feed, vectors.clone()) {
            Err(StorageError::BlockNotWritable(reason)) => {
                // The head rolled over between lookup and write
                tracing::debug!("Retrying feed {} on new head: {}", id, reason);
                let head = self.head_block().await?;
                feed.time = Utc::now();
                head.append(&feed, vectors)?;
            }
            other => {
                other?;
            }
        }
        Ok(true)
    }

    /// The writable head, creating it if the chain has none covering now
    async fn head_block(&self) -> StorageResult<Arc<Block>> {
        if let Some(head) = self.chain.head() {
            return Ok(head);
        }
        let chain = Arc::clone(&self.chain);
        tokio::task::spawn_blocking(move || chain.ensure_head(Utc::now())).await??;
        self.chain.head().ok_or(StorageError::NoHeadBlock)
    }

    /// Semantic and/or label query across every block overlapping the window
    pub async fn query(&self, options: QueryOptions) -> StorageResult<Vec<ScoredFeed>> {
        let (filters, range) = options.validate()?;

        let vectors = if options.query.trim().is_empty() {
            Vec::new()
        } else {
            let vectors = self
                .embedder
                .embed(std::slice::from_ref(&options.query))
                .await?;
            if vectors.is_empty() {
                return Err(StorageError::Embedding("no query embedding returned".into()));
            }
            vectors
        };

        self.chain
            .query(BlockQuery {
                vectors,
                threshold: options.threshold,
                filters,
                range,
                limit: options.limit,
            })
            .await
    }

    /// Run one lifecycle pass now
    pub fn reconcile(&self) {
        self.chain.reconcile(Utc::now());
    }

    /// Start background reconcile task
    pub fn start_background_reconcile(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let storage = Arc::clone(self);
        let period = storage.config_snapshot().storage.reconcile_interval();

        tokio::spawn(async move {
            let mut ticker = interval(period);

            loop {
                ticker.tick().await;

                if storage.shutdown.load(Ordering::Acquire) {
                    break;
                }

                let chain = Arc::clone(&storage.chain);
                let pass = tokio::task::spawn_blocking(move || chain.reconcile(Utc::now()));
                if let Err(e) = pass.await {
                    tracing::error!("Reconcile task failed: {}", e);
                }
            }
        })
    }

    /// Apply a reloaded config. The storage directory cannot change.
    pub fn apply(&self, new_config: Config) -> StorageResult<()> {
        new_config
            .validate()
            .map_err(|e| StorageError::Config(e.to_string()))?;

        let mut config = self.config.write().unwrap_or_else(|p| p.into_inner());
        if new_config.storage.dir != config.storage.dir {
            return Err(StorageError::Config(format!(
                "storage.dir cannot change at runtime ({:?} -> {:?})",
                config.storage.dir, new_config.storage.dir
            )));
        }

        let options = new_config.chain_options();
        self.chain.set_block_duration(options.block_duration);
        self.chain.set_retention(options.retention);
        self.chain.set_block_options(options.block);

        tracing::info!("Applied new storage configuration");
        *config = new_config;
        Ok(())
    }

    /// Get storage statistics
    pub fn stats(&self) -> StorageStats {
        self.chain.stats()
    }

    pub fn block_stats(&self) -> Vec<BlockStats> {
        self.chain.block_stats()
    }

    /// Shutdown the engine gracefully
    pub async fn shutdown(&self) -> StorageResult<()> {
        self.shutdown.store(true, Ordering::Release);
        let chain = Arc::clone(&self.chain);
        tokio::task::spawn_blocking(move || chain.close()).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{HashingEmbedder, LlmError};
    use crate::storage::types::Labels;
    use async_trait::async_trait;
    use chrono::Duration;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.storage.dir = dir.to_path_buf();
        config
    }

    async fn create_test_storage(
        rewriter: Option<Arc<dyn Rewriter>>,
    ) -> (FeedStorage, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let storage = FeedStorage::new(
            test_config(dir.path()),
            Arc::new(HashingEmbedder::new(256)),
            rewriter,
        )
        .await
        .unwrap();
        (storage, dir)
    }

    fn feed(id: u64, title: &str) -> Feed {
        Feed::new(
            id,
            Labels::new()
                .with("source", if id % 2 == 0 { "github" } else { "rss" })
                .with("title", title),
        )
    }

    /// Drops even ids, fails on ids divisible by 3, uppercases titles
    struct PickyRewriter;

    #[async_trait]
    impl Rewriter for PickyRewriter {
        async fn rewrite(&self, mut feed: Feed) -> Result<Option<Feed>, LlmError> {
            if feed.id % 3 == 0 {
                return Err(LlmError::InvalidResponse("cannot rewrite".into()));
            }
            if feed.id % 2 == 0 {
                return Ok(None);
            }
            let title = feed.labels.get("title").unwrap_or_default().to_uppercase();
            feed.labels.put("title", title);
            Ok(Some(feed))
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        fn name(&self) -> &str {
            "failing"
        }

        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
            Err(LlmError::Unavailable)
        }
    }

    #[tokio::test]
    async fn test_storage_creation() {
        let (storage, _dir) = create_test_storage(None).await;
        let stats = storage.stats();
        assert_eq!(stats.block_count, 1);
        assert_eq!(stats.hot_blocks, 1);
        assert_eq!(stats.feed_count, 0);
        assert!(storage.chain().head().is_some());
    }

    #[tokio::test]
    async fn test_append_and_query() {
        let (storage, _dir) = create_test_storage(None).await;

        let summary = storage
            .append(vec![
                feed(1, "rust compiler release notes"),
                feed(2, "gardening tips for tomatoes"),
                feed(3, "new rust release announced"),
            ])
            .await
            .unwrap();
        assert_eq!(summary.appended, 3);

        let hits = storage
            .query(QueryOptions::new().query("rust release").threshold(0.4))
            .await
            .unwrap();
        let mut ids: Vec<u64> = hits.iter().map(|h| h.feed.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 3]);
        assert!(hits.iter().all(|h| h.score >= 0.4));

        let hits = storage
            .query(QueryOptions::new().filter("source=github"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].feed.id, 2);
    }

    #[tokio::test]
    async fn test_append_drops_duplicates() {
        let (storage, _dir) = create_test_storage(None).await;
        storage.append(vec![feed(1, "first")]).await.unwrap();

        let summary = storage
            .append(vec![feed(1, "again"), feed(5, "fresh"), feed(5, "twice")])
            .await
            .unwrap();
        assert_eq!(
            summary,
            AppendSummary {
                appended: 1,
                dropped: 2,
                failed: 0
            }
        );
        assert_eq!(storage.stats().feed_count, 2);
    }

    #[tokio::test]
    async fn test_append_stamps_ingestion_time() {
        let (storage, _dir) = create_test_storage(None).await;
        let old = feed(1, "old news").at(Utc::now() - Duration::days(30));
        storage.append(vec![old]).await.unwrap();

        let stored = storage.chain().head().unwrap().get(1).unwrap().unwrap();
        assert!(Utc::now() - stored.time < Duration::minutes(1));
    }

    #[tokio::test]
    async fn test_partial_batch_commits_successes() {
        let (storage, _dir) = create_test_storage(Some(Arc::new(PickyRewriter))).await;

        // 1 ok, 2 dropped, 3 fails, 0 invalid
        let summary = storage
            .append(vec![feed(1, "kept"), feed(2, "dropped"), feed(3, "broken"), feed(0, "bad")])
            .await
            .unwrap();
        assert_eq!(
            summary,
            AppendSummary {
                appended: 1,
                dropped: 1,
                failed: 2
            }
        );

        let stored = storage.chain().head().unwrap().get(1).unwrap().unwrap();
        assert_eq!(stored.labels.get("title"), Some("KEPT"));
    }

    #[tokio::test]
    async fn test_all_failed_batch_errors() {
        let (storage, _dir) = create_test_storage(Some(Arc::new(PickyRewriter))).await;
        let err = storage
            .append(vec![feed(3, "a"), feed(9, "b")])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::AllFailed(_)));

        // Only drops is not a failure
        let summary = storage.append(vec![feed(2, "c")]).await.unwrap();
        assert_eq!(summary.dropped, 1);
    }

    #[tokio::test]
    async fn test_embedding_failure_fails_batch() {
        let dir = tempdir().unwrap();
        let storage = FeedStorage::new(test_config(dir.path()), Arc::new(FailingEmbedder), None)
            .await
            .unwrap();

        let err = storage.append(vec![feed(1, "x")]).await.unwrap_err();
        assert!(matches!(err, StorageError::AllFailed(_)));
        assert!(storage.query(QueryOptions::new().query("x")).await.is_err());
    }

    #[tokio::test]
    async fn test_query_validation() {
        let (storage, _dir) = create_test_storage(None).await;
        let err = storage
            .query(QueryOptions::new().limit(1000))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidQuery(_)));
    }

    #[tokio::test]
    async fn test_apply_config() {
        let (storage, dir) = create_test_storage(None).await;

        let mut config = test_config(dir.path());
        config.storage.flush_interval_secs = 5;
        config.storage.retention_hours = 48;
        storage.apply(config).unwrap();

        let head = storage.chain().head().unwrap();
        assert_eq!(head.flush_interval(), std::time::Duration::from_secs(5));
        assert_eq!(storage.chain().options().retention, Duration::hours(48));

        let other = tempdir().unwrap();
        assert!(matches!(
            storage.apply(test_config(other.path())),
            Err(StorageError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_persistence() {
        let dir = tempdir().unwrap();
        {
            let storage = FeedStorage::new(
                test_config(dir.path()),
                Arc::new(HashingEmbedder::new(256)),
                None,
            )
            .await
            .unwrap();
            storage
                .append(vec![feed(1, "persisted feed"), feed(2, "another one")])
                .await
                .unwrap();
            storage.shutdown().await.unwrap();
        }

        let storage = FeedStorage::new(
            test_config(dir.path()),
            Arc::new(HashingEmbedder::new(256)),
            None,
        )
        .await
        .unwrap();
        assert_eq!(storage.stats().feed_count, 2);

        let hits = storage
            .query(QueryOptions::new().query("persisted feed").threshold(0.5))
            .await
            .unwrap();
        assert_eq!(hits[0].feed.id, 1);
    }
}
