//! Feedline CLI
//!
//! Command-line interface for Feedline operations:
//! - Run the storage engine with its lifecycle loop
//! - Append feeds from a file
//! - Query stored feeds
//! - Inspect blocks
//! - Generate a default config

use anyhow::{bail, Context};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use feedline::config::{Config, EmbeddingProvider, LoggingConfig};
use feedline::llm::{Embedder, HashingEmbedder, OpenAiConfig, OpenAiEmbedder};
use feedline::storage::{Feed, FeedStorage, QueryOptions, ScoredFeed};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "feedline")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Time-partitioned feed storage with semantic search")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: search standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the storage directory
    #[arg(long, global = true)]
    pub dir: Option<PathBuf>,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table", global = true)]
    pub format: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run storage and reconcile block lifecycle until Ctrl-C
    Serve,

    /// Append feeds from a JSON array or JSON lines file
    Append {
        /// Path to the feed file
        path: PathBuf,
    },

    /// Query stored feeds
    Query {
        /// Natural-language query (omit for label/time filtering only)
        query: Option<String>,
        /// Label filters: key=value or key!=value
        #[arg(short = 'l', long = "label")]
        labels: Vec<String>,
        /// Minimum similarity score
        #[arg(short, long, default_value = "0.5")]
        threshold: f32,
        /// Maximum number of results
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
        /// Time window ending now (e.g., 6h, 1d, 1w)
        #[arg(long, default_value = "24h")]
        last: String,
    },

    /// List blocks
    Blocks,

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Config { output } = &cli.command {
        let content = feedline::config::generate_default_config();
        match output {
            Some(path) => {
                std::fs::write(path, content)
                    .with_context(|| format!("writing config to {:?}", path))?;
                println!("Config written to {:?}", path);
            }
            None => print!("{}", content),
        }
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    if let Some(dir) = &cli.dir {
        config.storage.dir = dir.clone();
    }
    config.validate()?;

    init_logging(&config.logging);
    tracing::info!("Feedline v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Data directory: {:?}", config.storage.dir);

    let embedder = build_embedder(&config)?;
    let storage = Arc::new(FeedStorage::new(config, embedder, None).await?);

    let result = run(&cli, &storage).await;

    storage.shutdown().await?;
    result
}

async fn run(cli: &Cli, storage: &Arc<FeedStorage>) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Serve => {
            let reconcile = storage.start_background_reconcile();
            tracing::info!("Storage stats: {}", storage.stats());

            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;

            tracing::info!("Shutting down...");
            reconcile.abort();
        }

        Commands::Append { path } => {
            let feeds = read_feeds(path)?;
            let total = feeds.len();
            let summary = storage.append(feeds).await?;
            println!("{} feeds read: {}", total, summary);
        }

        Commands::Query {
            query,
            labels,
            threshold,
            limit,
            last,
        } => {
            let end = Utc::now();
            let mut options = QueryOptions::new()
                .threshold(*threshold)
                .limit(*limit)
                .range(end - parse_duration(last)?, end);
            if let Some(q) = query {
                options = options.query(q.clone());
            }
            for label in labels {
                options = options.filter(label.clone());
            }

            let hits = storage.query(options).await?;
            match cli.format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&hits)?),
                _ => print_hits(&hits),
            }
        }

        Commands::Blocks => {
            let blocks = storage.block_stats();
            if cli.format == "json" {
                let rows: Vec<serde_json::Value> = blocks
                    .iter()
                    .map(|b| {
                        serde_json::json!({
                            "start": b.start,
                            "end": b.end,
                            "state": b.state,
                            "feeds": b.index.feeds,
                            "vector_layers": b.index.vector_layers,
                            "size_bytes": b.size_bytes,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if blocks.is_empty() {
                println!("No blocks yet.");
            } else {
                println!(
                    "{:<22} {:<22} {:<6} {:>8} {:>10}",
                    "Start", "End", "State", "Feeds", "Size"
                );
                println!("{}", "-".repeat(72));
                for b in &blocks {
                    println!(
                        "{:<22} {:<22} {:<6} {:>8} {:>10}",
                        b.start.format("%Y-%m-%dT%H:%M:%SZ"),
                        b.end.format("%Y-%m-%dT%H:%M:%SZ"),
                        b.state,
                        b.index.feeds,
                        format_bytes(b.size_bytes)
                    );
                }
                println!();
                println!("{}", storage.stats());
            }
        }

        Commands::Config { .. } => {}
    }
    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("feedline={}", logging.level)));
    let registry = tracing_subscriber::registry().with(filter);

    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn build_embedder(config: &Config) -> anyhow::Result<Arc<dyn Embedder>> {
    let embedding = &config.embedding;
    Ok(match embedding.provider {
        EmbeddingProvider::Hashing => Arc::new(HashingEmbedder::new(embedding.dimension)),
        EmbeddingProvider::Openai => Arc::new(OpenAiEmbedder::new(OpenAiConfig {
            base_url: embedding.url.clone(),
            model: embedding.model.clone(),
            api_key: embedding.api_key.clone(),
            request_timeout: std::time::Duration::from_secs(embedding.request_timeout_secs),
        })?),
    })
}

/// Parse a JSON array of feeds, falling back to one feed per line
fn read_feeds(path: &Path) -> anyhow::Result<Vec<Feed>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading feeds from {:?}", path))?;

    if content.trim_start().starts_with('[') {
        return serde_json::from_str(&content).context("parsing feed array");
    }

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).with_context(|| format!("parsing feed on line {}", i + 1))
        })
        .collect()
}

fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim().to_lowercase();

    if let Some(hours) = s.strip_suffix('h') {
        Ok(Duration::hours(hours.parse()?))
    } else if let Some(days) = s.strip_suffix('d') {
        Ok(Duration::days(days.parse()?))
    } else if let Some(weeks) = s.strip_suffix('w') {
        Ok(Duration::weeks(weeks.parse()?))
    } else {
        bail!("Invalid duration format: {}. Use: 6h, 7d, 2w", s)
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

fn print_hits(hits: &[ScoredFeed]) {
    if hits.is_empty() {
        println!("No matching feeds.");
        return;
    }

    println!("{:>6}  {:<20} {:<12} {}", "Score", "Time", "Source", "Title");
    println!("{}", "-".repeat(72));
    for hit in hits {
        println!(
            "{:>6.3}  {:<20} {:<12} {}",
            hit.score,
            hit.feed.time.format("%Y-%m-%d %H:%M:%S"),
            hit.feed.labels.get("source").unwrap_or("-"),
            hit.feed.labels.get("title").unwrap_or("-")
        );
    }
}
