//! # Trawler CLI
//!
//! Operational interface for a Trawler index: initialize the database,
//! inspect its state, run an indexing pass, search, and reset the vector
//! index. Jobs and commands are registered by embedding applications
//! through the library API; the stock binary operates on whatever data
//! those applications have already indexed.
//!
//! ```bash
//! trawler --config ./trawler.toml init
//! trawler --config ./trawler.toml status
//! trawler --config ./trawler.toml search "physics report" --limit 5
//! trawler --config ./trawler.toml index --progress json
//! trawler --config ./trawler.toml reset-vectors
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use trawler::config::{load_config, Config};
use trawler::models::{RankedPayload, RankedResult};
use trawler::progress::ProgressMode;
use trawler::service::SearchService;
use trawler::store::{META, VECTORS};

/// Trawler — an incremental multi-source content indexer with hybrid
/// keyword + semantic search.
#[derive(Parser)]
#[command(
    name = "trawler",
    about = "An incremental multi-source content indexer with hybrid keyword + semantic search",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./trawler.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and all bookkeeping tables. Idempotent.
    Init,

    /// Show collections, item counts, vector count, and last-run times.
    Status,

    /// Run one indexing pass over the registered jobs.
    ///
    /// The orchestrator honors the cross-instance heartbeat lock: if
    /// another instance is indexing, this run exits without doing work.
    Index {
        /// Progress output on stderr.
        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,
    },

    /// Hybrid search over indexed content and registered commands.
    Search {
        /// Query text; empty browses by recency/priority.
        query: String,

        /// Maximum results.
        #[arg(long, default_value_t = 10)]
        limit: usize,

        /// Put the most recent dynamic items first when browsing.
        #[arg(long)]
        recent_first: bool,
    },

    /// Clear the vector index so the next run re-embeds everything.
    ResetVectors,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl ProgressArg {
    fn mode(self) -> ProgressMode {
        match self {
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => run_init(config).await,
        Commands::Status => run_status(config).await,
        Commands::Index { progress } => run_index(config, progress).await,
        Commands::Search {
            query,
            limit,
            recent_first,
        } => run_search(config, &query, limit, recent_first).await,
        Commands::ResetVectors => run_reset_vectors(config).await,
    }
}

async fn run_init(config: Config) -> Result<()> {
    let service = SearchService::open(config).await?;
    println!("initialized {}", service.store().path().display());
    service.shutdown().await;
    Ok(())
}

async fn run_status(config: Config) -> Result<()> {
    let service = SearchService::open(config).await?;
    let store = service.store();

    println!("schema version: {}", store.schema_version().await?);

    println!("{:<16} {:>8}", "COLLECTION", "ITEMS");
    for collection in store.collections().await? {
        if collection == META || collection == VECTORS {
            continue;
        }
        println!(
            "{:<16} {:>8}",
            collection,
            store.count(&collection).await?
        );
    }
    println!("{:<16} {:>8}", "(vectors)", store.count(VECTORS).await?);

    let now = chrono::Utc::now().timestamp_millis();
    for key in store.keys(META).await? {
        if let Some(job_id) = key.strip_prefix("lastrun:") {
            if let Some(ts) = store.get::<i64>(META, &key).await? {
                let minutes = (now - ts).max(0) / 60_000;
                println!("last run {:<12} {} minutes ago", job_id, minutes);
            }
        }
    }

    service.shutdown().await;
    Ok(())
}

async fn run_index(config: Config, progress: Option<ProgressArg>) -> Result<()> {
    let mode = progress
        .map(ProgressArg::mode)
        .unwrap_or_else(ProgressMode::default_for_tty);

    let service = SearchService::open(config).await?;
    if service.jobs().is_empty() {
        eprintln!("note: no jobs are registered in the stock binary; register jobs through the library API");
    }

    service.run_indexing(mode.reporter()).await?;
    println!("ok");
    service.shutdown().await;
    Ok(())
}

async fn run_search(
    config: Config,
    query: &str,
    limit: usize,
    recent_first: bool,
) -> Result<()> {
    let service = SearchService::open(config).await?;
    let results = service.perform_search(query, limit, recent_first).await?;

    if results.is_empty() {
        println!("No results.");
    } else {
        for (i, result) in results.iter().enumerate() {
            print_result(i + 1, result);
        }
    }

    service.shutdown().await;
    Ok(())
}

fn print_result(rank: usize, result: &RankedResult) {
    match &result.item {
        RankedPayload::Command(command) => {
            println!(
                "{}. [{:.2}] command / {}",
                rank, result.score, command.text
            );
            println!("    action: {}", command.action_id);
        }
        RankedPayload::Dynamic(item) => {
            println!(
                "{}. [{:.2}] {} / {}",
                rank, result.score, item.category, item.text
            );
            let date = chrono::DateTime::from_timestamp_millis(item.date_added)
                .map(|dt| dt.format("%Y-%m-%d").to_string())
                .unwrap_or_default();
            println!("    added: {}", date);
            if let Some(snippet) = &result.snippet {
                println!("    excerpt: \"{}\"", snippet.replace('\n', " "));
            }
            println!("    id: {}", item.id);
        }
    }
    println!();
}

async fn run_reset_vectors(config: Config) -> Result<()> {
    let service = SearchService::open(config).await?;
    service.reset_vectors().await?;

    // The reset runs on the worker task; wait for the persisted index to
    // empty before exiting so a fast shutdown cannot truncate it.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while service.store().count(VECTORS).await? > 0 {
        if std::time::Instant::now() >= deadline {
            anyhow::bail!("timed out waiting for the vector index to clear");
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    println!("vector index cleared");
    service.shutdown().await;
    Ok(())
}
