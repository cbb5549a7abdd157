//! # Trawler
//!
//! An incremental multi-source content indexer with hybrid keyword +
//! semantic search.
//!
//! Trawler crawls content sources ("jobs") on per-source freshness
//! policies, merges results into a versioned local store, embeds new items
//! on a background vector worker, and answers queries by blending lexical
//! and semantic scores with recency and popularity boosts — all while
//! staying polite to the origin server and safe across page reloads and
//! concurrently open instances.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌───────────┐
//! │   Jobs   │──▶│ Orchestrator │──▶│  SQLite   │
//! │ feed/... │   │ lock + merge │   │ FTS5 + KV │
//! └────┬─────┘   └──────┬───────┘   └─────┬─────┘
//!      │                │ stream           │
//! ┌────▼─────┐   ┌──────▼───────┐   ┌─────▼─────┐
//! │ Adaptive │   │   Worker     │──▶│  Hybrid   │
//! │ Fetcher  │   │ (embeddings) │   │  Search   │
//! └──────────┘   └──────────────┘   └───────────┘
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trawler::config::Config;
//! use trawler::progress::NullProgress;
//! use trawler::service::SearchService;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::with_db_path("./trawler.sqlite");
//! let mut service = SearchService::open(config).await?;
//! // service.register_job(Arc::new(MyJob::new(...)));
//!
//! service.run_indexing(Arc::new(NullProgress)).await?;
//! let results = service.perform_search("physics report", 10, false).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration with tuned-constant defaults |
//! | [`models`] | Core data types |
//! | [`store`] | Versioned SQLite collection store with an FTS5 mirror |
//! | [`jobs`] | Job trait, registry, context, and the built-in jobs |
//! | [`sources`] | Host-collaborator traits jobs fetch through |
//! | [`fetcher`] | Adaptive rate/batch controller with a circuit breaker |
//! | [`indexer`] | Orchestrator: heartbeat lock, merge, progress events |
//! | [`worker`] | Vector worker task owning embeddings |
//! | [`worker_manager`] | Worker lifecycle, stream buffering, correlation |
//! | [`embedding`] | Embedding providers (hash, OpenAI, disabled) |
//! | [`search`] | Hybrid lexical + semantic ranking |
//! | [`commands`] | Static command registry |
//! | [`service`] | Top-level service wiring |
//! | [`progress`] | Progress reporter implementations |

pub mod commands;
pub mod config;
pub mod embedding;
pub mod fetcher;
pub mod indexer;
pub mod jobs;
pub mod models;
pub mod progress;
pub mod search;
pub mod service;
pub mod sources;
pub mod store;
pub mod worker;
pub mod worker_manager;
