use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration, loaded from a TOML file.
///
/// Every empirically tuned constant in the engine — adaptive delays, batch
/// bounds, the circuit breaker threshold and cool-down, blend weights — is
/// exposed here rather than hard-coded, since the right values depend on the
/// host environment. The defaults are the values the engine shipped with.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub fetcher: FetcherConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Orchestrator lock and scheduling settings.
#[derive(Debug, Deserialize, Clone)]
pub struct IndexerConfig {
    /// How often a running instance refreshes its heartbeat, in ms.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: i64,
    /// A heartbeat younger than this means another instance is running.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: i64,
    /// Item batches at or above this size are handed to the worker through
    /// a streaming session instead of a one-shot request.
    #[serde(default = "default_stream_threshold")]
    pub stream_threshold: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: default_heartbeat_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
            stream_threshold: default_stream_threshold(),
        }
    }
}

fn default_heartbeat_ms() -> i64 {
    10_000
}
fn default_lock_timeout_ms() -> i64 {
    20_000
}
fn default_stream_threshold() -> usize {
    25
}

/// Adaptive fetch controller settings.
#[derive(Debug, Deserialize, Clone)]
pub struct FetcherConfig {
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Per-item retry attempts before the item is requeued for the next run.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_base_batch_size")]
    pub base_batch_size: usize,
    /// Consecutive failures that open the circuit breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long the circuit stays open before closing automatically, in ms.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Retry queue bound; the oldest entry is dropped beyond this.
    #[serde(default = "default_retry_queue_cap")]
    pub retry_queue_cap: usize,
    /// Responses slower than this grow the delay and shrink the batch, in ms.
    #[serde(default = "default_slow_response_ms")]
    pub slow_response_ms: u64,
    /// Responses faster than this shrink the delay and grow the batch, in ms.
    #[serde(default = "default_fast_response_ms")]
    pub fast_response_ms: u64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_retries: default_max_retries(),
            min_batch_size: default_min_batch_size(),
            max_batch_size: default_max_batch_size(),
            base_batch_size: default_base_batch_size(),
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
            retry_queue_cap: default_retry_queue_cap(),
            slow_response_ms: default_slow_response_ms(),
            fast_response_ms: default_fast_response_ms(),
        }
    }
}

fn default_min_delay_ms() -> u64 {
    50
}
fn default_max_delay_ms() -> u64 {
    5000
}
fn default_base_delay_ms() -> u64 {
    200
}
fn default_backoff_multiplier() -> f64 {
    1.5
}
fn default_max_retries() -> u32 {
    3
}
fn default_min_batch_size() -> usize {
    10
}
fn default_max_batch_size() -> usize {
    100
}
fn default_base_batch_size() -> usize {
    50
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_cooldown_ms() -> u64 {
    30_000
}
fn default_retry_queue_cap() -> usize {
    256
}
fn default_slow_response_ms() -> u64 {
    2000
}
fn default_fast_response_ms() -> u64 {
    500
}

/// Vector worker and worker manager settings.
#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Items embedded per batch inside the worker.
    #[serde(default = "default_embed_batch_size")]
    pub embed_batch_size: usize,
    /// The in-memory index is persisted every N batches (and on the last).
    #[serde(default = "default_persist_every_batches")]
    pub persist_every_batches: usize,
    /// Default streaming session batch size.
    #[serde(default = "default_stream_batch_size")]
    pub stream_batch_size: usize,
    /// Debounce before a partial stream buffer is flushed, in ms.
    #[serde(default = "default_flush_debounce_ms")]
    pub flush_debounce_ms: u64,
    /// A session with no new items for this long is force-ended, in ms.
    #[serde(default = "default_session_inactivity_ms")]
    pub session_inactivity_ms: u64,
    /// The worker is torn down after this long without work, in ms.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// How long a semantic search waits on the worker before degrading, in ms.
    #[serde(default = "default_search_timeout_ms")]
    pub search_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            embed_batch_size: default_embed_batch_size(),
            persist_every_batches: default_persist_every_batches(),
            stream_batch_size: default_stream_batch_size(),
            flush_debounce_ms: default_flush_debounce_ms(),
            session_inactivity_ms: default_session_inactivity_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            search_timeout_ms: default_search_timeout_ms(),
        }
    }
}

fn default_embed_batch_size() -> usize {
    5
}
fn default_persist_every_batches() -> usize {
    3
}
fn default_stream_batch_size() -> usize {
    10
}
fn default_flush_debounce_ms() -> u64 {
    1000
}
fn default_session_inactivity_ms() -> u64 {
    30_000
}
fn default_idle_timeout_ms() -> u64 {
    120_000
}
fn default_search_timeout_ms() -> u64 {
    10_000
}

/// Hybrid search blend weights and limits.
#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_bm25_weight")]
    pub bm25_weight: f64,
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f64,
    #[serde(default = "default_recency_weight")]
    pub recency_weight: f64,
    /// Recency boost half-life in days.
    #[serde(default = "default_half_life_days")]
    pub half_life_days: f64,
    /// Cap on the additive popularity boost.
    #[serde(default = "default_popularity_cap")]
    pub popularity_cap: f64,
    /// Lexical candidates retrieved before blending.
    #[serde(default = "default_lexical_top_k")]
    pub lexical_top_k: usize,
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
    /// Queries at or below this length skip semantic search.
    #[serde(default = "default_min_semantic_len")]
    pub min_semantic_len: usize,
    /// Debounce window collapsing rapid semantic queries, in ms.
    #[serde(default = "default_semantic_debounce_ms")]
    pub semantic_debounce_ms: u64,
    /// Similarity assumed for lexical hits absent from the vector results.
    #[serde(default = "default_vector_floor")]
    pub vector_floor: f64,
    /// Normalized edit-distance threshold for command matching.
    #[serde(default = "default_command_match_threshold")]
    pub command_match_threshold: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            bm25_weight: default_bm25_weight(),
            vector_weight: default_vector_weight(),
            recency_weight: default_recency_weight(),
            half_life_days: default_half_life_days(),
            popularity_cap: default_popularity_cap(),
            lexical_top_k: default_lexical_top_k(),
            final_limit: default_final_limit(),
            min_semantic_len: default_min_semantic_len(),
            semantic_debounce_ms: default_semantic_debounce_ms(),
            vector_floor: default_vector_floor(),
            command_match_threshold: default_command_match_threshold(),
        }
    }
}

fn default_bm25_weight() -> f64 {
    0.4
}
fn default_vector_weight() -> f64 {
    0.6
}
fn default_recency_weight() -> f64 {
    0.1
}
fn default_half_life_days() -> f64 {
    7.0
}
fn default_popularity_cap() -> f64 {
    0.3
}
fn default_lexical_top_k() -> usize {
    50
}
fn default_final_limit() -> usize {
    10
}
fn default_min_semantic_len() -> usize {
    2
}
fn default_semantic_debounce_ms() -> u64 {
    120
}
fn default_vector_floor() -> f64 {
    0.3
}
fn default_command_match_threshold() -> f64 {
    0.6
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_embed_api_batch")]
    pub batch_size: usize,
    #[serde(default = "default_embed_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: default_dims(),
            batch_size: default_embed_api_batch(),
            max_retries: default_embed_retries(),
            timeout_secs: default_embed_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_embed_api_batch() -> usize {
    64
}
fn default_embed_retries() -> u32 {
    5
}
fn default_embed_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

impl Config {
    /// Programmatic configuration with defaults everywhere except the
    /// database path. Used by embedding applications and tests.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig { path: path.into() },
            indexer: IndexerConfig::default(),
            fetcher: FetcherConfig::default(),
            worker: WorkerConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let f = &config.fetcher;
    if f.min_delay_ms > f.max_delay_ms {
        anyhow::bail!("fetcher.min_delay_ms must be <= fetcher.max_delay_ms");
    }
    if f.min_batch_size == 0 || f.min_batch_size > f.max_batch_size {
        anyhow::bail!("fetcher batch sizes must satisfy 0 < min <= max");
    }
    if f.backoff_multiplier <= 1.0 {
        anyhow::bail!("fetcher.backoff_multiplier must be > 1.0");
    }
    if f.failure_threshold == 0 {
        anyhow::bail!("fetcher.failure_threshold must be >= 1");
    }

    let r = &config.retrieval;
    for (name, w) in [
        ("retrieval.bm25_weight", r.bm25_weight),
        ("retrieval.vector_weight", r.vector_weight),
        ("retrieval.recency_weight", r.recency_weight),
    ] {
        if !(0.0..=1.0).contains(&w) {
            anyhow::bail!("{} must be in [0.0, 1.0]", name);
        }
    }
    if r.final_limit < 1 {
        anyhow::bail!("retrieval.final_limit must be >= 1");
    }
    if r.half_life_days <= 0.0 {
        anyhow::bail!("retrieval.half_life_days must be > 0");
    }

    if config.worker.embed_batch_size == 0 {
        anyhow::bail!("worker.embed_batch_size must be >= 1");
    }
    if config.worker.stream_batch_size == 0 {
        anyhow::bail!("worker.stream_batch_size must be >= 1");
    }

    let e = &config.embedding;
    match e.provider.as_str() {
        "disabled" | "hash" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, or openai.",
            other
        ),
    }
    if e.is_enabled() && e.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0 when provider is '{}'", e.provider);
    }
    if e.provider == "openai" && e.model.is_none() {
        anyhow::bail!("embedding.model must be specified when provider is 'openai'");
    }

    Ok(())
}
