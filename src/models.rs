//! Core data models used throughout Trawler.
//!
//! These types represent the items, schedules, and search results that flow
//! through the indexing and retrieval pipeline.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::commands::StaticCommand;

/// A unit of searchable content produced by a job's fetch routine.
///
/// `id` is the identity key for merge and dedupe: it must be stable and
/// unique within the item's collection. Re-indexing an existing id
/// overwrites in place (last write wins).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexItem {
    pub id: String,
    /// Short title or label.
    pub text: String,
    /// Collection / source discriminator. Matches the originating job id.
    pub category: String,
    /// Full plain-text body used for lexical and semantic matching.
    pub content: String,
    /// Epoch milliseconds. Drives the recency boost and retention purges.
    pub date_added: i64,
    /// Source-specific fields consumed by job-specific boost logic.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Opaque reference resolved by the UI layer; passed through untouched.
    pub action_id: String,
    /// Opaque reference resolved by the UI layer; passed through untouched.
    pub render_component_id: String,
}

impl IndexItem {
    /// An item is storable when it has an identity and something to show.
    pub fn is_valid(&self) -> bool {
        !self.id.is_empty() && !self.text.is_empty() && !self.category.is_empty()
    }
}

/// An item id plus its embedding, persisted by the vector worker.
///
/// Embeddings never leave the worker except as `(id, similarity)` pairs
/// returned from search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub embedding: Vec<f32>,
}

/// Freshness policy: when a job is due to run again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frequency {
    /// Due on every orchestrator activation.
    Always,
    /// Due once `ms` milliseconds have elapsed since the last success.
    Interval { ms: i64 },
    /// The last successful run expires `after_ms` milliseconds later.
    Expiry { after_ms: i64 },
}

impl Frequency {
    /// Whether a job with this policy is due at `now`, given its last
    /// successful completion time. Jobs with no recorded run are always due.
    pub fn is_due(&self, last_run: Option<i64>, now: i64) -> bool {
        match (self, last_run) {
            (Frequency::Always, _) => true,
            (_, None) => true,
            (Frequency::Interval { ms }, Some(last)) => now - last >= *ms,
            (Frequency::Expiry { after_ms }, Some(last)) => now - last >= *after_ms,
        }
    }
}

/// The sole externally observable indexing signal, emitted after each job
/// completes or is skipped and around the vectorization hand-off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub completed: usize,
    pub total: usize,
    pub indexing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ProgressEvent {
    pub fn new(completed: usize, total: usize, indexing: bool, status: impl Into<String>) -> Self {
        Self {
            completed,
            total,
            indexing,
            status: Some(status.into()),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Discriminates ranked results from the two corpora.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    Command,
    Dynamic,
}

/// The matched payload of a ranked result.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RankedPayload {
    Command(StaticCommand),
    Dynamic(IndexItem),
}

/// A ranked search result returned from
/// [`SearchService::perform_search`](crate::service::SearchService::perform_search).
#[derive(Debug, Clone, Serialize)]
pub struct RankedResult {
    pub id: String,
    pub kind: ResultKind,
    pub score: f64,
    pub item: RankedPayload,
    /// Lexical match excerpt, when the lexical index produced one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}
