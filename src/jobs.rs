//! Job trait, registry, and the context handed to running jobs.
//!
//! A job is a declarative, independently scheduled unit of content retrieval
//! and indexing: an id, a freshness policy, a fetch routine, an optional
//! purge routine, and an optional score-boost routine. Jobs never touch the
//! store directly — all access goes through the narrow [`JobContext`], which
//! scopes reads and writes to the job's own collection so one job cannot
//! corrupt another's data.
//!
//! # Implementing a job
//!
//! ```rust
//! use async_trait::async_trait;
//! use anyhow::Result;
//! use trawler::jobs::{Job, JobContext};
//! use trawler::models::{Frequency, IndexItem};
//!
//! pub struct PinboardJob;
//!
//! #[async_trait]
//! impl Job for PinboardJob {
//!     fn id(&self) -> &str { "pinboard" }
//!     fn label(&self) -> &str { "Pinboard" }
//!     fn frequency(&self) -> Frequency { Frequency::Interval { ms: 60 * 60 * 1000 } }
//!     fn render_component_id(&self) -> &str { "pinboard-row" }
//!
//!     async fn run(&self, _ctx: &JobContext) -> Result<Vec<IndexItem>> {
//!         // ... call the host, shape records into IndexItems
//!         Ok(vec![])
//!     }
//! }
//! ```

pub mod bulletins;
pub mod catalog;
pub mod feed;
pub mod worklist;

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

use crate::models::{Frequency, IndexItem};
use crate::store::{Store, META};

/// A declarative, independently scheduled unit of content retrieval.
///
/// # Idempotence
///
/// `run` must be idempotent with respect to already-stored ids: the
/// orchestrator may re-invoke it after a partial failure, and the merge rule
/// (incoming wins by id) makes repeated items harmless.
#[async_trait]
pub trait Job: Send + Sync {
    /// Stable job identifier; doubles as the job's collection name.
    fn id(&self) -> &str;

    /// Human-readable label used in progress events.
    fn label(&self) -> &str;

    /// When this job is due to run again.
    fn frequency(&self) -> Frequency;

    /// Opaque render reference attached to this job's items.
    fn render_component_id(&self) -> &str;

    /// Fetch and return new or updated items. Items written incrementally
    /// via [`JobContext::add_item`] may be omitted from the return value;
    /// returned items additionally flow into the vectorization hand-off.
    async fn run(&self, ctx: &JobContext) -> Result<Vec<IndexItem>>;

    /// Filter the merged item set after a successful run. The default keeps
    /// everything.
    fn purge(&self, items: Vec<IndexItem>) -> Vec<IndexItem> {
        items
    }

    /// Job-specific additive score adjustment for an item under a query,
    /// in raw units that the search layer normalizes by 100. Return `None`
    /// to leave scoring untouched.
    fn boost(&self, _item: &IndexItem, _query: &str) -> Option<f64> {
        None
    }
}

/// Registry of jobs, keyed by id, preserving registration order.
///
/// Registration order is execution order, so jobs whose collections feed
/// later jobs (cross-collection dedupe) should be registered first.
pub struct JobRegistry {
    jobs: Vec<Arc<dyn Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self { jobs: Vec::new() }
    }

    pub fn register(&mut self, job: Arc<dyn Job>) {
        self.jobs.push(job);
    }

    pub fn jobs(&self) -> &[Arc<dyn Job>] {
        &self.jobs
    }

    pub fn find(&self, id: &str) -> Option<&Arc<dyn Job>> {
        self.jobs.iter().find(|j| j.id() == id)
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Store access scoped to one job's collection, plus generic progress
/// checkpointing. The only handle a job ever sees.
pub struct JobContext {
    store: Arc<Store>,
    job_id: String,
}

impl JobContext {
    pub fn new(store: Arc<Store>, job_id: impl Into<String>) -> Self {
        Self {
            store,
            job_id: job_id.into(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    fn collection<'a>(&'a self, collection: Option<&'a str>) -> &'a str {
        collection.unwrap_or(&self.job_id)
    }

    /// All stored items, defaulting to this job's own collection.
    pub async fn get_stored_items(&self, collection: Option<&str>) -> Result<Vec<IndexItem>> {
        self.store.get_all_items(self.collection(collection)).await
    }

    /// Replace the collection's contents with `items`, dropping invalid ones.
    pub async fn set_stored_items(
        &self,
        items: Vec<IndexItem>,
        collection: Option<&str>,
    ) -> Result<()> {
        let target = self.collection(collection);
        self.store.clear(target).await?;
        for item in items.iter().filter(|i| i.is_valid()) {
            self.store.put_item(target, item).await?;
        }
        Ok(())
    }

    /// Write one item immediately. Invalid items are dropped.
    pub async fn add_item(&self, item: &IndexItem, collection: Option<&str>) -> Result<()> {
        if !item.is_valid() {
            tracing::warn!(job = %self.job_id, id = %item.id, "dropping invalid item");
            return Ok(());
        }
        self.store.put_item(self.collection(collection), item).await
    }

    pub async fn remove_item(&self, id: &str, collection: Option<&str>) -> Result<()> {
        self.store.remove(self.collection(collection), id).await
    }

    /// Load this job's opaque progress checkpoint.
    pub async fn get_progress<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.store
            .get(META, &format!("progress:{}", self.job_id))
            .await
    }

    /// Persist this job's progress checkpoint. Jobs call this after every
    /// bounded unit of work so a crash or reload resumes rather than
    /// restarts.
    pub async fn set_progress<T: Serialize>(&self, progress: &T) -> Result<()> {
        self.store
            .put(META, &format!("progress:{}", self.job_id), progress)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::Map;
    use tempfile::TempDir;

    fn item(id: &str) -> IndexItem {
        IndexItem {
            id: id.to_string(),
            text: format!("item {}", id),
            category: "alpha".to_string(),
            content: String::new(),
            date_added: 0,
            metadata: Map::new(),
            action_id: "open".to_string(),
            render_component_id: "row".to_string(),
        }
    }

    async fn context() -> (TempDir, JobContext) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(Store::open(&tmp.path().join("t.sqlite")).await.unwrap());
        (tmp, JobContext::new(store, "alpha"))
    }

    #[tokio::test]
    async fn context_defaults_to_own_collection() {
        let (_tmp, ctx) = context().await;
        ctx.add_item(&item("a"), None).await.unwrap();
        ctx.add_item(&item("b"), Some("beta")).await.unwrap();

        assert_eq!(ctx.get_stored_items(None).await.unwrap().len(), 1);
        assert_eq!(ctx.get_stored_items(Some("beta")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn set_stored_items_replaces() {
        let (_tmp, ctx) = context().await;
        ctx.add_item(&item("a"), None).await.unwrap();
        ctx.set_stored_items(vec![item("b"), item("c")], None)
            .await
            .unwrap();

        let ids: Vec<String> = ctx
            .get_stored_items(None)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"b".to_string()) && ids.contains(&"c".to_string()));
    }

    #[tokio::test]
    async fn progress_roundtrip_is_job_scoped() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Cursor {
            offset: usize,
        }

        let (_tmp, ctx) = context().await;
        assert!(ctx.get_progress::<Cursor>().await.unwrap().is_none());

        ctx.set_progress(&Cursor { offset: 40 }).await.unwrap();
        assert_eq!(
            ctx.get_progress::<Cursor>().await.unwrap(),
            Some(Cursor { offset: 40 })
        );
    }
}
