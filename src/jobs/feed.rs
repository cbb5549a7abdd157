//! Paginated feed job.
//!
//! Scans a message-style feed newest-first through the adaptive fetch
//! controller, fetching each entry's body individually. Progress (page
//! offset, learned rate state, retry queue) is checkpointed after every page
//! so an interrupted scan resumes where it stopped. The scan ends early when
//! it sees enough consecutive already-indexed entries to conclude it has
//! caught up, or when entries fall out of the retention window.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::FetcherConfig;
use crate::fetcher::{AdaptiveFetcher, FetcherState};
use crate::jobs::{Job, JobContext};
use crate::models::{Frequency, IndexItem};
use crate::sources::{FeedEntry, FeedSource};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;
/// Consecutive already-indexed entries that mean the scan has caught up.
const STOP_AFTER_KNOWN: usize = 20;

#[derive(Debug, Default, Serialize, Deserialize)]
struct FeedProgress {
    offset: usize,
    done: bool,
    fetcher: Option<FetcherState>,
}

pub struct FeedJob {
    source: Arc<dyn FeedSource>,
    fetcher_config: FetcherConfig,
    retention_ms: i64,
}

impl FeedJob {
    pub fn new(source: Arc<dyn FeedSource>, fetcher_config: FetcherConfig) -> Self {
        Self {
            source,
            fetcher_config,
            // Keep four years of history by default.
            retention_ms: 4 * 365 * DAY_MS,
        }
    }

    pub fn with_retention_ms(mut self, retention_ms: i64) -> Self {
        self.retention_ms = retention_ms;
        self
    }

    fn entry_to_item(&self, entry: &FeedEntry, body: String) -> IndexItem {
        let mut metadata = Map::new();
        metadata.insert("author".into(), Value::String(entry.author.clone()));
        metadata.insert("timestamp".into(), Value::from(entry.date));
        metadata.insert("has_attachments".into(), Value::Bool(entry.has_attachments));
        metadata.insert("read".into(), Value::Bool(entry.read));

        IndexItem {
            id: entry.id.clone(),
            text: entry.subject.clone(),
            category: self.id().to_string(),
            content: format!("{}\nFrom: {}", body, entry.author),
            date_added: entry.date,
            metadata,
            action_id: "feed-entry".to_string(),
            render_component_id: self.render_component_id().to_string(),
        }
    }

    /// Fetch one entry's body; on success store the item, on exhausted
    /// retries requeue it for the next run.
    async fn fetch_entry(
        &self,
        ctx: &JobContext,
        fetcher: &mut AdaptiveFetcher,
        entry: &FeedEntry,
        existing: &mut HashSet<String>,
        out: &mut Vec<IndexItem>,
    ) -> Result<()> {
        let source = self.source.clone();
        let id = entry.id.clone();
        match fetcher.execute(move || {
            let source = source.clone();
            let id = id.clone();
            async move { source.content(&id).await }
        })
        .await
        {
            Some(body) => {
                let item = self.entry_to_item(entry, body);
                ctx.add_item(&item, None).await?;
                existing.insert(item.id.clone());
                out.push(item);
            }
            None => {
                warn!(id = %entry.id, "entry body fetch abandoned; requeued");
                fetcher.queue_retry(serde_json::to_string(entry)?);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Job for FeedJob {
    fn id(&self) -> &str {
        "feed"
    }

    fn label(&self) -> &str {
        "Feed"
    }

    fn frequency(&self) -> Frequency {
        Frequency::Expiry { after_ms: DAY_MS }
    }

    fn render_component_id(&self) -> &str {
        "feed-entry"
    }

    async fn run(&self, ctx: &JobContext) -> Result<Vec<IndexItem>> {
        let mut progress: FeedProgress = ctx.get_progress().await?.unwrap_or_default();
        let mut fetcher = match progress.fetcher.take() {
            Some(state) => AdaptiveFetcher::restore(self.fetcher_config.clone(), state),
            None => AdaptiveFetcher::new(self.fetcher_config.clone()),
        };

        let mut existing: HashSet<String> = ctx
            .get_stored_items(None)
            .await?
            .into_iter()
            .map(|i| i.id)
            .collect();

        let cutoff = chrono::Utc::now().timestamp_millis() - self.retention_ms;
        let mut new_items: Vec<IndexItem> = Vec::new();

        // Requeued entries from the previous run get priority over new work.
        for token in fetcher.take_retries() {
            let entry: FeedEntry = match serde_json::from_str(&token) {
                Ok(e) => e,
                Err(_) => continue,
            };
            if existing.contains(&entry.id) {
                continue;
            }
            self.fetch_entry(ctx, &mut fetcher, &entry, &mut existing, &mut new_items)
                .await?;
        }

        let mut consecutive_known = 0usize;
        let mut pages_fetched = 0usize;

        while !progress.done && !fetcher.is_finished() {
            fetcher.wait().await;
            let offset = progress.offset;
            let limit = fetcher.batch_size();

            let source = self.source.clone();
            let page = match fetcher
                .execute(move || {
                    let source = source.clone();
                    async move { source.list(offset, limit).await }
                })
                .await
            {
                Some(page) => page,
                None => {
                    // A list failure only fails the job when the run made no
                    // forward progress at all; otherwise resume next time.
                    if pages_fetched == 0 && new_items.is_empty() {
                        anyhow::bail!("feed list fetch failed before any progress");
                    }
                    break;
                }
            };
            pages_fetched += 1;

            for entry in &page.entries {
                if existing.contains(&entry.id) {
                    consecutive_known += 1;
                    if consecutive_known >= STOP_AFTER_KNOWN {
                        debug!("caught up after {} known entries", consecutive_known);
                        progress.done = true;
                        break;
                    }
                    continue;
                }
                consecutive_known = 0;

                if entry.date < cutoff {
                    // The feed is newest-first, so everything past this point
                    // is outside the retention window.
                    debug!(id = %entry.id, "entry older than retention window; stopping scan");
                    progress.done = true;
                    fetcher.finish();
                    break;
                }

                self.fetch_entry(ctx, &mut fetcher, entry, &mut existing, &mut new_items)
                    .await?;
            }

            if !page.has_more {
                progress.done = true;
            }
            progress.offset += limit;
            progress.fetcher = Some(fetcher.state());
            ctx.set_progress(&progress).await?;
        }

        if progress.done {
            // Reset the cursor for the next full pass; keep the learned rate
            // state and any requeued entries.
            let reset = FeedProgress {
                offset: 0,
                done: false,
                fetcher: Some(fetcher.state()),
            };
            ctx.set_progress(&reset).await?;
        }

        Ok(new_items)
    }

    /// Keep only entries inside the retention window.
    fn purge(&self, items: Vec<IndexItem>) -> Vec<IndexItem> {
        let cutoff = chrono::Utc::now().timestamp_millis() - self.retention_ms;
        items.into_iter().filter(|i| i.date_added >= cutoff).collect()
    }
}
