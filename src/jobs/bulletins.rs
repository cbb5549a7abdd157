//! Bulletin job.
//!
//! Indexes short-lived announcements on a 15-minute expiry. Bulletins that
//! merely point at feed entries already indexed by the feed job are skipped,
//! so the same content never appears under two ids.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;

use crate::jobs::{Job, JobContext};
use crate::models::{Frequency, IndexItem};
use crate::sources::BulletinSource;

/// Collection checked for cross-posted entries.
const FEED_COLLECTION: &str = "feed";

#[derive(Debug, Default, Serialize, Deserialize)]
struct BulletinsProgress {
    /// Newest bulletin timestamp seen so far, epoch ms.
    last_ts: i64,
}

pub struct BulletinsJob {
    source: Arc<dyn BulletinSource>,
}

impl BulletinsJob {
    pub fn new(source: Arc<dyn BulletinSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Job for BulletinsJob {
    fn id(&self) -> &str {
        "bulletins"
    }

    fn label(&self) -> &str {
        "Bulletins"
    }

    fn frequency(&self) -> Frequency {
        Frequency::Expiry {
            after_ms: 15 * 60 * 1000,
        }
    }

    fn render_component_id(&self) -> &str {
        "bulletin"
    }

    async fn run(&self, ctx: &JobContext) -> Result<Vec<IndexItem>> {
        let mut progress: BulletinsProgress = ctx.get_progress().await?.unwrap_or_default();

        let bulletins = self.source.bulletins().await?;

        let mut indexed: HashSet<String> = ctx
            .get_stored_items(None)
            .await?
            .into_iter()
            .map(|i| i.id)
            .collect();
        indexed.extend(
            ctx.get_stored_items(Some(FEED_COLLECTION))
                .await?
                .into_iter()
                .map(|i| i.id),
        );

        let mut items = Vec::new();
        for bulletin in bulletins {
            if indexed.contains(&bulletin.id) {
                continue;
            }

            let mut metadata = Map::new();
            metadata.insert("timestamp".into(), Value::from(bulletin.timestamp));
            if let Some(author) = &bulletin.author {
                metadata.insert("author".into(), Value::String(author.clone()));
            }

            let content = match &bulletin.author {
                Some(author) => format!("{}\nFrom: {}", bulletin.body, author),
                None => bulletin.body.clone(),
            };

            items.push(IndexItem {
                id: bulletin.id.clone(),
                text: bulletin.title.clone(),
                category: self.id().to_string(),
                content,
                date_added: bulletin.timestamp,
                metadata,
                action_id: "bulletin".to_string(),
                render_component_id: self.render_component_id().to_string(),
            });
        }

        if let Some(latest) = items.iter().map(|i| i.date_added).max() {
            progress.last_ts = progress.last_ts.max(latest);
            ctx.set_progress(&progress).await?;
        }

        Ok(items)
    }

    /// Keep bulletins from the current calendar year.
    fn purge(&self, items: Vec<IndexItem>) -> Vec<IndexItem> {
        let cutoff = year_start_ms();
        items.into_iter().filter(|i| i.date_added >= cutoff).collect()
    }
}

fn year_start_ms() -> i64 {
    use chrono::{Datelike, TimeZone, Utc};
    let now = Utc::now();
    Utc.with_ymd_and_hms(now.year(), 1, 1, 0, 0, 0)
        .single()
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::Bulletin;
    use crate::store::Store;
    use tempfile::TempDir;

    struct MockBulletins(Vec<Bulletin>);

    #[async_trait]
    impl BulletinSource for MockBulletins {
        async fn bulletins(&self) -> Result<Vec<Bulletin>> {
            Ok(self.0.clone())
        }
    }

    fn bulletin(id: &str, ts: i64) -> Bulletin {
        Bulletin {
            id: id.to_string(),
            title: format!("bulletin {}", id),
            body: "details".to_string(),
            timestamp: ts,
            author: Some("office".to_string()),
        }
    }

    async fn job_ctx() -> (TempDir, JobContext) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(Store::open(&tmp.path().join("t.sqlite")).await.unwrap());
        (tmp, JobContext::new(store, "bulletins"))
    }

    #[tokio::test]
    async fn indexes_new_bulletins_and_tracks_latest() {
        let now = chrono::Utc::now().timestamp_millis();
        let job = BulletinsJob::new(Arc::new(MockBulletins(vec![
            bulletin("b1", now - 1000),
            bulletin("b2", now),
        ])));
        let (_tmp, ctx) = job_ctx().await;

        let items = job.run(&ctx).await.unwrap();
        assert_eq!(items.len(), 2);

        let progress: BulletinsProgress = ctx.get_progress().await.unwrap().unwrap();
        assert_eq!(progress.last_ts, now);
    }

    #[tokio::test]
    async fn skips_ids_already_in_feed_collection() {
        let now = chrono::Utc::now().timestamp_millis();
        let (_tmp, ctx) = job_ctx().await;

        // A feed item with the same id as an incoming bulletin.
        let feed_item = IndexItem {
            id: "cross".to_string(),
            text: "already here".to_string(),
            category: "feed".to_string(),
            content: String::new(),
            date_added: now,
            metadata: Map::new(),
            action_id: "feed-entry".to_string(),
            render_component_id: "feed-entry".to_string(),
        };
        ctx.add_item(&feed_item, Some(FEED_COLLECTION)).await.unwrap();

        let job = BulletinsJob::new(Arc::new(MockBulletins(vec![
            bulletin("cross", now),
            bulletin("solo", now),
        ])));

        let items = job.run(&ctx).await.unwrap();
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["solo"]);
    }

    #[test]
    fn purge_keeps_current_year_only() {
        let job = BulletinsJob::new(Arc::new(MockBulletins(vec![])));
        let this_year = chrono::Utc::now().timestamp_millis();
        let last_year = year_start_ms() - 1;

        let mut recent = item_with_date("recent", this_year);
        let mut stale = item_with_date("stale", last_year);
        recent.category = "bulletins".to_string();
        stale.category = "bulletins".to_string();

        let kept = job.purge(vec![recent, stale]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "recent");
    }

    fn item_with_date(id: &str, date_added: i64) -> IndexItem {
        IndexItem {
            id: id.to_string(),
            text: id.to_string(),
            category: String::new(),
            content: String::new(),
            date_added,
            metadata: Map::new(),
            action_id: "bulletin".to_string(),
            render_component_id: "bulletin".to_string(),
        }
    }
}
