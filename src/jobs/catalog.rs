//! Catalog job.
//!
//! Indexes the host's content catalog on every activation. The catalog is
//! small and cheap to list, so there is no pagination, no checkpoint, and no
//! purge — the merged set simply tracks whatever the host reports.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::jobs::{Job, JobContext};
use crate::models::{Frequency, IndexItem};
use crate::sources::CatalogSource;

pub struct CatalogJob {
    source: Arc<dyn CatalogSource>,
}

impl CatalogJob {
    pub fn new(source: Arc<dyn CatalogSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Job for CatalogJob {
    fn id(&self) -> &str {
        "catalog"
    }

    fn label(&self) -> &str {
        "Catalog"
    }

    fn frequency(&self) -> Frequency {
        Frequency::Always
    }

    fn render_component_id(&self) -> &str {
        "catalog-entry"
    }

    async fn run(&self, _ctx: &JobContext) -> Result<Vec<IndexItem>> {
        let now = chrono::Utc::now().timestamp_millis();
        let items = self
            .source
            .entries()
            .await?
            .into_iter()
            .map(|entry| {
                let mut metadata = Map::new();
                metadata.insert("code".into(), Value::String(entry.code.clone()));

                IndexItem {
                    id: entry.id,
                    text: entry.title,
                    category: self.id().to_string(),
                    content: format!("{}\n{}", entry.code, entry.description),
                    date_added: now,
                    metadata,
                    action_id: "catalog-entry".to_string(),
                    render_component_id: self.render_component_id().to_string(),
                }
            })
            .collect();
        Ok(items)
    }
}
