//! Worklist job.
//!
//! Indexes upcoming and historical work items on a daily expiry. Upcoming
//! and past lists are fetched together and merged by id, with the upcoming
//! flag winning so an item transitioning between lists keeps its boost.
//! The boost routine rewards items due soon, penalizes overdue ones, and on
//! an empty query forces worklist items to the bottom of browse results.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::jobs::{Job, JobContext};
use crate::models::{Frequency, IndexItem};
use crate::sources::{TaskRecord, TaskSource};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

pub struct WorklistJob {
    source: Arc<dyn TaskSource>,
}

impl WorklistJob {
    pub fn new(source: Arc<dyn TaskSource>) -> Self {
        Self { source }
    }

    fn record_to_item(&self, record: &TaskRecord, upcoming: bool, now: i64) -> IndexItem {
        let mut metadata = Map::new();
        metadata.insert("task_id".into(), Value::String(record.id.clone()));
        metadata.insert("subject".into(), Value::String(record.subject.clone()));
        metadata.insert("submitted".into(), Value::Bool(record.submitted));
        metadata.insert("upcoming".into(), Value::Bool(upcoming));
        if let Some(due) = record.due {
            metadata.insert("due_date".into(), Value::from(due));
        }

        let due_display = record
            .due
            .and_then(|ms| chrono::DateTime::from_timestamp_millis(ms))
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "no due date".to_string());

        IndexItem {
            id: format!("task-{}", record.id),
            text: record.title.clone(),
            category: self.id().to_string(),
            content: format!(
                "{}\nSubject: {}\nDue: {}",
                record.description, record.subject, due_display
            ),
            date_added: record.due.unwrap_or(now),
            metadata,
            action_id: "task".to_string(),
            render_component_id: self.render_component_id().to_string(),
        }
    }
}

#[async_trait]
impl Job for WorklistJob {
    fn id(&self) -> &str {
        "worklist"
    }

    fn label(&self) -> &str {
        "Worklist"
    }

    fn frequency(&self) -> Frequency {
        Frequency::Expiry { after_ms: DAY_MS }
    }

    fn render_component_id(&self) -> &str {
        "task"
    }

    async fn run(&self, _ctx: &JobContext) -> Result<Vec<IndexItem>> {
        let (upcoming, past) = tokio::try_join!(self.source.upcoming(), self.source.past())?;

        // Merge by id; the upcoming flag wins for items present in both.
        let mut merged: HashMap<String, (TaskRecord, bool)> = HashMap::new();
        for record in upcoming {
            merged.insert(record.id.clone(), (record, true));
        }
        for record in past {
            merged
                .entry(record.id.clone())
                .or_insert_with(|| (record, false));
        }

        let now = chrono::Utc::now().timestamp_millis();
        let items: Vec<IndexItem> = merged
            .values()
            .map(|(record, upcoming)| self.record_to_item(record, *upcoming, now))
            .collect();

        // Re-running is cheap and keeps metadata fresh, so everything is
        // returned rather than diffed against the stored set.
        Ok(items)
    }

    /// Keep every task that still carries its host reference; searching old
    /// work is a feature, so age alone never evicts.
    fn purge(&self, items: Vec<IndexItem>) -> Vec<IndexItem> {
        items
            .into_iter()
            .filter(|i| {
                i.metadata.get("task_id").is_some() && i.metadata.get("subject").is_some()
            })
            .collect()
    }

    fn boost(&self, item: &IndexItem, query: &str) -> Option<f64> {
        if query.is_empty() {
            // Browsing with an empty query: tasks go to the bottom.
            return Some(-100.0);
        }

        let mut score = 0.0;
        if let Some(due) = item.metadata.get("due_date").and_then(|v| v.as_i64()) {
            let days_until = (due - chrono::Utc::now().timestamp_millis()) as f64 / DAY_MS as f64;
            if (0.0..=7.0).contains(&days_until) {
                score += 5.0;
            }
            if days_until < 0.0 {
                score -= 10.0;
            }
        }
        if item
            .metadata
            .get("submitted")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            score += 2.0;
        }
        Some(score)
    }
}
