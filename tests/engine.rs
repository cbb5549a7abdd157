//! End-to-end pipeline scenarios: orchestrator → store → vector worker →
//! hybrid search, with mock sources and the deterministic hash embedder.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Map;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use trawler::commands::StaticCommand;
use trawler::config::Config;
use trawler::jobs::catalog::CatalogJob;
use trawler::jobs::{Job, JobContext};
use trawler::models::{Frequency, IndexItem, RankedPayload, ResultKind};
use trawler::progress::MemoryProgress;
use trawler::service::SearchService;
use trawler::sources::{CatalogEntry, CatalogSource};
use trawler::store::{META, VECTORS};

fn test_config(tmp: &TempDir) -> Config {
    Config::with_db_path(tmp.path().join("trawler.sqlite"))
}

struct MockCatalog(Vec<CatalogEntry>);

#[async_trait]
impl CatalogSource for MockCatalog {
    async fn entries(&self) -> Result<Vec<CatalogEntry>> {
        Ok(self.0.clone())
    }
}

fn three_subjects() -> MockCatalog {
    MockCatalog(vec![
        CatalogEntry {
            id: "phy101".into(),
            code: "PHY101".into(),
            title: "Physics".into(),
            description: "gravity momentum mechanics".into(),
        },
        CatalogEntry {
            id: "eng201".into(),
            code: "ENG201".into(),
            title: "English Literature".into(),
            description: "poetry novels essays".into(),
        },
        CatalogEntry {
            id: "art110".into(),
            code: "ART110".into(),
            title: "Visual Arts".into(),
            description: "painting sculpture design".into(),
        },
    ])
}

/// A job that returns whatever items are loaded into it.
struct ScriptedJob {
    id: &'static str,
    items: Mutex<Vec<IndexItem>>,
    retain_after: Option<i64>,
    empty_query_boost: Option<f64>,
}

impl ScriptedJob {
    fn new(id: &'static str, items: Vec<IndexItem>) -> Self {
        Self {
            id,
            items: Mutex::new(items),
            retain_after: None,
            empty_query_boost: None,
        }
    }

    fn set_items(&self, items: Vec<IndexItem>) {
        *self.items.lock().unwrap() = items;
    }
}

#[async_trait]
impl Job for ScriptedJob {
    fn id(&self) -> &str {
        self.id
    }
    fn label(&self) -> &str {
        self.id
    }
    fn frequency(&self) -> Frequency {
        Frequency::Always
    }
    fn render_component_id(&self) -> &str {
        "row"
    }

    async fn run(&self, _ctx: &JobContext) -> Result<Vec<IndexItem>> {
        Ok(self.items.lock().unwrap().clone())
    }

    fn purge(&self, items: Vec<IndexItem>) -> Vec<IndexItem> {
        match self.retain_after {
            Some(cutoff) => items
                .into_iter()
                .filter(|i| i.date_added >= cutoff)
                .collect(),
            None => items,
        }
    }

    fn boost(&self, _item: &IndexItem, query: &str) -> Option<f64> {
        if query.is_empty() {
            self.empty_query_boost
        } else {
            None
        }
    }
}

fn item(id: &str, category: &str, text: &str, content: &str, date_added: i64) -> IndexItem {
    IndexItem {
        id: id.to_string(),
        text: text.to_string(),
        category: category.to_string(),
        content: content.to_string(),
        date_added,
        metadata: Map::new(),
        action_id: "open".to_string(),
        render_component_id: "row".to_string(),
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[tokio::test]
async fn cold_start_indexes_stores_and_embeds() {
    let tmp = TempDir::new().unwrap();
    let mut service = SearchService::open(test_config(&tmp)).await.unwrap();
    service.register_job(Arc::new(CatalogJob::new(Arc::new(three_subjects()))));

    let reporter = Arc::new(MemoryProgress::new());
    service.run_indexing(reporter.clone()).await.unwrap();

    assert_eq!(service.store().count("catalog").await.unwrap(), 3);
    assert_eq!(service.store().count(VECTORS).await.unwrap(), 3);

    let events = reporter.events();
    assert!(!events.is_empty());
    let last = events.last().unwrap();
    assert_eq!(last.completed, last.total);
    assert!(!last.indexing);

    service.shutdown().await;
}

#[tokio::test]
async fn second_run_embeds_nothing_new() {
    let tmp = TempDir::new().unwrap();
    let mut service = SearchService::open(test_config(&tmp)).await.unwrap();
    service.register_job(Arc::new(CatalogJob::new(Arc::new(three_subjects()))));

    service
        .run_indexing(Arc::new(MemoryProgress::new()))
        .await
        .unwrap();
    assert_eq!(service.store().count(VECTORS).await.unwrap(), 3);

    // The catalog job is always due; its ids are already embedded, so the
    // second run leaves the vector index untouched.
    let reporter = Arc::new(MemoryProgress::new());
    service.run_indexing(reporter.clone()).await.unwrap();
    assert_eq!(service.store().count(VECTORS).await.unwrap(), 3);

    let last = reporter.events().last().cloned().unwrap();
    assert_eq!(last.completed, last.total);
    assert!(!last.indexing);

    service.shutdown().await;
}

#[tokio::test]
async fn incremental_update_overwrites_by_id() {
    let tmp = TempDir::new().unwrap();
    let mut service = SearchService::open(test_config(&tmp)).await.unwrap();

    let job = Arc::new(ScriptedJob::new(
        "notes",
        vec![item("a", "notes", "note a", "v1", now_ms())],
    ));
    service.register_job(job.clone());

    service
        .run_indexing(Arc::new(MemoryProgress::new()))
        .await
        .unwrap();
    assert_eq!(service.store().count("notes").await.unwrap(), 1);

    job.set_items(vec![
        item("a", "notes", "note a", "v2", now_ms()),
        item("b", "notes", "note b", "fresh", now_ms()),
    ]);
    service
        .run_indexing(Arc::new(MemoryProgress::new()))
        .await
        .unwrap();

    assert_eq!(service.store().count("notes").await.unwrap(), 2);
    let a: IndexItem = service
        .store()
        .get("notes", "a")
        .await
        .unwrap()
        .expect("item a still stored");
    assert_eq!(a.content, "v2");

    service.shutdown().await;
}

#[tokio::test]
async fn purge_evicts_outside_retention_window() {
    let tmp = TempDir::new().unwrap();
    let mut service = SearchService::open(test_config(&tmp)).await.unwrap();

    let cutoff = now_ms() - 1000;
    let mut job = ScriptedJob::new(
        "notes",
        vec![
            item("old", "notes", "old note", "stale", cutoff - 5000),
            item("new", "notes", "new note", "fresh", now_ms()),
        ],
    );
    job.retain_after = Some(cutoff);
    service.register_job(Arc::new(job));

    service
        .run_indexing(Arc::new(MemoryProgress::new()))
        .await
        .unwrap();

    let stored = service.store().get_all_items("notes").await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, "new");

    service.shutdown().await;
}

#[tokio::test]
async fn lock_holder_excludes_second_instance() {
    let tmp = TempDir::new().unwrap();

    let mut first = SearchService::open(test_config(&tmp)).await.unwrap();
    first.register_job(Arc::new(CatalogJob::new(Arc::new(three_subjects()))));

    // Simulate a live heartbeat from another instance.
    first
        .store()
        .put(META, "indexer-lock", &now_ms())
        .await
        .unwrap();

    let reporter = Arc::new(MemoryProgress::new());
    first.run_indexing(reporter.clone()).await.unwrap();

    // The excluded instance emits no progress events and writes nothing.
    assert!(reporter.events().is_empty());
    assert_eq!(first.store().count("catalog").await.unwrap(), 0);

    // Once the lease expires the same instance proceeds normally.
    first
        .store()
        .put(META, "indexer-lock", &(now_ms() - 60_000))
        .await
        .unwrap();
    first.run_indexing(reporter.clone()).await.unwrap();
    assert_eq!(first.store().count("catalog").await.unwrap(), 3);

    first.shutdown().await;
}

#[tokio::test]
async fn large_job_streams_through_a_session() {
    let tmp = TempDir::new().unwrap();
    let mut service = SearchService::open(test_config(&tmp)).await.unwrap();

    // Above the stream threshold (25), so the orchestrator opens a
    // streaming session instead of a one-shot request.
    let items: Vec<IndexItem> = (0..30)
        .map(|i| {
            item(
                &format!("n{}", i),
                "notes",
                &format!("note {}", i),
                &format!("content number {}", i),
                now_ms(),
            )
        })
        .collect();
    service.register_job(Arc::new(ScriptedJob::new("notes", items)));

    let reporter = Arc::new(MemoryProgress::new());
    service.run_indexing(reporter.clone()).await.unwrap();

    assert_eq!(service.store().count("notes").await.unwrap(), 30);
    assert_eq!(service.store().count(VECTORS).await.unwrap(), 30);

    let last = reporter.events().last().cloned().unwrap();
    assert!(!last.indexing);

    service.shutdown().await;
}

#[tokio::test]
async fn hybrid_search_finds_indexed_content_and_commands() {
    let tmp = TempDir::new().unwrap();
    let mut service = SearchService::open(test_config(&tmp)).await.unwrap();
    service.register_job(Arc::new(CatalogJob::new(Arc::new(three_subjects()))));
    service.register_command(StaticCommand {
        id: "open-timetable".into(),
        text: "Timetable".into(),
        category: "navigation".into(),
        icon: None,
        keywords: vec!["schedule".into()],
        priority: 4,
        action_id: "nav:timetable".into(),
    });

    service
        .run_indexing(Arc::new(MemoryProgress::new()))
        .await
        .unwrap();

    // Dynamic content by body text.
    let results = service.perform_search("gravity", 10, false).await.unwrap();
    assert!(!results.is_empty());
    let top = &results[0];
    assert_eq!(top.kind, ResultKind::Dynamic);
    match &top.item {
        RankedPayload::Dynamic(item) => assert_eq!(item.id, "phy101"),
        RankedPayload::Command(_) => panic!("expected a dynamic result"),
    }

    // Command by keyword, slightly misspelled.
    let results = service.perform_search("schedul", 10, false).await.unwrap();
    assert!(results
        .iter()
        .any(|r| r.kind == ResultKind::Command && r.id == "open-timetable"));

    service.shutdown().await;
}

#[tokio::test]
async fn lexical_only_when_embeddings_disabled() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    config.embedding.provider = "disabled".to_string();

    let mut service = SearchService::open(config).await.unwrap();
    service.register_job(Arc::new(CatalogJob::new(Arc::new(three_subjects()))));
    service
        .run_indexing(Arc::new(MemoryProgress::new()))
        .await
        .unwrap();

    // Vectorization could not run, but lexical indexing did, and search
    // degrades to lexical-only instead of failing.
    let results = service.perform_search("painting", 10, false).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, "art110");

    service.shutdown().await;
}

#[tokio::test]
async fn empty_query_browses_with_bottom_forced_jobs() {
    let tmp = TempDir::new().unwrap();
    let mut service = SearchService::open(test_config(&tmp)).await.unwrap();

    let mut sink = ScriptedJob::new(
        "chores",
        vec![item("chore", "chores", "do the dishes", "", now_ms())],
    );
    sink.empty_query_boost = Some(-100.0);
    service.register_job(Arc::new(sink));
    service.register_job(Arc::new(ScriptedJob::new(
        "notes",
        vec![item("note", "notes", "a fresh note", "", now_ms())],
    )));
    service.register_command(StaticCommand {
        id: "home".into(),
        text: "Home".into(),
        category: "navigation".into(),
        icon: None,
        keywords: vec![],
        priority: 4,
        action_id: "nav:home".into(),
    });

    service
        .run_indexing(Arc::new(MemoryProgress::new()))
        .await
        .unwrap();

    let results = service.perform_search("", 10, false).await.unwrap();
    assert_eq!(results.len(), 3);
    // Commands by priority, then dynamics by recency, with the
    // bottom-forced job last.
    assert_eq!(results[0].id, "home");
    assert_eq!(results[1].id, "note");
    assert_eq!(results.last().unwrap().id, "chore");

    service.shutdown().await;
}
