//! Indexing orchestrator.
//!
//! One run walks the registered jobs in order: check freshness, execute,
//! merge into the store, purge, persist the last-run time, then hand the
//! run's new items to the vector worker. A heartbeat lock in the shared
//! store keeps concurrently open instances from running at once; the lock
//! is a lease, so a crashed instance's claim expires on its own.
//!
//! Failure isolation: a job that fails is logged and skipped — it never
//! aborts the run or the other jobs. The only external signal is the
//! stream of [`ProgressEvent`]s sent to the reporter.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::jobs::{Job, JobContext};
use crate::models::{IndexItem, ProgressEvent};
use crate::progress::ProgressReporter;
use crate::service::SearchService;
use crate::store::{Store, META};
use crate::worker::ProcessStatus;
use crate::worker_manager::{ProcessProgress, ProgressCallback, WorkerManager};

const LOCK_KEY: &str = "indexer-lock";

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn lastrun_key(job_id: &str) -> String {
    format!("lastrun:{}", job_id)
}

/// Run one indexing pass. Skips entirely (emitting no events) when another
/// instance holds a fresh heartbeat.
pub async fn run_indexing(
    service: &SearchService,
    reporter: Arc<dyn ProgressReporter>,
) -> Result<()> {
    let store = service.store();
    let lock_timeout = service.config().indexer.lock_timeout_ms;

    if let Some(heartbeat) = store.get::<i64>(META, LOCK_KEY).await? {
        if now_ms() - heartbeat < lock_timeout {
            debug!("skipping indexing run; another instance holds the lock");
            return Ok(());
        }
    }

    store.put(META, LOCK_KEY, &now_ms()).await?;
    let heartbeat_task = spawn_heartbeat(
        store.clone(),
        service.config().indexer.heartbeat_ms,
    );

    let result = run_jobs(service, reporter).await;

    heartbeat_task.abort();
    if let Err(e) = store.remove(META, LOCK_KEY).await {
        warn!(error = %e, "failed to clear indexer lock");
    }
    result
}

fn spawn_heartbeat(store: Arc<Store>, interval_ms: i64) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let period = std::time::Duration::from_millis(interval_ms.max(1) as u64);
        let mut tick = tokio::time::interval(period);
        // The first tick fires immediately; the lock was just written.
        tick.tick().await;
        loop {
            tick.tick().await;
            if let Err(e) = store.put(META, LOCK_KEY, &now_ms()).await {
                warn!(error = %e, "heartbeat refresh failed");
            }
        }
    })
}

async fn run_jobs(service: &SearchService, reporter: Arc<dyn ProgressReporter>) -> Result<()> {
    let store = service.store();
    let jobs = service.jobs();
    let stream_threshold = service.config().indexer.stream_threshold;

    // One extra step for the vectorization hand-off.
    let total = jobs.len() + 1;
    let mut completed = 0usize;
    reporter.report(&ProgressEvent::new(completed, total, true, "Starting jobs"));

    let mut pending_vectorize: Vec<IndexItem> = Vec::new();

    for job in jobs.jobs() {
        reporter.report(&ProgressEvent::new(
            completed,
            total,
            true,
            format!("Running job: {}", job.label()),
        ));

        // A store hiccup here must not abort the run; an unreadable
        // last-run time just means the job is due.
        let last_run: Option<i64> = store
            .get(META, &lastrun_key(job.id()))
            .await
            .unwrap_or_else(|e| {
                warn!(job = job.id(), error = %e, "failed to read last-run time");
                None
            });
        if !job.frequency().is_due(last_run, now_ms()) {
            debug!(job = job.id(), "not due; skipping");
            completed += 1;
            reporter.report(&ProgressEvent::new(
                completed,
                total,
                true,
                format!("Skipped job: {}", job.label()),
            ));
            continue;
        }

        let ctx = JobContext::new(store.clone(), job.id());
        match job.run(&ctx).await {
            Ok(new_items) => {
                match merge_into_store(&ctx, job.as_ref(), &new_items).await {
                    Ok(stored) => {
                        if let Err(e) =
                            store.put(META, &lastrun_key(job.id()), &now_ms()).await
                        {
                            warn!(job = job.id(), error = %e, "failed to persist last-run time");
                        }
                        info!(
                            job = job.id(),
                            new = new_items.len(),
                            stored,
                            "job finished"
                        );

                        // Large hand-offs stream; small ones pool into one
                        // one-shot request at the end of the run.
                        if new_items.len() >= stream_threshold {
                            if let Err(e) = stream_job_items(
                                service.vectors(),
                                job.id(),
                                new_items,
                                reporter.clone(),
                                completed,
                                total,
                            )
                            .await
                            {
                                warn!(job = job.id(), error = %e, "streaming hand-off failed");
                            }
                        } else {
                            pending_vectorize.extend(new_items);
                        }
                    }
                    Err(e) => {
                        // Previous data for the collection is retained.
                        warn!(job = job.id(), error = %e, "merge failed; keeping previous data");
                    }
                }
            }
            Err(e) => {
                warn!(job = job.id(), error = %e, "job failed");
            }
        }

        completed += 1;
        reporter.report(&ProgressEvent::new(
            completed,
            total,
            true,
            format!("Finished job: {}", job.label()),
        ));
    }

    // Vectorization step.
    if pending_vectorize.is_empty() {
        completed += 1;
        reporter.report(&ProgressEvent::new(
            completed,
            total,
            false,
            "Indexing finished (no vectorization needed)",
        ));
        return Ok(());
    }

    reporter.report(&ProgressEvent::new(
        completed,
        total,
        true,
        "Starting vectorization",
    ));

    match vectorize_oneshot(
        service.vectors(),
        pending_vectorize,
        reporter.clone(),
        completed,
        total,
    )
    .await
    {
        Ok(ProcessStatus::Complete) => {
            completed += 1;
            reporter.report(&ProgressEvent::new(
                completed,
                total,
                false,
                "Indexing finished",
            ));
        }
        Ok(status) => {
            reporter.report(
                &ProgressEvent::new(completed, total, false, "Indexing stopped")
                    .with_detail(format!("vectorization ended with {:?}", status)),
            );
        }
        Err(e) => {
            warn!(error = %e, "vectorization hand-off failed");
            reporter.report(
                &ProgressEvent::new(completed, total, false, "Vectorization failed")
                    .with_detail(e.to_string()),
            );
        }
    }

    Ok(())
}

/// Merge rule: existing ∪ incoming keyed by id, incoming winning ties,
/// preserving existing-then-incoming order.
pub fn merge_items(existing: Vec<IndexItem>, incoming: Vec<IndexItem>) -> Vec<IndexItem> {
    let mut order: Vec<String> = Vec::new();
    let mut by_id: HashMap<String, IndexItem> = HashMap::new();

    for item in existing.into_iter().chain(incoming) {
        if item.id.is_empty() {
            continue;
        }
        if !by_id.contains_key(&item.id) {
            order.push(item.id.clone());
        }
        by_id.insert(item.id.clone(), item);
    }

    order
        .into_iter()
        .filter_map(|id| by_id.remove(&id))
        .collect()
}

async fn merge_into_store(
    ctx: &JobContext,
    job: &dyn Job,
    new_items: &[IndexItem],
) -> Result<usize> {
    let stored = ctx.get_stored_items(None).await?;
    let mut merged = merge_items(stored, new_items.to_vec());
    merged = job.purge(merged);
    let count = merged.len();
    ctx.set_stored_items(merged, None).await?;
    Ok(count)
}

/// Build a callback that narrates worker progress to the reporter and
/// resolves a oneshot on any terminal status.
fn progress_bridge(
    reporter: Arc<dyn ProgressReporter>,
    completed: usize,
    total: usize,
) -> (
    ProgressCallback,
    tokio::sync::oneshot::Receiver<ProcessStatus>,
) {
    let (tx, rx) = tokio::sync::oneshot::channel();
    let slot = std::sync::Mutex::new(Some(tx));

    let callback: ProgressCallback = Arc::new(move |p: ProcessProgress| {
        let detail = match p.status {
            ProcessStatus::Started => format!(
                "Vectorization started for {} items",
                p.total.unwrap_or(0)
            ),
            ProcessStatus::Processing => format!(
                "Vectorizing: {} / {}",
                p.processed.unwrap_or(0),
                p.total.unwrap_or(0)
            ),
            ProcessStatus::Complete => "Vectorization complete".to_string(),
            ProcessStatus::Cancelled => format!(
                "Vectorization cancelled: {}",
                p.message.clone().unwrap_or_default()
            ),
            ProcessStatus::Error => format!(
                "Vectorization error: {}",
                p.message.clone().unwrap_or_default()
            ),
        };
        reporter.report(
            &ProgressEvent::new(completed, total, true, "Vectorization in progress")
                .with_detail(detail),
        );

        if matches!(
            p.status,
            ProcessStatus::Complete | ProcessStatus::Cancelled | ProcessStatus::Error
        ) {
            if let Some(tx) = slot.lock().unwrap().take() {
                let _ = tx.send(p.status);
            }
        }
    });

    (callback, rx)
}

async fn vectorize_oneshot(
    vectors: &Arc<WorkerManager>,
    items: Vec<IndexItem>,
    reporter: Arc<dyn ProgressReporter>,
    completed: usize,
    total: usize,
) -> Result<ProcessStatus> {
    let (callback, done) = progress_bridge(reporter, completed, total);
    vectors.process_items(items, Some(callback)).await?;
    done.await
        .map_err(|_| anyhow::anyhow!("vector worker dropped before completing"))
}

/// Stream one job's items through a session owned by that job.
async fn stream_job_items(
    vectors: &Arc<WorkerManager>,
    job_id: &str,
    items: Vec<IndexItem>,
    reporter: Arc<dyn ProgressReporter>,
    completed: usize,
    total: usize,
) -> Result<()> {
    let (callback, done) = progress_bridge(reporter, completed, total);
    vectors
        .start_streaming(job_id, items.len(), None, Some(callback))
        .await?;

    for chunk in items.chunks(64) {
        vectors.stream_items(chunk.to_vec()).await?;
    }

    // The session auto-finalizes once every expected item has arrived.
    let status = done
        .await
        .map_err(|_| anyhow::anyhow!("vector worker dropped before completing"))?;
    if status != ProcessStatus::Complete {
        anyhow::bail!("streaming session ended with {:?}", status);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn item(id: &str, content: &str) -> IndexItem {
        IndexItem {
            id: id.to_string(),
            text: format!("item {}", id),
            category: "feed".to_string(),
            content: content.to_string(),
            date_added: 0,
            metadata: Map::new(),
            action_id: "open".to_string(),
            render_component_id: "row".to_string(),
        }
    }

    #[test]
    fn merge_prefers_incoming_on_collision() {
        let merged = merge_items(
            vec![item("a", "v1"), item("b", "old")],
            vec![item("a", "v2"), item("c", "new")],
        );
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].id, "a");
        assert_eq!(merged[0].content, "v2");
        assert_eq!(merged[1].id, "b");
        assert_eq!(merged[2].id, "c");
    }

    #[test]
    fn merge_is_idempotent() {
        let incoming = vec![item("a", "x"), item("b", "y")];
        let once = merge_items(vec![], incoming.clone());
        let twice = merge_items(once.clone(), incoming);

        assert_eq!(once.len(), twice.len());
        for (a, b) in once.iter().zip(twice.iter()) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.content, b.content);
        }
    }

    #[test]
    fn merge_skips_empty_ids() {
        let merged = merge_items(vec![item("", "ghost")], vec![item("a", "x")]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, "a");
    }

    #[test]
    fn merge_preserves_existing_order() {
        let merged = merge_items(
            vec![item("x", "1"), item("y", "2")],
            vec![item("z", "3"), item("y", "2b")],
        );
        let ids: Vec<&str> = merged.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["x", "y", "z"]);
        assert_eq!(merged[1].content, "2b");
    }
}
