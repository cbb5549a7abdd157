//! Worker manager.
//!
//! The orchestrator-side proxy to the vector worker. Beyond forwarding
//! messages it owns the worker's lifecycle and the streaming session
//! bookkeeping:
//!
//! - **Lazy init** — the worker task is not spawned until the first unit of
//!   work arrives; a zero-item request never spins it up.
//! - **Idle teardown** — after a configured window with no activity and no
//!   open session, the worker is dropped; new work re-initializes it
//!   transparently.
//! - **Stream buffering** — callers stream items in whatever granularity is
//!   convenient; the manager flushes to the worker when the local buffer
//!   reaches the session batch size, when everything expected has arrived,
//!   or after a short debounce.
//! - **Inactivity auto-end** — a session with no new items for a bounded
//!   window is force-ended (flushed and finalized), never left dangling.
//! - **Correlation** — searches carry a request id; responses for
//!   superseded requests are dropped on the floor.

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use crate::config::{EmbeddingConfig, WorkerConfig};
use crate::models::IndexItem;
use crate::store::Store;
use crate::worker::{self, ProcessStatus, WorkerEvent, WorkerRequest};

/// Progress as reported to the orchestrator's callback.
#[derive(Debug, Clone)]
pub struct ProcessProgress {
    pub status: ProcessStatus,
    pub total: Option<usize>,
    pub processed: Option<usize>,
    pub message: Option<String>,
}

pub type ProgressCallback = Arc<dyn Fn(ProcessProgress) + Send + Sync>;

struct WorkerHandle {
    tx: mpsc::UnboundedSender<WorkerRequest>,
}

struct ManagerSession {
    owner: String,
    total_expected: usize,
    batch_size: usize,
    total_sent: usize,
    buffer: Vec<IndexItem>,
    last_item_at: Instant,
    flush_deadline: Option<Instant>,
}

struct Inner {
    worker: Option<WorkerHandle>,
    session: Option<ManagerSession>,
    callback: Option<ProgressCallback>,
    pending_searches: HashMap<u64, oneshot::Sender<Result<Vec<(String, f32)>, String>>>,
    next_request_id: u64,
    latest_search: u64,
    last_activity: Instant,
}

pub struct WorkerManager {
    store: Arc<Store>,
    embedding: EmbeddingConfig,
    config: WorkerConfig,
    weak: Weak<WorkerManager>,
    inner: Mutex<Inner>,
}

impl WorkerManager {
    pub fn new(store: Arc<Store>, embedding: EmbeddingConfig, config: WorkerConfig) -> Arc<Self> {
        let manager = Arc::new_cyclic(|weak| Self {
            store,
            embedding,
            config,
            weak: weak.clone(),
            inner: Mutex::new(Inner {
                worker: None,
                session: None,
                callback: None,
                pending_searches: HashMap::new(),
                next_request_id: 0,
                latest_search: 0,
                last_activity: Instant::now(),
            }),
        });

        // Maintenance ticker: debounce flushes, inactivity auto-end, idle
        // teardown. Holds only a weak reference so the manager can drop.
        let weak = Arc::downgrade(&manager);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(200));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                match weak.upgrade() {
                    Some(manager) => manager.tick().await,
                    None => break,
                }
            }
        });

        manager
    }

    fn ensure_worker(&self, inner: &mut Inner) {
        if inner.worker.is_some() {
            return;
        }
        debug!("lazy-spawning vector worker");
        let (tx, mut events, _task) = worker::spawn(
            self.store.clone(),
            self.embedding.clone(),
            self.config.clone(),
        );

        let weak = self.weak.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match weak.upgrade() {
                    Some(manager) => manager.handle_event(event).await,
                    None => break,
                }
            }
        });

        inner.worker = Some(WorkerHandle { tx });
    }

    async fn handle_event(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::Ready => debug!("vector worker ready"),
            WorkerEvent::Progress {
                status,
                total,
                processed,
                message,
            } => {
                let callback = {
                    let mut inner = self.inner.lock().await;
                    inner.last_activity = Instant::now();
                    if status == ProcessStatus::Complete {
                        inner.session = None;
                    }
                    inner.callback.clone()
                };
                if let Some(callback) = callback {
                    callback(ProcessProgress {
                        status,
                        total: Some(total),
                        processed: Some(processed),
                        message,
                    });
                }
            }
            WorkerEvent::StreamingProgress {
                processed,
                total,
                message,
            } => {
                let callback = {
                    let mut inner = self.inner.lock().await;
                    inner.last_activity = Instant::now();
                    inner.callback.clone()
                };
                if let Some(callback) = callback {
                    callback(ProcessProgress {
                        status: ProcessStatus::Processing,
                        total: Some(total),
                        processed: Some(processed),
                        message: message
                            .or_else(|| Some(format!("Streaming vectorization: {}/{}", processed, total))),
                    });
                }
            }
            WorkerEvent::SearchResults { request_id, hits } => {
                let mut inner = self.inner.lock().await;
                inner.last_activity = Instant::now();
                // A missing entry means the request was superseded or timed
                // out; the response is stale and dropped.
                if let Some(tx) = inner.pending_searches.remove(&request_id) {
                    let _ = tx.send(Ok(hits));
                }
            }
            WorkerEvent::SearchError { request_id, error } => {
                let mut inner = self.inner.lock().await;
                if let Some(tx) = inner.pending_searches.remove(&request_id) {
                    let _ = tx.send(Err(error));
                }
            }
        }
    }

    /// One-shot vectorization of a batch of items.
    ///
    /// A zero-item request is a no-op and never spins up the worker. Fails
    /// while a streaming session is active.
    pub async fn process_items(
        &self,
        items: Vec<IndexItem>,
        callback: Option<ProgressCallback>,
    ) -> Result<()> {
        if items.is_empty() {
            if let Some(callback) = callback {
                callback(ProcessProgress {
                    status: ProcessStatus::Complete,
                    total: Some(0),
                    processed: Some(0),
                    message: Some("No items to process".to_string()),
                });
            }
            return Ok(());
        }

        let mut inner = self.inner.lock().await;
        if inner.session.is_some() {
            bail!("cannot process items while a streaming session is active");
        }
        self.ensure_worker(&mut inner);
        inner.callback = callback;
        inner.last_activity = Instant::now();
        send(&mut inner, WorkerRequest::Process { items })
    }

    /// Open a streaming session owned by `owner` (typically a job id).
    ///
    /// Re-opening for the same owner is idempotent; a different owner is
    /// rejected while a session is active.
    pub async fn start_streaming(
        &self,
        owner: &str,
        total_expected: usize,
        batch_size: Option<usize>,
        callback: Option<ProgressCallback>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;

        if let Some(session) = &inner.session {
            if session.owner == owner {
                debug!(owner, "streaming session already active");
                return Ok(());
            }
            bail!(
                "streaming session owned by '{}' is still active",
                session.owner
            );
        }

        self.ensure_worker(&mut inner);
        let batch_size = batch_size.unwrap_or(self.config.stream_batch_size).max(1);
        inner.callback = callback.clone();
        inner.session = Some(ManagerSession {
            owner: owner.to_string(),
            total_expected,
            batch_size,
            total_sent: 0,
            buffer: Vec::new(),
            last_item_at: Instant::now(),
            flush_deadline: None,
        });
        inner.last_activity = Instant::now();
        send(
            &mut inner,
            WorkerRequest::StartStreaming {
                total_expected,
                batch_size,
            },
        )?;

        if let Some(callback) = callback {
            callback(ProcessProgress {
                status: ProcessStatus::Started,
                total: Some(total_expected),
                processed: Some(0),
                message: Some(format!("Starting streaming vectorization for {}", owner)),
            });
        }
        Ok(())
    }

    /// Buffer items into the open session, flushing by size, completion, or
    /// debounce timer.
    pub async fn stream_items(&self, items: Vec<IndexItem>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let flush_now = {
            let Some(session) = inner.session.as_mut() else {
                bail!("no active streaming session; call start_streaming first");
            };
            session.buffer.extend(items);
            session.last_item_at = Instant::now();
            let everything_arrived =
                session.total_sent + session.buffer.len() >= session.total_expected;
            session.buffer.len() >= session.batch_size || everything_arrived
        };
        inner.last_activity = Instant::now();

        if flush_now {
            self.flush_locked(&mut inner)?;
        } else {
            let deadline = Instant::now() + Duration::from_millis(self.config.flush_debounce_ms);
            if let Some(session) = inner.session.as_mut() {
                session.flush_deadline = Some(deadline);
            }
        }
        Ok(())
    }

    /// Explicitly end the session: flush the buffer and let the worker
    /// finalize.
    pub async fn end_streaming(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.session.is_none() {
            return Ok(());
        }
        self.flush_locked(&mut inner)?;
        send(&mut inner, WorkerRequest::EndStreaming)?;
        inner.session = None;
        debug!("streaming session ended");
        Ok(())
    }

    fn flush_locked(&self, inner: &mut Inner) -> Result<()> {
        let Some(session) = inner.session.as_mut() else {
            return Ok(());
        };
        if session.buffer.is_empty() {
            session.flush_deadline = None;
            return Ok(());
        }

        let batch: Vec<IndexItem> = std::mem::take(&mut session.buffer);
        session.total_sent += batch.len();
        session.flush_deadline = None;
        let is_last = session.total_sent >= session.total_expected;
        debug!(
            sent = session.total_sent,
            expected = session.total_expected,
            batch = batch.len(),
            "flushing stream batch"
        );
        send(inner, WorkerRequest::StreamBatch { items: batch, is_last })
    }

    /// Nearest-neighbor search, debounced and correlated.
    ///
    /// Rapid successive calls collapse: a call superseded during its
    /// debounce window returns an empty result set, and late worker
    /// responses for superseded requests are ignored.
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        debounce_ms: u64,
    ) -> Result<Vec<(String, f32)>> {
        let request_id = {
            let mut inner = self.inner.lock().await;
            inner.next_request_id += 1;
            inner.latest_search = inner.next_request_id;
            inner.next_request_id
        };

        if debounce_ms > 0 {
            tokio::time::sleep(Duration::from_millis(debounce_ms)).await;
            let inner = self.inner.lock().await;
            if inner.latest_search != request_id {
                // A newer keystroke took over.
                return Ok(Vec::new());
            }
        }

        let rx = {
            let mut inner = self.inner.lock().await;
            self.ensure_worker(&mut inner);
            let (tx, rx) = oneshot::channel();
            inner.pending_searches.insert(request_id, tx);
            inner.last_activity = Instant::now();
            if let Err(e) = send(
                &mut inner,
                WorkerRequest::Search {
                    request_id,
                    query: query.to_string(),
                    top_k,
                },
            ) {
                inner.pending_searches.remove(&request_id);
                return Err(e);
            }
            rx
        };

        let timeout = Duration::from_millis(self.config.search_timeout_ms);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(hits))) => Ok(hits),
            Ok(Ok(Err(error))) => bail!("semantic search failed: {}", error),
            Ok(Err(_)) => bail!("vector worker dropped the search request"),
            Err(_) => {
                let mut inner = self.inner.lock().await;
                inner.pending_searches.remove(&request_id);
                bail!("semantic search timed out")
            }
        }
    }

    /// Clear the worker's in-memory and persisted index.
    pub async fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.ensure_worker(&mut inner);
        inner.last_activity = Instant::now();
        send(&mut inner, WorkerRequest::Reset)
    }

    pub async fn is_streaming_active(&self) -> bool {
        self.inner.lock().await.session.is_some()
    }

    /// Tear the worker down. New work re-initializes it transparently.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(session) = &inner.session {
            warn!(owner = %session.owner, "shutting down with an open session");
            let _ = self.flush_locked(&mut inner);
            if let Some(handle) = &inner.worker {
                let _ = handle.tx.send(WorkerRequest::EndStreaming);
            }
            inner.session = None;
        }
        // Dropping the sender lets the worker drain its queue and exit.
        inner.worker = None;
        inner.callback = None;
        inner.pending_searches.clear();
    }

    async fn tick(&self) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        enum SessionAction {
            Nothing,
            DebounceFlush,
            ForceEnd,
        }

        let action = match &inner.session {
            Some(session)
                if session
                    .flush_deadline
                    .map_or(false, |deadline| now >= deadline) =>
            {
                SessionAction::DebounceFlush
            }
            Some(session)
                if now.duration_since(session.last_item_at)
                    >= Duration::from_millis(self.config.session_inactivity_ms) =>
            {
                warn!(
                    owner = %session.owner,
                    "streaming session idle too long; force-ending"
                );
                SessionAction::ForceEnd
            }
            _ => SessionAction::Nothing,
        };

        match action {
            SessionAction::Nothing => {}
            SessionAction::DebounceFlush => {
                if let Err(e) = self.flush_locked(&mut inner) {
                    warn!(error = %e, "debounce flush failed");
                }
            }
            SessionAction::ForceEnd => {
                let _ = self.flush_locked(&mut inner);
                if let Some(handle) = &inner.worker {
                    let _ = handle.tx.send(WorkerRequest::EndStreaming);
                }
                inner.session = None;
            }
        }

        // Idle unload: nothing buffered, nothing pending, nobody streaming.
        if inner.session.is_none()
            && inner.pending_searches.is_empty()
            && inner.worker.is_some()
            && now.duration_since(inner.last_activity)
                >= Duration::from_millis(self.config.idle_timeout_ms)
        {
            debug!("vector worker idle; unloading");
            inner.worker = None;
            inner.callback = None;
        }
    }
}

/// Forward a request to the worker. A dead worker clears the handle so the
/// next request re-initializes from scratch.
fn send(inner: &mut Inner, request: WorkerRequest) -> Result<()> {
    let handle = inner
        .worker
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("vector worker is not running"))?;
    if handle.tx.send(request).is_err() {
        inner.worker = None;
        anyhow::bail!("vector worker channel closed; worker state reset");
    }
    Ok(())
}
