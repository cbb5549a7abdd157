//! Vector worker.
//!
//! The worker runs on its own tokio task and owns everything vector-shaped:
//! the embedding configuration, an in-memory `(id → embedding)` index, and
//! the persisted copy of that index in the `vectors` collection. Nothing
//! else touches vector state; communication happens only through the
//! [`WorkerRequest`] / [`WorkerEvent`] message enums, matched exhaustively.
//!
//! An item id is embedded at most once per worker lifetime: the id set is
//! rebuilt from the persisted index on init, and re-submitted ids are
//! skipped (while still counting toward streaming `processed` totals).
//!
//! A new `Process` or `Reset` arriving while a one-shot job is in flight
//! cancels it cooperatively — the signal is checked between batches, never
//! preemptively.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{EmbeddingConfig, WorkerConfig};
use crate::embedding;
use crate::models::{IndexItem, VectorRecord};
use crate::store::{Store, VECTORS};

/// Messages into the worker.
#[derive(Debug)]
pub enum WorkerRequest {
    Init,
    Process {
        items: Vec<IndexItem>,
    },
    StartStreaming {
        total_expected: usize,
        batch_size: usize,
    },
    StreamBatch {
        items: Vec<IndexItem>,
        is_last: bool,
    },
    EndStreaming,
    Search {
        request_id: u64,
        query: String,
        top_k: usize,
    },
    Reset,
}

/// Messages out of the worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Ready,
    Progress {
        status: ProcessStatus,
        total: usize,
        processed: usize,
        message: Option<String>,
    },
    StreamingProgress {
        processed: usize,
        total: usize,
        message: Option<String>,
    },
    SearchResults {
        request_id: u64,
        hits: Vec<(String, f32)>,
    },
    SearchError {
        request_id: u64,
        error: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Started,
    Processing,
    Complete,
    Cancelled,
    Error,
}

/// Spawn the worker task. Returns the request sender, the event receiver,
/// and the task handle. Dropping the sender shuts the worker down after it
/// flushes any dangling session.
pub fn spawn(
    store: Arc<Store>,
    embedding: EmbeddingConfig,
    config: WorkerConfig,
) -> (
    mpsc::UnboundedSender<WorkerRequest>,
    mpsc::UnboundedReceiver<WorkerEvent>,
    JoinHandle<()>,
) {
    let (req_tx, req_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
        let worker = VectorWorker {
            store,
            embedding,
            config,
            index: HashMap::new(),
            session: None,
            pending_persist: Vec::new(),
            batches_since_persist: 0,
            events: event_tx,
        };
        worker.run(req_rx).await;
    });

    (req_tx, event_rx, task)
}

struct StreamingSession {
    total_expected: usize,
    batch_size: usize,
    received: usize,
    processed: usize,
    buffer: Vec<IndexItem>,
}

struct VectorWorker {
    store: Arc<Store>,
    embedding: EmbeddingConfig,
    config: WorkerConfig,
    index: HashMap<String, Vec<f32>>,
    session: Option<StreamingSession>,
    /// Ids embedded since the last persist.
    pending_persist: Vec<String>,
    batches_since_persist: usize,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl VectorWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<WorkerRequest>) {
        if let Err(e) = self.init().await {
            warn!(error = %e, "vector worker init failed");
            self.emit(WorkerEvent::Progress {
                status: ProcessStatus::Error,
                total: 0,
                processed: 0,
                message: Some(format!("init failed: {}", e)),
            });
        }
        self.emit(WorkerEvent::Ready);

        let mut backlog: VecDeque<WorkerRequest> = VecDeque::new();
        loop {
            let msg = match backlog.pop_front() {
                Some(msg) => msg,
                None => match rx.recv().await {
                    Some(msg) => msg,
                    None => break,
                },
            };
            self.handle(msg, &mut rx, &mut backlog).await;
        }

        // Channel closed: flush anything still buffered before teardown.
        if self.session.is_some() {
            self.end_streaming().await;
        }
        self.persist().await;
        debug!("vector worker shut down");
    }

    async fn handle(
        &mut self,
        msg: WorkerRequest,
        rx: &mut mpsc::UnboundedReceiver<WorkerRequest>,
        backlog: &mut VecDeque<WorkerRequest>,
    ) {
        match msg {
            WorkerRequest::Init => {
                // Idempotent: the index was loaded on spawn.
                self.emit(WorkerEvent::Ready);
            }
            WorkerRequest::Process { items } => self.process(items, rx, backlog).await,
            WorkerRequest::StartStreaming {
                total_expected,
                batch_size,
            } => self.start_streaming(total_expected, batch_size).await,
            WorkerRequest::StreamBatch { items, is_last } => {
                self.stream_batch(items, is_last).await
            }
            WorkerRequest::EndStreaming => self.end_streaming().await,
            WorkerRequest::Search {
                request_id,
                query,
                top_k,
            } => self.search(request_id, &query, top_k).await,
            WorkerRequest::Reset => self.reset().await,
        }
    }

    async fn init(&mut self) -> anyhow::Result<()> {
        let records: Vec<VectorRecord> = self.store.get_all(VECTORS).await?;
        let count = records.len();
        self.index = records.into_iter().map(|r| (r.id, r.embedding)).collect();
        debug!(count, "vector index loaded from store");
        Ok(())
    }

    fn emit(&self, event: WorkerEvent) {
        let _ = self.events.send(event);
    }

    fn progress(&self, status: ProcessStatus, total: usize, processed: usize, message: &str) {
        self.emit(WorkerEvent::Progress {
            status,
            total,
            processed,
            message: if message.is_empty() {
                None
            } else {
                Some(message.to_string())
            },
        });
    }

    /// Pull queued messages off the channel; a `Process` or `Reset` among
    /// them cancels the in-flight one-shot job.
    fn drain_preemptions(
        &self,
        rx: &mut mpsc::UnboundedReceiver<WorkerRequest>,
        backlog: &mut VecDeque<WorkerRequest>,
    ) -> bool {
        let mut preempted = false;
        while let Ok(msg) = rx.try_recv() {
            if matches!(msg, WorkerRequest::Process { .. } | WorkerRequest::Reset) {
                preempted = true;
            }
            backlog.push_back(msg);
        }
        preempted
    }

    async fn process(
        &mut self,
        items: Vec<IndexItem>,
        rx: &mut mpsc::UnboundedReceiver<WorkerRequest>,
        backlog: &mut VecDeque<WorkerRequest>,
    ) {
        let unprocessed: Vec<IndexItem> = items
            .into_iter()
            .filter(|i| !self.index.contains_key(&i.id))
            .collect();

        if unprocessed.is_empty() {
            self.progress(ProcessStatus::Complete, 0, 0, "No new items to process");
            return;
        }

        let total = unprocessed.len();
        self.progress(ProcessStatus::Started, total, 0, "");

        let mut processed = 0usize;
        for batch in unprocessed.chunks(self.config.embed_batch_size) {
            if self.drain_preemptions(rx, backlog) {
                self.persist().await;
                self.progress(
                    ProcessStatus::Cancelled,
                    total,
                    processed,
                    "Processing cancelled by a newer request",
                );
                return;
            }

            if let Err(e) = self.embed_new(batch).await {
                warn!(error = %e, "embedding batch failed");
                self.progress(
                    ProcessStatus::Error,
                    total,
                    processed,
                    &format!("embedding batch failed: {}", e),
                );
            }

            processed = (processed + batch.len()).min(total);
            self.batches_since_persist += 1;
            if self.batches_since_persist >= self.config.persist_every_batches {
                self.persist().await;
            }
            self.progress(ProcessStatus::Processing, total, processed, "");

            // Stay responsive between batches.
            tokio::task::yield_now().await;
        }

        self.persist().await;
        self.progress(
            ProcessStatus::Complete,
            total,
            processed,
            "All items processed",
        );
    }

    /// Embed items whose ids are not in the index yet.
    async fn embed_new(&mut self, items: &[IndexItem]) -> anyhow::Result<()> {
        let fresh: Vec<&IndexItem> = items
            .iter()
            .filter(|i| !self.index.contains_key(&i.id))
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }

        let texts: Vec<String> = fresh.iter().map(|i| embed_text(i)).collect();
        let vectors = embedding::embed_texts(&self.embedding, &texts).await?;

        for (item, vector) in fresh.iter().zip(vectors.into_iter()) {
            self.index.insert(item.id.clone(), vector);
            self.pending_persist.push(item.id.clone());
        }
        Ok(())
    }

    async fn persist(&mut self) {
        for id in std::mem::take(&mut self.pending_persist) {
            if let Some(embedding) = self.index.get(&id) {
                let record = VectorRecord {
                    id: id.clone(),
                    embedding: embedding.clone(),
                };
                if let Err(e) = self.store.put(VECTORS, &id, &record).await {
                    // Keep the id queued so a later persist retries it.
                    warn!(id = %id, error = %e, "failed to persist vector");
                    self.pending_persist.push(id);
                }
            }
        }
        self.batches_since_persist = 0;
    }

    async fn start_streaming(&mut self, total_expected: usize, batch_size: usize) {
        if self.session.is_some() {
            // The manager enforces ownership; a replacement here means the
            // previous session is finished first.
            self.end_streaming().await;
        }
        debug!(total_expected, batch_size, "streaming session opened");
        self.session = Some(StreamingSession {
            total_expected,
            batch_size: batch_size.max(1),
            received: 0,
            processed: 0,
            buffer: Vec::new(),
        });
    }

    async fn stream_batch(&mut self, items: Vec<IndexItem>, is_last: bool) {
        let Some(mut session) = self.session.take() else {
            warn!("stream batch received with no active session");
            return;
        };

        session.received += items.len();
        session.buffer.extend(items);

        while session.buffer.len() >= session.batch_size
            || (is_last && !session.buffer.is_empty())
        {
            let take = session.batch_size.min(session.buffer.len());
            let chunk: Vec<IndexItem> = session.buffer.drain(..take).collect();
            // Duplicates still count toward processed totals.
            session.processed += chunk.len();

            if let Err(e) = self.embed_new(&chunk).await {
                warn!(error = %e, "streaming embed batch failed");
            }
            self.batches_since_persist += 1;
            if self.batches_since_persist >= self.config.persist_every_batches {
                self.persist().await;
            }
            self.emit(WorkerEvent::StreamingProgress {
                processed: session.processed,
                total: session.total_expected,
                message: None,
            });
            tokio::task::yield_now().await;
        }

        if session.received >= session.total_expected && session.buffer.is_empty() {
            let (total, processed) = (session.total_expected, session.processed);
            self.persist().await;
            self.progress(
                ProcessStatus::Complete,
                total,
                processed,
                "Streaming vectorization complete",
            );
        } else {
            self.session = Some(session);
        }
    }

    async fn end_streaming(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        // Flush whatever is buffered; partial batches are embedded, not
        // dropped.
        while !session.buffer.is_empty() {
            let take = session.batch_size.min(session.buffer.len());
            let chunk: Vec<IndexItem> = session.buffer.drain(..take).collect();
            session.processed += chunk.len();
            if let Err(e) = self.embed_new(&chunk).await {
                warn!(error = %e, "streaming flush failed");
            }
        }
        self.persist().await;
        self.progress(
            ProcessStatus::Complete,
            session.total_expected,
            session.processed,
            "Streaming vectorization complete",
        );
    }

    async fn search(&mut self, request_id: u64, query: &str, top_k: usize) {
        let query_vec = match embedding::embed_query(&self.embedding, query).await {
            Ok(v) => v,
            Err(e) => {
                self.emit(WorkerEvent::SearchError {
                    request_id,
                    error: e.to_string(),
                });
                return;
            }
        };

        let mut hits: Vec<(String, f32)> = self
            .index
            .iter()
            .map(|(id, vec)| (id.clone(), embedding::cosine_similarity(&query_vec, vec)))
            .collect();
        hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);

        self.emit(WorkerEvent::SearchResults { request_id, hits });
    }

    async fn reset(&mut self) {
        self.index.clear();
        self.pending_persist.clear();
        self.session = None;
        if let Err(e) = self.store.clear(VECTORS).await {
            warn!(error = %e, "failed to clear persisted vectors");
        }
        if let Err(e) = self.init().await {
            warn!(error = %e, "re-init after reset failed");
        }
        self.emit(WorkerEvent::Ready);
    }
}

/// Text handed to the embedder: title, body, category, and the metadata
/// fields that carry searchable names.
fn embed_text(item: &IndexItem) -> String {
    let mut parts = vec![
        item.text.as_str(),
        item.content.as_str(),
        item.category.as_str(),
    ];
    for key in ["author", "subject"] {
        if let Some(value) = item.metadata.get(key).and_then(|v| v.as_str()) {
            parts.push(value);
        }
    }
    parts.retain(|p| !p.is_empty());
    parts.join(" ")
}
