//! Adaptive fetch controller.
//!
//! Wraps a job's outbound calls with adaptive batch sizing, adaptive delay,
//! a bounded per-item retry queue, and a circuit breaker, so a scan of many
//! sequential pages never overwhelms the origin server. The controller's
//! state is serializable: jobs persist it inside their progress blob so an
//! interrupted scan resumes with the rate it had already learned.
//!
//! Failure semantics: individual call failures are retried up to
//! `max_retries` with backoff, then abandoned for this run (the caller
//! requeues the item token for the next one). Batch-level failures only
//! surface as a job failure when they prevent any forward progress.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::FetcherConfig;

/// Serializable controller state, persisted between runs via job progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetcherState {
    pub current_delay_ms: u64,
    pub current_batch_size: usize,
    pub consecutive_failures: u32,
    pub failed_requests: u32,
    /// Item tokens awaiting retry, oldest first. Bounded; overflow drops
    /// the oldest entry.
    pub retry_queue: VecDeque<String>,
    pub circuit_open: bool,
    /// Epoch ms at which the circuit opened; meaningless while closed.
    pub circuit_opened_at: i64,
    pub last_success_at: i64,
}

pub struct AdaptiveFetcher {
    config: FetcherConfig,
    state: FetcherState,
    finished: bool,
}

impl AdaptiveFetcher {
    pub fn new(config: FetcherConfig) -> Self {
        let state = FetcherState {
            current_delay_ms: config.base_delay_ms,
            current_batch_size: config.base_batch_size,
            consecutive_failures: 0,
            failed_requests: 0,
            retry_queue: VecDeque::new(),
            circuit_open: false,
            circuit_opened_at: 0,
            last_success_at: now_ms(),
        };
        Self {
            config,
            state,
            finished: false,
        }
    }

    /// Resume from persisted state, clamping into the configured bounds.
    pub fn restore(config: FetcherConfig, mut state: FetcherState) -> Self {
        state.current_delay_ms = state
            .current_delay_ms
            .clamp(config.min_delay_ms, config.max_delay_ms);
        state.current_batch_size = state
            .current_batch_size
            .clamp(config.min_batch_size, config.max_batch_size);
        while state.retry_queue.len() > config.retry_queue_cap {
            state.retry_queue.pop_front();
        }
        Self {
            config,
            state,
            finished: false,
        }
    }

    /// Snapshot of the state for persistence.
    pub fn state(&self) -> FetcherState {
        self.state.clone()
    }

    pub fn batch_size(&self) -> usize {
        self.state.current_batch_size
    }

    pub fn current_delay_ms(&self) -> u64 {
        self.state.current_delay_ms
    }

    /// Signal that this run needs no further calls (items fell outside the
    /// relevance window, or the scan reached its end).
    pub fn finish(&mut self) {
        self.finished = true;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Whether the circuit is open right now. Also closes it when the
    /// cool-down has elapsed, resetting the failure counter.
    pub fn circuit_open(&mut self) -> bool {
        if self.state.circuit_open
            && now_ms() - self.state.circuit_opened_at >= self.config.cooldown_ms as i64
        {
            debug!("circuit breaker cool-down elapsed; closing");
            self.state.circuit_open = false;
            self.state.consecutive_failures = 0;
        }
        self.state.circuit_open
    }

    /// Sleep for the adaptive delay; while the circuit is open, sleep at
    /// the maximum delay instead.
    pub async fn wait(&mut self) {
        let delay = if self.circuit_open() {
            self.config.max_delay_ms
        } else {
            self.state.current_delay_ms
        };
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    /// Run one call with per-call retries and adaptive bookkeeping.
    ///
    /// Returns `None` when the circuit is open (the call is skipped) or when
    /// all retries are exhausted; the caller decides whether to requeue.
    pub async fn execute<T, F, Fut>(&mut self, mut op: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.circuit_open() {
            return None;
        }

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(self.state.current_delay_ms)).await;
            }

            let started = std::time::Instant::now();
            match op().await {
                Ok(value) => {
                    self.record_success(started.elapsed().as_millis() as u64);
                    return Some(value);
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "fetch call failed");
                    self.record_failure();
                    if self.state.circuit_open {
                        return None;
                    }
                }
            }
        }
        None
    }

    /// Queue an item token for priority retry on the next invocation.
    pub fn queue_retry(&mut self, token: String) {
        if self.state.retry_queue.len() >= self.config.retry_queue_cap {
            self.state.retry_queue.pop_front();
        }
        self.state.retry_queue.push_back(token);
    }

    /// Drain the retry queue; callers retry these before fetching new work.
    pub fn take_retries(&mut self) -> Vec<String> {
        self.state.retry_queue.drain(..).collect()
    }

    pub fn record_success(&mut self, response_time_ms: u64) {
        self.state.last_success_at = now_ms();
        self.state.consecutive_failures = 0;
        self.state.failed_requests = self.state.failed_requests.saturating_sub(1);

        // Adaptive delay: grow on slow responses or lingering failures,
        // shrink toward the floor when the origin is healthy.
        if self.state.failed_requests > 0 || response_time_ms > self.config.slow_response_ms {
            self.grow_delay();
        } else if response_time_ms < self.config.fast_response_ms {
            self.state.current_delay_ms = ((self.state.current_delay_ms as f64 * 0.8) as u64)
                .max(self.config.min_delay_ms);
        }

        // Adaptive batch size, symmetric to the delay policy.
        if response_time_ms > self.config.slow_response_ms {
            self.shrink_batch();
        } else if self.state.failed_requests == 0 && response_time_ms < self.config.fast_response_ms
        {
            self.state.current_batch_size = (((self.state.current_batch_size as f64) * 1.2) as usize)
                .min(self.config.max_batch_size);
        }
    }

    pub fn record_failure(&mut self) {
        self.state.consecutive_failures += 1;
        self.state.failed_requests += 1;
        self.grow_delay();
        self.shrink_batch();

        if !self.state.circuit_open
            && self.state.consecutive_failures >= self.config.failure_threshold
        {
            warn!(
                failures = self.state.consecutive_failures,
                cooldown_ms = self.config.cooldown_ms,
                "circuit breaker opened"
            );
            self.state.circuit_open = true;
            self.state.circuit_opened_at = now_ms();
        }
    }

    fn grow_delay(&mut self) {
        self.state.current_delay_ms = ((self.state.current_delay_ms as f64
            * self.config.backoff_multiplier) as u64)
            .clamp(self.config.min_delay_ms, self.config.max_delay_ms);
    }

    fn shrink_batch(&mut self) {
        self.state.current_batch_size = (((self.state.current_batch_size as f64) * 0.7) as usize)
            .max(self.config.min_batch_size);
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_config() -> FetcherConfig {
        FetcherConfig {
            min_delay_ms: 1,
            max_delay_ms: 20,
            base_delay_ms: 2,
            backoff_multiplier: 2.0,
            max_retries: 2,
            min_batch_size: 5,
            max_batch_size: 50,
            base_batch_size: 20,
            failure_threshold: 3,
            cooldown_ms: 50,
            retry_queue_cap: 4,
            slow_response_ms: 2000,
            fast_response_ms: 500,
        }
    }

    #[test]
    fn failure_grows_delay_and_shrinks_batch() {
        let mut fetcher = AdaptiveFetcher::new(test_config());
        fetcher.record_failure();
        assert_eq!(fetcher.current_delay_ms(), 4);
        assert_eq!(fetcher.batch_size(), 14);
    }

    #[test]
    fn delay_clamps_at_max() {
        let mut fetcher = AdaptiveFetcher::new(test_config());
        for _ in 0..10 {
            fetcher.record_failure();
        }
        assert_eq!(fetcher.current_delay_ms(), 20);
        assert_eq!(fetcher.batch_size(), 5);
    }

    #[test]
    fn fast_success_shrinks_delay_and_grows_batch() {
        let mut fetcher = AdaptiveFetcher::new(test_config());
        fetcher.record_failure();
        fetcher.record_failure();
        // After two failures: delay 2→4→8, batch 20→14→9, failed_requests 2.
        // First success drains failed_requests to 1, so the delay still grows.
        fetcher.record_success(10);
        assert_eq!(fetcher.current_delay_ms(), 16);
        // Second success: failure-free and fast, so delay shrinks, batch grows.
        fetcher.record_success(10);
        assert_eq!(fetcher.current_delay_ms(), 12);
        assert_eq!(fetcher.batch_size(), 10);
    }

    #[test]
    fn breaker_opens_at_threshold() {
        let mut fetcher = AdaptiveFetcher::new(test_config());
        fetcher.record_failure();
        fetcher.record_failure();
        assert!(!fetcher.circuit_open());
        fetcher.record_failure();
        assert!(fetcher.circuit_open());
    }

    #[tokio::test]
    async fn open_circuit_skips_calls() {
        let mut fetcher = AdaptiveFetcher::new(test_config());
        for _ in 0..3 {
            fetcher.record_failure();
        }

        let calls = AtomicU32::new(0);
        let result: Option<u32> = fetcher
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(7) }
            })
            .await;
        assert!(result.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn circuit_closes_after_cooldown() {
        let mut fetcher = AdaptiveFetcher::new(test_config());
        for _ in 0..3 {
            fetcher.record_failure();
        }
        assert!(fetcher.circuit_open());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!fetcher.circuit_open());
        assert_eq!(fetcher.state().consecutive_failures, 0);

        let result = fetcher.execute(|| async { Ok(42u32) }).await;
        assert_eq!(result, Some(42));
    }

    #[tokio::test]
    async fn execute_retries_then_gives_up() {
        let mut fetcher = AdaptiveFetcher::new(test_config());
        let calls = AtomicU32::new(0);

        let result: Option<u32> = fetcher
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { anyhow::bail!("boom") }
            })
            .await;

        assert!(result.is_none());
        // max_retries = 2 → three attempts total.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn execute_recovers_on_retry() {
        let mut fetcher = AdaptiveFetcher::new(test_config());
        let calls = AtomicU32::new(0);

        let result = fetcher
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        anyhow::bail!("first attempt fails")
                    } else {
                        Ok(99u32)
                    }
                }
            })
            .await;

        assert_eq!(result, Some(99));
        assert_eq!(fetcher.state().consecutive_failures, 0);
    }

    #[test]
    fn retry_queue_drops_oldest_beyond_cap() {
        let mut fetcher = AdaptiveFetcher::new(test_config());
        for i in 0..6 {
            fetcher.queue_retry(format!("item-{}", i));
        }
        let retries = fetcher.take_retries();
        assert_eq!(retries.len(), 4);
        assert_eq!(retries[0], "item-2");
        assert_eq!(retries[3], "item-5");
        assert!(fetcher.take_retries().is_empty());
    }

    #[test]
    fn restore_clamps_into_bounds() {
        let config = test_config();
        let mut state = AdaptiveFetcher::new(config.clone()).state();
        state.current_delay_ms = 9999;
        state.current_batch_size = 1;

        let fetcher = AdaptiveFetcher::restore(config, state);
        assert_eq!(fetcher.current_delay_ms(), 20);
        assert_eq!(fetcher.batch_size(), 5);
    }
}
