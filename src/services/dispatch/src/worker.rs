//! # Worker Pool
//!
//! A set of concurrent consumers draining a [`Queue`] through an
//! [`ItemHandler`]. The pool starts `min_workers` workers, optionally runs an
//! auto-scale loop that grows or shrinks it by queue depth, and routes failed
//! items to the retry decorator. Stopping a worker waits for the item it is
//! handling; handlers are never aborted mid-item.

use crate::config::WorkerPoolConfig;
use crate::error::{DispatchError, Result};
use crate::metrics::DispatchMetrics;
use crate::queue::{Queue, RetryQueue, WorkItem};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const COMPONENT: &str = "worker pool";

/// Work performed for every dequeued item
#[async_trait]
pub trait ItemHandler: Send + Sync {
    async fn handle(&self, item: &WorkItem) -> Result<()>;
}

/// Advisory pool health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolHealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for PoolHealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PoolHealthStatus::Healthy => "healthy",
            PoolHealthStatus::Degraded => "degraded",
            PoolHealthStatus::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolHealth {
    pub status: PoolHealthStatus,
    pub running: bool,
    pub error_rate: f64,
    pub queue_depth: usize,
    pub workers: usize,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub active_workers: usize,
    pub idle_workers: usize,
    pub total_workers: usize,
    pub processed: u64,
    pub errors: u64,
    pub avg_processing_time_ms: f64,
    pub queue_depth: usize,
}

struct WorkerHandle {
    id: usize,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    errors: AtomicU64,
    processing_micros: AtomicU64,
    busy: AtomicUsize,
}

/// Auto-scaling pool of queue consumers
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<dyn Queue>,
    handler: Arc<dyn ItemHandler>,
    retry: Option<Arc<RetryQueue>>,
    workers: tokio::sync::Mutex<Vec<WorkerHandle>>,
    running: AtomicBool,
    autoscaler: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    next_worker_id: AtomicUsize,
    counters: Counters,
    recent: Mutex<VecDeque<bool>>,
    metrics: Option<DispatchMetrics>,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<dyn Queue>,
        handler: Arc<dyn ItemHandler>,
    ) -> Self {
        Self {
            config,
            queue,
            handler,
            retry: None,
            workers: tokio::sync::Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            autoscaler: Mutex::new(None),
            next_worker_id: AtomicUsize::new(0),
            counters: Counters::default(),
            recent: Mutex::new(VecDeque::new()),
            metrics: None,
        }
    }

    /// Route handler failures through `retry` instead of dropping them
    pub fn with_retry(mut self, retry: Arc<RetryQueue>) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_metrics(mut self, metrics: DispatchMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Launch `min_workers` workers and the auto-scale loop
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DispatchError::already_running(COMPONENT));
        }

        {
            let mut workers = self.workers.lock().await;
            for _ in 0..self.config.min_workers {
                workers.push(self.spawn_worker());
            }
        }

        if self.config.autoscale_enabled {
            let cancel = CancellationToken::new();
            let pool = Arc::clone(self);
            let token = cancel.clone();
            let join = tokio::spawn(async move { pool.autoscale_loop(token).await });
            *self.autoscaler.lock() = Some((cancel, join));
        }

        self.publish_worker_gauges().await;
        info!(
            workers = self.config.min_workers,
            autoscale = self.config.autoscale_enabled,
            "Worker pool started"
        );
        Ok(())
    }

    /// Stop the auto-scale loop and every worker, waiting for in-flight items
    pub async fn stop(&self) -> Result<()> {
        if self
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DispatchError::not_running(COMPONENT));
        }

        let autoscaler = self.autoscaler.lock().take();
        if let Some((cancel, join)) = autoscaler {
            cancel.cancel();
            if let Err(e) = join.await {
                warn!(error = %e, "Auto-scale task ended abnormally");
            }
        }

        let handles: Vec<WorkerHandle> = self.workers.lock().await.drain(..).collect();
        let count = handles.len();
        Self::stop_workers(handles).await;

        self.publish_worker_gauges().await;
        info!(workers = count, "Worker pool stopped");
        Ok(())
    }

    /// Set the live worker count, within `[min_workers, max_workers]`
    pub async fn scale(self: &Arc<Self>, target: usize) -> Result<()> {
        let (min, max) = (self.config.min_workers, self.config.max_workers);
        if target < min || target > max {
            return Err(DispatchError::ScaleOutOfRange {
                requested: target,
                min,
                max,
            });
        }

        let mut workers = self.workers.lock().await;
        if !self.is_running() {
            return Err(DispatchError::not_running(COMPONENT));
        }

        let current = workers.len();
        if target > current {
            for _ in current..target {
                workers.push(self.spawn_worker());
            }
        } else if target < current {
            let removed = workers.split_off(target);
            Self::stop_workers(removed).await;
        }
        drop(workers);

        if target != current {
            info!(from = current, to = target, "Worker pool scaled");
            self.publish_worker_gauges().await;
        }
        Ok(())
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Ids of live workers, oldest first
    pub async fn worker_ids(&self) -> Vec<usize> {
        self.workers.lock().await.iter().map(|w| w.id).collect()
    }

    /// One auto-scale evaluation; returns the worker count it settled on
    pub async fn autoscale_once(self: &Arc<Self>) -> Result<usize> {
        let depth = self.queue.size().await?;
        if let Some(metrics) = &self.metrics {
            metrics.set_queue_depth(depth);
        }

        let current = self.worker_count().await;
        let desired = desired_workers(&self.config, current, depth);
        if desired != current {
            debug!(depth, current, desired, "Auto-scale adjusting worker count");
            self.scale(desired).await?;
        }
        Ok(desired)
    }

    async fn autoscale_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.autoscale_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.autoscale_once().await {
                warn!(error = %e, "Auto-scale evaluation failed");
            }
        }
        debug!("Auto-scale loop stopped");
    }

    fn spawn_worker(self: &Arc<Self>) -> WorkerHandle {
        let id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let pool = Arc::clone(self);
        let token = cancel.clone();
        let join = tokio::spawn(async move { pool.run_worker(id, token).await });
        WorkerHandle { id, cancel, join }
    }

    async fn stop_workers(handles: Vec<WorkerHandle>) {
        for handle in &handles {
            handle.cancel.cancel();
        }
        for handle in handles {
            if let Err(e) = handle.join.await {
                error!(worker_id = handle.id, error = %e, "Worker ended abnormally");
            }
        }
    }

    async fn run_worker(&self, id: usize, cancel: CancellationToken) {
        debug!(worker_id = id, "Worker started");

        while !cancel.is_cancelled() {
            let item = match self.queue.dequeue().await {
                Ok(item) => item,
                Err(DispatchError::QueueEmpty) => {
                    if sleep_or_cancel(&cancel, self.config.poll_interval()).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    warn!(worker_id = id, error = %e, "Dequeue failed, backing off");
                    if sleep_or_cancel(&cancel, self.config.error_backoff()).await {
                        break;
                    }
                    continue;
                }
            };

            self.process_item(id, item).await;
        }

        debug!(worker_id = id, "Worker stopped");
    }

    async fn process_item(&self, worker_id: usize, item: WorkItem) {
        self.counters.busy.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        let result = self.handler.handle(&item).await;
        let elapsed = started.elapsed();
        self.counters.busy.fetch_sub(1, Ordering::SeqCst);

        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        self.counters
            .processing_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.record_outcome(result.is_ok());

        match result {
            Ok(()) => {
                debug!(
                    worker_id,
                    item_id = %item.id,
                    duration_ms = elapsed.as_millis() as u64,
                    "Work item handled"
                );
            }
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    worker_id,
                    item_id = %item.id,
                    retry_count = item.retry_count,
                    error = %e,
                    "Work item failed"
                );
                self.route_failure(item, e).await;
            }
        }
    }

    /// Retryable failures go back through the retry decorator, the rest to dead letter
    async fn route_failure(&self, mut item: WorkItem, error: DispatchError) {
        let reason = error.to_string();
        item.last_error = Some(reason.clone());

        let Some(retry) = &self.retry else {
            warn!(item_id = %item.id, error = %reason, "No retry queue configured, dropping work item");
            return;
        };

        let item_id = item.id;
        let routed = if error.is_retryable() {
            retry.retry(item).await
        } else {
            retry.move_to_dead_letter(item, reason).await
        };

        match routed {
            Ok(outcome) => debug!(item_id = %item_id, ?outcome, "Failed work item routed"),
            Err(e) => error!(item_id = %item_id, error = %e, "Failed to route failed work item"),
        }
    }

    fn record_outcome(&self, success: bool) {
        let window = self.config.health_window.max(1);
        let mut recent = self.recent.lock();
        recent.push_back(success);
        while recent.len() > window {
            recent.pop_front();
        }
    }

    /// Error rate over the recent outcome window
    pub fn error_rate(&self) -> f64 {
        let recent = self.recent.lock();
        if recent.is_empty() {
            return 0.0;
        }
        let failures = recent.iter().filter(|ok| !**ok).count();
        failures as f64 / recent.len() as f64
    }

    /// Advisory health from recent error rate and queue depth
    pub async fn get_health(&self) -> PoolHealth {
        let error_rate = self.error_rate();
        let workers = self.worker_count().await;
        let mut reasons = Vec::new();

        let queue_depth = match self.queue.size().await {
            Ok(depth) => depth,
            Err(e) => {
                reasons.push(format!("queue unavailable: {}", e));
                return PoolHealth {
                    status: PoolHealthStatus::Unhealthy,
                    running: self.is_running(),
                    error_rate,
                    queue_depth: 0,
                    workers,
                    reasons,
                };
            }
        };

        let mut status = PoolHealthStatus::Healthy;
        if error_rate >= self.config.unhealthy_error_rate {
            status = PoolHealthStatus::Unhealthy;
            reasons.push(format!("error rate {:.2} at or above unhealthy threshold", error_rate));
        } else if error_rate >= self.config.degraded_error_rate {
            status = PoolHealthStatus::Degraded;
            reasons.push(format!("error rate {:.2} at or above degraded threshold", error_rate));
        }
        if queue_depth > self.config.scale_up_threshold {
            if status == PoolHealthStatus::Healthy {
                status = PoolHealthStatus::Degraded;
            }
            reasons.push(format!("queue depth {} above scale-up threshold", queue_depth));
        }

        PoolHealth {
            status,
            running: self.is_running(),
            error_rate,
            queue_depth,
            workers,
            reasons,
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let total_workers = self.worker_count().await;
        let active_workers = self.counters.busy.load(Ordering::SeqCst).min(total_workers);
        let processed = self.counters.processed.load(Ordering::Relaxed);
        let micros = self.counters.processing_micros.load(Ordering::Relaxed);
        let avg_processing_time_ms = if processed > 0 {
            micros as f64 / processed as f64 / 1000.0
        } else {
            0.0
        };

        PoolStats {
            active_workers,
            idle_workers: total_workers - active_workers,
            total_workers,
            processed,
            errors: self.counters.errors.load(Ordering::Relaxed),
            avg_processing_time_ms,
            queue_depth: self.queue.size().await.unwrap_or(0),
        }
    }

    async fn publish_worker_gauges(&self) {
        if let Some(metrics) = &self.metrics {
            let total = self.worker_count().await;
            let active = self.counters.busy.load(Ordering::SeqCst).min(total);
            metrics.set_workers(active, total - active);
        }
    }
}

/// Desired worker count for a queue depth, clamped to the configured bounds
pub fn desired_workers(config: &WorkerPoolConfig, current: usize, depth: usize) -> usize {
    let desired = if depth > config.scale_up_threshold {
        current.saturating_add(config.scale_up_step)
    } else if depth < config.scale_down_threshold {
        current.saturating_sub(config.scale_down_step)
    } else {
        current
    };
    desired.clamp(config.min_workers, config.max_workers.max(config.min_workers))
}

/// Sleep for `duration`; true when cancelled first
async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::models::{Message, Priority, Target};
    use crate::queue::MemoryQueue;
    use rstest::rstest;

    fn test_config(min: usize, max: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            min_workers: min,
            max_workers: max,
            autoscale_enabled: false,
            poll_interval_ms: 5,
            error_backoff_ms: 10,
            ..Default::default()
        }
    }

    fn item(priority: Priority) -> WorkItem {
        let message = Message::new("t", "b")
            .with_target(Target::new("user", "u1", "chat"))
            .with_priority(priority);
        WorkItem::new(message)
    }

    /// Records handled item ids and fails according to `fail_with`
    #[derive(Default)]
    struct RecordingHandler {
        handled: Mutex<Vec<uuid::Uuid>>,
        fail_first: AtomicUsize,
        terminal: bool,
        delay: Duration,
        finished: AtomicUsize,
    }

    #[async_trait]
    impl ItemHandler for RecordingHandler {
        async fn handle(&self, item: &WorkItem) -> Result<()> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.handled.lock().push(item.id);
            self.finished.fetch_add(1, Ordering::SeqCst);

            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(if self.terminal {
                    DispatchError::validation("target", "bad recipient")
                } else {
                    DispatchError::network("connection reset")
                });
            }
            Ok(())
        }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop_are_guarded() {
        let queue: Arc<dyn Queue> = Arc::new(MemoryQueue::new(10));
        let pool = Arc::new(WorkerPool::new(
            test_config(2, 4),
            queue,
            Arc::new(RecordingHandler::default()),
        ));

        assert!(matches!(pool.stop().await, Err(DispatchError::NotRunning { .. })));
        pool.start().await.unwrap();
        assert_eq!(pool.worker_count().await, 2);
        assert!(matches!(
            pool.start().await,
            Err(DispatchError::AlreadyRunning { .. })
        ));

        pool.stop().await.unwrap();
        assert_eq!(pool.worker_count().await, 0);
        assert!(matches!(pool.stop().await, Err(DispatchError::NotRunning { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_drains_queue() {
        let queue: Arc<dyn Queue> = Arc::new(MemoryQueue::new(100));
        for _ in 0..20 {
            queue.enqueue(item(Priority::Normal)).await.unwrap();
        }
        let handler = Arc::new(RecordingHandler::default());
        let pool = Arc::new(WorkerPool::new(test_config(3, 3), queue.clone(), handler.clone()));

        pool.start().await.unwrap();
        wait_until(|| handler.finished.load(Ordering::SeqCst) == 20).await;
        pool.stop().await.unwrap();

        assert!(queue.is_empty().await.unwrap());
        let stats = pool.stats().await;
        assert_eq!(stats.processed, 20);
        assert_eq!(stats.errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_worker_respects_priority() {
        let queue: Arc<dyn Queue> = Arc::new(MemoryQueue::new(10));
        let low = item(Priority::Low);
        let urgent = item(Priority::Urgent);
        let (low_id, urgent_id) = (low.id, urgent.id);
        queue.enqueue(low).await.unwrap();
        queue.enqueue(urgent).await.unwrap();

        let handler = Arc::new(RecordingHandler::default());
        let pool = Arc::new(WorkerPool::new(test_config(1, 1), queue, handler.clone()));
        pool.start().await.unwrap();
        wait_until(|| handler.finished.load(Ordering::SeqCst) == 2).await;
        pool.stop().await.unwrap();

        assert_eq!(*handler.handled.lock(), vec![urgent_id, low_id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_bounds_and_changes() {
        let queue: Arc<dyn Queue> = Arc::new(MemoryQueue::new(10));
        let pool = Arc::new(WorkerPool::new(
            test_config(1, 4),
            queue,
            Arc::new(RecordingHandler::default()),
        ));
        pool.start().await.unwrap();

        assert!(matches!(
            pool.scale(5).await,
            Err(DispatchError::ScaleOutOfRange { requested: 5, .. })
        ));
        assert!(pool.scale(0).await.is_err());
        assert_eq!(pool.worker_count().await, 1);

        pool.scale(4).await.unwrap();
        assert_eq!(pool.worker_count().await, 4);

        let before = pool.worker_ids().await;
        pool.scale(2).await.unwrap();
        // Most recently started workers are the ones stopped
        assert_eq!(pool.worker_ids().await, before[..2].to_vec());

        pool.stop().await.unwrap();
        assert!(matches!(pool.scale(2).await, Err(DispatchError::NotRunning { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_in_flight_item() {
        let queue: Arc<dyn Queue> = Arc::new(MemoryQueue::new(10));
        queue.enqueue(item(Priority::Normal)).await.unwrap();
        let handler = Arc::new(RecordingHandler {
            delay: Duration::from_millis(200),
            ..Default::default()
        });
        let pool = Arc::new(WorkerPool::new(test_config(1, 1), queue.clone(), handler.clone()));

        pool.start().await.unwrap();
        wait_until(|| worker_is_busy(&pool)).await;
        pool.stop().await.unwrap();

        assert_eq!(handler.finished.load(Ordering::SeqCst), 1);
    }

    fn worker_is_busy(pool: &WorkerPool) -> bool {
        pool.counters.busy.load(Ordering::SeqCst) > 0
    }

    // Retry visibility follows the wall clock, so this one runs in real time
    #[tokio::test]
    async fn test_retryable_failure_is_rescheduled() {
        let base: Arc<dyn Queue> = Arc::new(MemoryQueue::new(10));
        let dead_letter: Arc<dyn Queue> = Arc::new(MemoryQueue::new(10));
        let retry = Arc::new(RetryQueue::new(
            base.clone(),
            Some(dead_letter),
            &RetryConfig {
                initial_interval_ms: 10,
                max_interval_ms: 50,
                ..Default::default()
            },
        ));
        base.enqueue(item(Priority::Normal)).await.unwrap();

        let handler = Arc::new(RecordingHandler {
            fail_first: AtomicUsize::new(1),
            ..Default::default()
        });
        let pool = Arc::new(
            WorkerPool::new(test_config(1, 1), base.clone(), handler.clone())
                .with_retry(retry.clone()),
        );
        pool.start().await.unwrap();
        wait_until(|| handler.finished.load(Ordering::SeqCst) == 2).await;
        pool.stop().await.unwrap();

        let handled = handler.handled.lock().clone();
        assert_eq!(handled[0], handled[1]);
        assert_eq!(retry.stats().total_retried, 1);
        assert_eq!(retry.dead_letter_size().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_failure_is_dead_lettered() {
        let base: Arc<dyn Queue> = Arc::new(MemoryQueue::new(10));
        let dead_letter: Arc<dyn Queue> = Arc::new(MemoryQueue::new(10));
        let retry = Arc::new(RetryQueue::new(
            base.clone(),
            Some(dead_letter),
            &RetryConfig::default(),
        ));
        base.enqueue(item(Priority::Normal)).await.unwrap();

        let handler = Arc::new(RecordingHandler {
            fail_first: AtomicUsize::new(1),
            terminal: true,
            ..Default::default()
        });
        let pool = Arc::new(
            WorkerPool::new(test_config(1, 1), base.clone(), handler.clone())
                .with_retry(retry.clone()),
        );
        pool.start().await.unwrap();
        wait_until(|| handler.finished.load(Ordering::SeqCst) == 1).await;
        pool.stop().await.unwrap();

        let dead = retry.dead_letter_items(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].last_error.as_deref().unwrap().contains("bad recipient"));
        assert_eq!(retry.stats().total_retried, 0);
        assert_eq!(pool.stats().await.errors, 1);
    }

    #[rstest]
    #[case(2, 150, 4)]
    #[case(7, 150, 8)]
    #[case(8, 150, 8)]
    #[case(4, 50, 4)]
    #[case(4, 5, 3)]
    #[case(2, 0, 2)]
    fn test_desired_workers(#[case] current: usize, #[case] depth: usize, #[case] expected: usize) {
        let config = WorkerPoolConfig {
            min_workers: 2,
            max_workers: 8,
            scale_up_threshold: 100,
            scale_down_threshold: 10,
            scale_up_step: 2,
            scale_down_step: 1,
            ..Default::default()
        };
        assert_eq!(desired_workers(&config, current, depth), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_autoscale_grows_with_depth() {
        let queue: Arc<dyn Queue> = Arc::new(MemoryQueue::new(100));
        let later = chrono::Utc::now() + chrono::Duration::hours(1);
        for _ in 0..10 {
            queue
                .enqueue(item(Priority::Normal).with_schedule(later))
                .await
                .unwrap();
        }

        let config = WorkerPoolConfig {
            scale_up_threshold: 5,
            scale_down_threshold: 1,
            scale_up_step: 2,
            ..test_config(1, 4)
        };
        let pool = Arc::new(WorkerPool::new(
            config,
            queue.clone(),
            Arc::new(RecordingHandler::default()),
        ));
        pool.start().await.unwrap();

        assert_eq!(pool.autoscale_once().await.unwrap(), 3);
        assert_eq!(pool.autoscale_once().await.unwrap(), 4);
        assert_eq!(pool.autoscale_once().await.unwrap(), 4);

        queue.clear().await.unwrap();
        assert_eq!(pool.autoscale_once().await.unwrap(), 3);
        pool.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_tracks_error_rate() {
        let queue: Arc<dyn Queue> = Arc::new(MemoryQueue::new(10));
        for _ in 0..4 {
            queue.enqueue(item(Priority::Normal)).await.unwrap();
        }
        let handler = Arc::new(RecordingHandler {
            fail_first: AtomicUsize::new(4),
            ..Default::default()
        });
        let pool = Arc::new(WorkerPool::new(test_config(1, 1), queue, handler.clone()));

        assert_eq!(pool.get_health().await.status, PoolHealthStatus::Healthy);

        pool.start().await.unwrap();
        wait_until(|| handler.finished.load(Ordering::SeqCst) == 4).await;
        pool.stop().await.unwrap();

        let health = pool.get_health().await;
        assert_eq!(health.status, PoolHealthStatus::Unhealthy);
        assert_eq!(health.error_rate, 1.0);
        assert!(!health.reasons.is_empty());
    }
}
