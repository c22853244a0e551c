//! Metrics collection for the dispatch service
//!
//! Two layers live here:
//! - [`DispatchMetrics`], a Prometheus registry covering platform sends,
//!   dispatch outcomes, queue depth and worker counts
//! - [`AggregateMetrics`], lock-free counters for receipt processing with a
//!   moving-average processing time

use crate::config::MetricsConfig;
use crate::error::{DispatchError, Result};
use crate::receipt::ReceiptStatus;
use parking_lot::Mutex;
use prometheus::core::Collector;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Weight of the newest sample in the processing-time moving average
const MOVING_AVERAGE_ALPHA: f64 = 0.1;

fn register<C>(registry: &Registry, collector: C, name: &str) -> Result<C>
where
    C: Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| DispatchError::internal(format!("Failed to register {}: {}", name, e)))?;
    Ok(collector)
}

/// Prometheus metrics for the dispatch pipeline
#[derive(Clone)]
pub struct DispatchMetrics {
    registry: Arc<Registry>,
    platform_sends: IntCounterVec,
    send_duration: HistogramVec,
    dispatches: IntCounterVec,
    queue_depth: IntGauge,
    workers: IntGaugeVec,
}

impl DispatchMetrics {
    pub fn new(config: &MetricsConfig) -> Result<Self> {
        let registry = Registry::new();

        let platform_sends = IntCounterVec::new(
            Opts::new("platform_sends_total", "Platform send calls by outcome")
                .namespace(&config.namespace),
            &["platform", "outcome"],
        )
        .map_err(|e| DispatchError::internal(format!("Failed to create platform_sends: {}", e)))?;

        let send_duration = HistogramVec::new(
            HistogramOpts::new(
                "platform_send_duration_seconds",
                "Latency of platform send calls",
            )
            .namespace(&config.namespace)
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["platform"],
        )
        .map_err(|e| DispatchError::internal(format!("Failed to create send_duration: {}", e)))?;

        let dispatches = IntCounterVec::new(
            Opts::new("dispatches_total", "Dispatched messages by receipt status")
                .namespace(&config.namespace),
            &["status"],
        )
        .map_err(|e| DispatchError::internal(format!("Failed to create dispatches: {}", e)))?;

        let queue_depth = IntGauge::with_opts(
            Opts::new("queue_depth", "Items currently stored in the work queue")
                .namespace(&config.namespace),
        )
        .map_err(|e| DispatchError::internal(format!("Failed to create queue_depth: {}", e)))?;

        let workers = IntGaugeVec::new(
            Opts::new("workers", "Worker pool members by state").namespace(&config.namespace),
            &["state"],
        )
        .map_err(|e| DispatchError::internal(format!("Failed to create workers: {}", e)))?;

        let platform_sends = register(&registry, platform_sends, "platform_sends")?;
        let send_duration = register(&registry, send_duration, "send_duration")?;
        let dispatches = register(&registry, dispatches, "dispatches")?;
        let queue_depth = register(&registry, queue_depth, "queue_depth")?;
        let workers = register(&registry, workers, "workers")?;

        info!(namespace = %config.namespace, "Dispatch metrics initialized");

        Ok(Self {
            registry: Arc::new(registry),
            platform_sends,
            send_duration,
            dispatches,
            queue_depth,
            workers,
        })
    }

    pub fn record_platform_send(&self, platform: &str, success: bool, duration: Duration) {
        let outcome = if success { "success" } else { "failure" };
        self.platform_sends
            .with_label_values(&[platform, outcome])
            .inc();
        self.send_duration
            .with_label_values(&[platform])
            .observe(duration.as_secs_f64());
    }

    pub fn record_dispatch(&self, status: ReceiptStatus) {
        self.dispatches.with_label_values(&[status.as_str()]).inc();
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }

    pub fn set_workers(&self, active: usize, idle: usize) {
        self.workers.with_label_values(&["active"]).set(active as i64);
        self.workers.with_label_values(&["idle"]).set(idle as i64);
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Export metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = prometheus::TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .map_err(|e| DispatchError::internal(format!("Failed to encode metrics: {}", e)))
    }
}

/// Receipt-level counters
#[derive(Debug, Default)]
pub struct AggregateMetrics {
    processed: AtomicU64,
    errors: AtomicU64,
    partial_failures: AtomicU64,
    avg_processing_ms: Mutex<Option<f64>>,
}

/// Point-in-time copy of [`AggregateMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateMetricsSnapshot {
    pub processed: u64,
    pub errors: u64,
    pub partial_failures: u64,
    pub avg_processing_time_ms: f64,
}

impl AggregateMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finalized receipt
    pub fn record(&self, status: ReceiptStatus, processing_time: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        match status {
            ReceiptStatus::Failed => {
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
            ReceiptStatus::PartialFailed => {
                self.partial_failures.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }

        let sample = processing_time.as_secs_f64() * 1_000.0;
        let mut avg = self.avg_processing_ms.lock();
        *avg = Some(match *avg {
            Some(current) => current + MOVING_AVERAGE_ALPHA * (sample - current),
            None => sample,
        });
    }

    /// Record a processing error not tied to a receipt status
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AggregateMetricsSnapshot {
        AggregateMetricsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            partial_failures: self.partial_failures.load(Ordering::Relaxed),
            avg_processing_time_ms: self.avg_processing_ms.lock().unwrap_or(0.0),
        }
    }
}
