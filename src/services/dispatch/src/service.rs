//! # Dispatch Service
//!
//! Wires the queue, retry decorator, dispatcher, receipt aggregator, worker
//! pool and metrics together from a [`DispatchConfig`]. `send` is the
//! synchronous path; `enqueue` hands the message to the worker pool.

use crate::config::{DispatchConfig, PlatformConfig};
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::error::{DispatchError, Result};
use crate::metrics::{AggregateMetricsSnapshot, DispatchMetrics};
use crate::models::Message;
use crate::platform::{SenderCreator, WebhookSender};
use crate::queue::{build_dead_letter_queue, build_queue, Queue, RetryQueue, RetryStats, WorkItem};
use crate::receipt::ReceiptAggregator;
use crate::worker::{ItemHandler, PoolHealth, PoolHealthStatus, PoolStats, WorkerPool};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Worker pool handler that dispatches the queued message
///
/// Queued messages are tracked while platforms report back, so
/// `aggregator().trackers().progress(id)` shows partial progress. The receipt
/// is finalized and stored by the dispatcher. Only platforms that failed
/// outright make the item fail; per-target failures stay in the receipt.
pub struct DispatchHandler {
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
}

impl DispatchHandler {
    pub fn new(dispatcher: Arc<Dispatcher>, cancel: CancellationToken) -> Self {
        Self { dispatcher, cancel }
    }
}

#[async_trait]
impl ItemHandler for DispatchHandler {
    async fn handle(&self, item: &WorkItem) -> Result<()> {
        let outcome = self
            .dispatcher
            .dispatch_tracked(&item.message, &self.cancel)
            .await;
        debug!(
            item_id = %item.id,
            message_id = %item.message.id,
            status = %outcome.receipt.status,
            attempt = item.retry_count,
            "Queued message dispatched"
        );
        match outcome.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Health snapshot across every subsystem
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub status: PoolHealthStatus,
    pub queue_size: usize,
    pub queue_empty: bool,
    pub dead_letter_size: usize,
    pub pool: PoolHealth,
    pub workers: PoolStats,
    pub platforms: HashMap<String, String>,
    pub receipts: AggregateMetricsSnapshot,
    pub retry: RetryStats,
}

pub struct DispatchService {
    config: DispatchConfig,
    queue: Arc<RetryQueue>,
    dispatcher: Arc<Dispatcher>,
    aggregator: Arc<ReceiptAggregator>,
    pool: Arc<WorkerPool>,
    metrics: Option<DispatchMetrics>,
    cancel: CancellationToken,
}

impl DispatchService {
    /// Build every component; webhook platforms get the built-in sender
    pub async fn new(config: DispatchConfig) -> Result<Self> {
        config.validate()?;

        let metrics = if config.metrics.enabled {
            Some(DispatchMetrics::new(&config.metrics)?)
        } else {
            None
        };

        let base = build_queue(&config.queue).await?;
        let dead_letter = build_dead_letter_queue(&config.queue).await?;
        let queue = Arc::new(RetryQueue::new(base, dead_letter, &config.retry));

        let aggregator = Arc::new(ReceiptAggregator::from_config(config.aggregator.clone())?);

        let mut dispatcher = Dispatcher::new(aggregator.clone());
        if let Some(metrics) = &metrics {
            dispatcher = dispatcher.with_metrics(metrics.clone());
        }
        let dispatcher = Arc::new(dispatcher);

        for (name, platform) in &config.platforms {
            if matches!(platform, PlatformConfig::Webhook(_)) {
                dispatcher.register_platform(name, WebhookSender::creator());
            } else {
                debug!(
                    platform = %name,
                    kind = platform.kind(),
                    "No built-in sender for platform kind, waiting for registration"
                );
            }
            dispatcher.configure_platform(name, platform.clone()).await?;
        }

        let cancel = CancellationToken::new();
        let handler = Arc::new(DispatchHandler::new(dispatcher.clone(), cancel.clone()));
        let mut pool = WorkerPool::new(
            config.worker_pool.clone(),
            queue.clone() as Arc<dyn Queue>,
            handler,
        )
        .with_retry(queue.clone());
        if let Some(metrics) = &metrics {
            pool = pool.with_metrics(metrics.clone());
        }

        info!(
            queue = ?config.queue.kind,
            platforms = config.platforms.len(),
            "Dispatch service initialized"
        );

        Ok(Self {
            config,
            queue,
            dispatcher,
            aggregator,
            pool: Arc::new(pool),
            metrics,
            cancel,
        })
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn aggregator(&self) -> &Arc<ReceiptAggregator> {
        &self.aggregator
    }

    pub fn queue(&self) -> &Arc<RetryQueue> {
        &self.queue
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn metrics(&self) -> Option<&DispatchMetrics> {
        self.metrics.as_ref()
    }

    pub fn register_platform(&self, name: &str, creator: SenderCreator) {
        self.dispatcher.register_platform(name, creator);
    }

    pub async fn configure_platform(&self, name: &str, config: PlatformConfig) -> Result<()> {
        self.dispatcher.configure_platform(name, config).await
    }

    /// Dispatch immediately on the caller's task
    pub async fn send(&self, message: &Message) -> DispatchOutcome {
        self.dispatcher.dispatch(message, &self.cancel).await
    }

    /// Queue a message for the worker pool, returning the work item id
    #[instrument(skip(self, message), fields(message_id = %message.id))]
    pub async fn enqueue(&self, message: Message) -> Result<Uuid> {
        message.validate_for_dispatch()?;
        let item = WorkItem::new(message).with_max_retries(self.queue.max_retries());
        let id = item.id;
        self.queue.enqueue(item).await?;

        if let Some(metrics) = &self.metrics {
            if let Ok(depth) = self.queue.size().await {
                metrics.set_queue_depth(depth);
            }
        }
        debug!(item_id = %id, "Message queued");
        Ok(id)
    }

    pub async fn start(&self) -> Result<()> {
        self.pool.start().await?;
        info!("Dispatch service started");
        Ok(())
    }

    /// Drain the pool, then cancel in-flight sends and release every resource
    pub async fn stop(&self) -> Result<()> {
        self.pool.stop().await?;
        self.cancel.cancel();

        let mut first_error: Option<DispatchError> = None;
        if let Err(e) = self.dispatcher.close().await {
            warn!(error = %e, "Failed to close some platform senders");
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.queue.close().await {
            warn!(error = %e, "Failed to close queue");
            first_error.get_or_insert(e);
        }

        info!("Dispatch service stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn health(&self) -> ServiceHealth {
        let pool = self.pool.get_health().await;
        let workers = self.pool.stats().await;
        let platforms = self.dispatcher.health().await;
        let queue_size = self.queue.size().await.unwrap_or(0);
        let dead_letter_size = self.queue.dead_letter_size().await.unwrap_or(0);

        let mut status = pool.status;
        if status == PoolHealthStatus::Healthy && platforms.values().any(|s| s != "healthy") {
            status = PoolHealthStatus::Degraded;
        }

        ServiceHealth {
            status,
            queue_size,
            queue_empty: queue_size == 0,
            dead_letter_size,
            pool,
            workers,
            platforms,
            receipts: self.aggregator.metrics(),
            retry: self.queue.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebhookPlatformConfig;
    use crate::models::{Capabilities, MessageFormat, SendResult, Target};
    use crate::platform::{creator, Sender};
    use crate::receipt::ReceiptStatus;
    use std::time::{Duration, Instant};
    use tokio::sync::Notify;

    /// Holds every send until the test releases it
    struct GatedSender {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl Sender for GatedSender {
        fn name(&self) -> &str {
            "gated"
        }

        async fn send(&self, _message: &Message, targets: &[Target]) -> Result<Vec<SendResult>> {
            self.gate.notified().await;
            Ok(targets
                .iter()
                .map(|t| SendResult::success(t.clone(), None))
                .collect())
        }

        fn validate_target(&self, _target: &Target) -> Result<()> {
            Ok(())
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                name: "gated".to_string(),
                supported_target_types: vec!["user".to_string()],
                supported_formats: vec![MessageFormat::Text],
                max_message_size: 1024,
                supports_scheduling: false,
                supports_attachments: false,
                supports_rich_content: false,
            }
        }

        async fn is_healthy(&self) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(url: Option<String>) -> DispatchConfig {
        let mut config = DispatchConfig::default();
        config.worker_pool.min_workers = 1;
        config.worker_pool.max_workers = 2;
        config.worker_pool.autoscale_enabled = false;
        config.worker_pool.poll_interval_ms = 5;
        config.metrics.enabled = false;
        if let Some(url) = url {
            config.platforms.insert(
                "hooks".to_string(),
                PlatformConfig::Webhook(WebhookPlatformConfig {
                    url,
                    timeout_ms: 2_000,
                    headers: HashMap::new(),
                    user_agent: "dispatch-test".to_string(),
                }),
            );
        }
        config
    }

    fn message() -> Message {
        Message::new("Deploy finished", "build 42 is live")
            .with_target(Target::new("channel", "ops", "hooks"))
            .with_target(Target::new("user", "alice", "hooks"))
    }

    #[tokio::test]
    async fn test_send_through_webhook() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;

        let service = DispatchService::new(test_config(Some(server.uri())))
            .await
            .unwrap();
        let outcome = service.send(&message()).await;

        assert!(outcome.error.is_none());
        assert_eq!(outcome.receipt.status, ReceiptStatus::Completed);
        assert_eq!(outcome.receipt.successful, 2);
        assert_eq!(service.health().await.platforms["hooks"], "healthy");
    }

    #[tokio::test]
    async fn test_enqueue_is_processed_by_pool() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let service = DispatchService::new(test_config(Some(server.uri())))
            .await
            .unwrap();
        let message = message();
        let message_id = message.id.clone();

        service.start().await.unwrap();
        service.enqueue(message).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let receipt = loop {
            if let Some(receipt) = service.aggregator().get(&message_id).await.unwrap() {
                break receipt;
            }
            assert!(Instant::now() < deadline, "receipt never stored");
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        service.stop().await.unwrap();

        assert_eq!(receipt.status, ReceiptStatus::Completed);
        assert_eq!(service.health().await.queue_size, 0);
    }

    #[tokio::test]
    async fn test_queued_message_progress_is_tracked() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let service = DispatchService::new(test_config(Some(server.uri())))
            .await
            .unwrap();
        let gate = Arc::new(Notify::new());
        let sender_gate = gate.clone();
        service.register_platform(
            "gated",
            creator(move |_, _| {
                Ok(Arc::new(GatedSender {
                    gate: sender_gate.clone(),
                }) as Arc<dyn Sender>)
            }),
        );
        service
            .configure_platform(
                "gated",
                PlatformConfig::Webhook(WebhookPlatformConfig {
                    url: "http://localhost/unused".to_string(),
                    timeout_ms: 1_000,
                    headers: HashMap::new(),
                    user_agent: "dispatch-test".to_string(),
                }),
            )
            .await
            .unwrap();

        let message = message().with_target(Target::new("user", "bob", "gated"));
        let message_id = message.id.clone();
        service.start().await.unwrap();
        service.enqueue(message).await.unwrap();

        let trackers = service.aggregator().trackers();
        wait_for(|| {
            trackers
                .progress(&message_id)
                .map_or(false, |p| p.processed == 2)
        })
        .await;
        let partial = trackers.progress(&message_id).unwrap();
        assert_eq!(partial.total, 3);
        assert!(!partial.complete);

        gate.notify_one();
        let deadline = Instant::now() + Duration::from_secs(5);
        let receipt = loop {
            if let Some(receipt) = service.aggregator().get(&message_id).await.unwrap() {
                break receipt;
            }
            assert!(Instant::now() < deadline, "receipt never stored");
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        service.stop().await.unwrap();

        assert_eq!(receipt.status, ReceiptStatus::Completed);
        assert_eq!(receipt.total, 3);
        assert!(trackers.progress(&message_id).is_none());
    }

    #[tokio::test]
    async fn test_enqueue_rejects_invalid_message() {
        let service = DispatchService::new(test_config(None)).await.unwrap();
        let result = service.enqueue(Message::new("t", "b")).await;
        assert!(matches!(result, Err(DispatchError::Validation { .. })));
        assert_eq!(service.queue().size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unregistered_platform_fails_fast() {
        let service = DispatchService::new(test_config(None)).await.unwrap();
        let outcome = service.send(&message()).await;
        assert!(matches!(
            outcome.error,
            Some(DispatchError::PlatformNotRegistered { .. })
        ));
        assert_eq!(outcome.receipt.status, ReceiptStatus::Failed);
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let service = DispatchService::new(test_config(None)).await.unwrap();
        assert!(matches!(service.stop().await, Err(DispatchError::NotRunning { .. })));
        service.start().await.unwrap();
        assert!(matches!(
            service.start().await,
            Err(DispatchError::AlreadyRunning { .. })
        ));
        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = test_config(None);
        config.queue.capacity = 0;
        assert!(matches!(
            DispatchService::new(config).await,
            Err(DispatchError::Config { .. })
        ));
    }
}
