//! # Dispatcher
//!
//! Fans one message out to every platform named by its targets. Each distinct
//! platform gets its own task; the platform's sender is built lazily from the
//! creator registered on this dispatcher instance and cached for later calls.
//! Every completed send updates that platform's health record, which feeds the
//! routing weight.

use crate::config::PlatformConfig;
use crate::error::{DispatchError, Result};
use crate::metrics::DispatchMetrics;
use crate::models::{Message, SendResult, Target};
use crate::platform::{Sender, SenderCreator};
use crate::receipt::{PlatformResult, Receipt, ReceiptAggregator, ReceiptStatus};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Most recent observed state of one platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformHealth {
    pub platform: String,
    pub healthy: bool,
    pub last_error: Option<String>,
    pub last_latency: Duration,
    pub last_checked: DateTime<Utc>,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
}

impl PlatformHealth {
    fn new(platform: &str) -> Self {
        Self {
            platform: platform.to_string(),
            healthy: true,
            last_error: None,
            last_latency: Duration::ZERO,
            last_checked: Utc::now(),
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
        }
    }

    fn record(&mut self, success: bool, latency: Duration, error: Option<String>) {
        self.healthy = success;
        self.last_error = error;
        self.last_latency = latency;
        self.last_checked = Utc::now();
        if success {
            self.success_count += 1;
            self.consecutive_failures = 0;
        } else {
            self.failure_count += 1;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }
    }

    /// Zero when the latest outcome failed, otherwise shrinking with latency
    pub fn routing_weight(&self) -> f64 {
        if !self.healthy {
            return 0.0;
        }
        1.0 / (1.0 + self.last_latency.as_secs_f64())
    }
}

/// Receipt of a dispatch plus the error raised by any platform that failed outright
#[derive(Debug)]
pub struct DispatchOutcome {
    pub receipt: Receipt,
    pub error: Option<DispatchError>,
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.receipt.failed == 0
    }

    /// Drop the partial receipt when a platform errored
    pub fn into_result(self) -> Result<Receipt> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.receipt),
        }
    }
}

struct PlatformOutcome {
    platform: String,
    targets: Vec<Target>,
    result: Result<Vec<SendResult>>,
    elapsed: Duration,
    /// Whether a sender was resolved and actually called
    attempted: bool,
}

/// Platform router with an instance-scoped sender registry
pub struct Dispatcher {
    creators: RwLock<HashMap<String, SenderCreator>>,
    configs: RwLock<HashMap<String, PlatformConfig>>,
    senders: tokio::sync::RwLock<HashMap<String, Arc<dyn Sender>>>,
    health: DashMap<String, PlatformHealth>,
    aggregator: Arc<ReceiptAggregator>,
    metrics: Option<DispatchMetrics>,
}

impl Dispatcher {
    pub fn new(aggregator: Arc<ReceiptAggregator>) -> Self {
        Self {
            creators: RwLock::new(HashMap::new()),
            configs: RwLock::new(HashMap::new()),
            senders: tokio::sync::RwLock::new(HashMap::new()),
            health: DashMap::new(),
            aggregator,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: DispatchMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn aggregator(&self) -> &Arc<ReceiptAggregator> {
        &self.aggregator
    }

    /// Register the creator for a platform; re-registering overwrites
    pub fn register_platform(&self, name: &str, creator: SenderCreator) {
        let replaced = self
            .creators
            .write()
            .insert(name.to_string(), creator)
            .is_some();
        debug!(platform = name, replaced, "Registered platform creator");
    }

    /// Set a platform's configuration, dropping any sender built from the old one
    pub async fn configure_platform(&self, name: &str, config: PlatformConfig) -> Result<()> {
        config.validate(name)?;
        self.configs.write().insert(name.to_string(), config);

        let previous = self.senders.write().await.remove(name);
        if let Some(sender) = previous {
            if let Err(e) = sender.close().await {
                warn!(platform = name, error = %e, "Failed to close replaced sender");
            }
        }
        Ok(())
    }

    pub fn registered_platforms(&self) -> Vec<String> {
        let mut names: Vec<String> = self.creators.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Cached sender for `platform`, built on first use
    pub async fn get_sender(&self, platform: &str) -> Result<Arc<dyn Sender>> {
        if let Some(sender) = self.senders.read().await.get(platform) {
            return Ok(sender.clone());
        }

        let creator = self
            .creators
            .read()
            .get(platform)
            .cloned()
            .ok_or_else(|| DispatchError::platform_not_registered(platform))?;
        let config = self
            .configs
            .read()
            .get(platform)
            .cloned()
            .ok_or_else(|| DispatchError::platform_not_configured(platform))?;

        let mut senders = self.senders.write().await;
        if let Some(sender) = senders.get(platform) {
            return Ok(sender.clone());
        }

        let sender = creator(platform, &config)?;
        senders.insert(platform.to_string(), sender.clone());
        info!(platform, kind = config.kind(), "Created platform sender");
        Ok(sender)
    }

    /// Send `message` to every platform its targets name, concurrently
    ///
    /// Always returns a receipt. The outcome carries an error only when some
    /// platform failed outright; results gathered before `cancel` fires are
    /// kept.
    pub async fn dispatch(
        self: &Arc<Self>,
        message: &Message,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        self.run_dispatch(message, cancel, false).await
    }

    /// Like [`Dispatcher::dispatch`], but keeps a receipt tracker for the
    /// message that is updated as each platform reports back
    pub async fn dispatch_tracked(
        self: &Arc<Self>,
        message: &Message,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        self.run_dispatch(message, cancel, true).await
    }

    #[instrument(skip(self, message, cancel), fields(message_id = %message.id))]
    async fn run_dispatch(
        self: &Arc<Self>,
        message: &Message,
        cancel: &CancellationToken,
        tracked: bool,
    ) -> DispatchOutcome {
        if let Err(e) = message.validate_for_dispatch() {
            warn!(error = %e, "Rejected message before dispatch");
            let receipt = self.aggregator.record_rejected(&message.id, &e).await;
            if let Some(metrics) = &self.metrics {
                metrics.record_dispatch(receipt.status);
            }
            return DispatchOutcome {
                receipt,
                error: Some(e),
            };
        }

        if tracked {
            self.aggregator
                .trackers()
                .start(&message.id, message.targets.len());
        }

        let shared = Arc::new(message.clone());
        let mut pending = FuturesUnordered::new();

        for (index, (platform, targets)) in message.targets_by_platform().into_iter().enumerate() {
            let this = Arc::clone(self);
            let message = Arc::clone(&shared);
            let cancel = cancel.clone();
            let fallback = (platform.clone(), targets.clone());
            let handle = tokio::spawn(async move {
                this.send_to_platform(platform, targets, message, cancel)
                    .await
            });
            pending.push(async move { (index, fallback, handle.await) });
        }

        let mut results: Vec<PlatformResult> = Vec::with_capacity(message.targets.len());
        let mut errors: Vec<(usize, String, DispatchError)> = Vec::new();

        while let Some((index, (platform, targets), joined)) = pending.next().await {
            let outcome = joined.unwrap_or_else(|e| {
                error!(platform = %platform, error = %e, "Platform task panicked");
                PlatformOutcome {
                    platform: platform.clone(),
                    targets,
                    result: Err(DispatchError::internal(format!("platform task failed: {}", e))),
                    elapsed: Duration::ZERO,
                    attempted: false,
                }
            });

            let (platform_results, error) = self.fold_outcome(outcome);
            if tracked {
                for result in &platform_results {
                    if let Err(e) = self.aggregator.trackers().record(&message.id, result.clone()) {
                        warn!(platform = %platform, error = %e, "Failed to update receipt tracker");
                    }
                }
            }
            results.extend(platform_results);
            if let Some(error) = error {
                errors.push((index, platform, error));
            }
        }

        errors.sort_by_key(|(index, _, _)| *index);
        let mut errors: Vec<(String, DispatchError)> =
            errors.into_iter().map(|(_, p, e)| (p, e)).collect();
        let error = match errors.len() {
            0 => None,
            1 => errors.pop().map(|(_, e)| e),
            _ => Some(DispatchError::PlatformFailures { failures: errors }),
        };
        let error_text = error.as_ref().map(|e| e.to_string());

        let tracked_receipt = if tracked {
            match self
                .aggregator
                .complete_tracking(&message.id, error_text.clone())
                .await
            {
                Ok(receipt) => Some(receipt),
                Err(e) => {
                    warn!(error = %e, "Receipt tracker missing, building receipt directly");
                    None
                }
            }
        } else {
            None
        };

        let receipt = match tracked_receipt {
            Some(receipt) => receipt,
            None => {
                let mut receipt = Receipt::new(message.id.clone());
                receipt.status = ReceiptStatus::Processing;
                for result in results {
                    receipt.add_result(result);
                }
                receipt.error = error_text;
                let receipt = self.aggregator.finalize(receipt);
                // Storage failures are logged by the aggregator and do not change the outcome
                let _ = self.aggregator.persist(&receipt).await;
                receipt
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_dispatch(receipt.status);
        }

        info!(
            status = %receipt.status,
            successful = receipt.successful,
            failed = receipt.failed,
            total = receipt.total,
            "Dispatch finished"
        );

        DispatchOutcome { receipt, error }
    }

    async fn send_to_platform(
        &self,
        platform: String,
        targets: Vec<Target>,
        message: Arc<Message>,
        cancel: CancellationToken,
    ) -> PlatformOutcome {
        let sender = match self.get_sender(&platform).await {
            Ok(sender) => sender,
            Err(e) => {
                error!(platform = %platform, error = %e, "Platform sender unavailable");
                return PlatformOutcome {
                    platform,
                    targets,
                    result: Err(e),
                    elapsed: Duration::ZERO,
                    attempted: false,
                };
            }
        };

        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DispatchError::cancelled(format!("send to {}", platform))),
            result = sender.send(&message, &targets) => result,
        };
        let elapsed = started.elapsed();

        PlatformOutcome {
            platform,
            targets,
            result,
            elapsed,
            attempted: true,
        }
    }

    /// One receipt result per target, plus the platform's outright error
    ///
    /// Each sender result is consumed by the first target it matches, so
    /// repeated targets each keep their own outcome.
    fn fold_outcome(&self, outcome: PlatformOutcome) -> (Vec<PlatformResult>, Option<DispatchError>) {
        let PlatformOutcome {
            platform,
            targets,
            result,
            elapsed,
            attempted,
        } = outcome;

        match result {
            Ok(results) => {
                let mut remaining: Vec<Option<SendResult>> = results.into_iter().map(Some).collect();
                let folded = targets
                    .iter()
                    .map(|target| {
                        let matched = remaining
                            .iter_mut()
                            .find(|slot| slot.as_ref().is_some_and(|r| r.target == *target))
                            .and_then(Option::take);
                        match matched {
                            Some(result) => PlatformResult::from_send_result(&platform, &result),
                            None => PlatformResult::failure(
                                platform.as_str(),
                                target.value.as_str(),
                                "no result reported by sender",
                            ),
                        }
                    })
                    .collect();
                self.record_health(&platform, true, elapsed, None);
                (folded, None)
            }
            Err(e) => {
                warn!(platform = %platform, error = %e, "Platform failed outright");
                let message = e.to_string();
                let folded = targets
                    .iter()
                    .map(|target| {
                        PlatformResult::failure(
                            platform.as_str(),
                            target.value.as_str(),
                            message.as_str(),
                        )
                    })
                    .collect();
                if attempted && !matches!(e, DispatchError::Cancelled { .. }) {
                    self.record_health(&platform, false, elapsed, Some(message));
                }
                (folded, Some(e))
            }
        }
    }

    fn record_health(&self, platform: &str, success: bool, latency: Duration, error: Option<String>) {
        self.health
            .entry(platform.to_string())
            .or_insert_with(|| PlatformHealth::new(platform))
            .record(success, latency, error);

        if let Some(metrics) = &self.metrics {
            metrics.record_platform_send(platform, success, latency);
        }
    }

    /// Check every constructed sender; never-built platforms are absent
    pub async fn health(&self) -> HashMap<String, String> {
        let senders: Vec<(String, Arc<dyn Sender>)> = self
            .senders
            .read()
            .await
            .iter()
            .map(|(name, sender)| (name.clone(), sender.clone()))
            .collect();

        let mut report = HashMap::with_capacity(senders.len());
        for (name, sender) in senders {
            let started = Instant::now();
            let status = match sender.is_healthy().await {
                Ok(()) => {
                    self.mark_checked(&name, true, started.elapsed(), None);
                    "healthy".to_string()
                }
                Err(e) => {
                    self.mark_checked(&name, false, started.elapsed(), Some(e.to_string()));
                    format!("unhealthy: {}", e)
                }
            };
            report.insert(name, status);
        }
        report
    }

    fn mark_checked(&self, platform: &str, healthy: bool, latency: Duration, error: Option<String>) {
        let mut entry = self
            .health
            .entry(platform.to_string())
            .or_insert_with(|| PlatformHealth::new(platform));
        entry.healthy = healthy;
        entry.last_error = error;
        entry.last_latency = latency;
        entry.last_checked = Utc::now();
    }

    pub fn platform_health(&self, platform: &str) -> Option<PlatformHealth> {
        self.health.get(platform).map(|h| h.clone())
    }

    pub fn health_snapshot(&self) -> HashMap<String, PlatformHealth> {
        self.health
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Routing weight from the latest outcome; unknown platforms weigh 1.0
    pub fn routing_weight(&self, platform: &str) -> f64 {
        self.health
            .get(platform)
            .map(|h| h.routing_weight())
            .unwrap_or(1.0)
    }

    /// Close every cached sender, returning the last error after trying them all
    pub async fn close(&self) -> Result<()> {
        let senders: Vec<(String, Arc<dyn Sender>)> =
            self.senders.write().await.drain().collect();

        let mut last_error = None;
        for (name, sender) in senders {
            if let Err(e) = sender.close().await {
                error!(platform = %name, error = %e, "Failed to close sender");
                last_error = Some(e);
            }
        }
        self.health.clear();

        info!("Dispatcher closed");
        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
