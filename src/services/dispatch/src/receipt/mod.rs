//! Delivery receipts and their aggregation
//!
//! A [`Receipt`] folds every per-target outcome of one dispatch into a single
//! record with an overall [`ReceiptStatus`]. The [`ReceiptAggregator`] owns the
//! status policy, the receipt store, failure analytics and the trackers used
//! for asynchronous dispatches.

pub mod analytics;
pub mod store;
pub mod tracker;

pub use analytics::{FailureAnalysis, FailureCategory};
pub use store::{
    FileReceiptPersistence, MemoryReceiptPersistence, ReceiptFilter, ReceiptPersistence,
    ReceiptStore,
};
pub use tracker::{AsyncReceiptTracker, ReceiptTrackers, TrackerProgress};

use crate::config::{AggregatorConfig, PersistenceKind};
use crate::error::{DispatchError, Result};
use crate::metrics::{AggregateMetrics, AggregateMetricsSnapshot};
use crate::models::SendResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Overall delivery status of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Pending,
    Processing,
    Completed,
    PartialFailed,
    Failed,
}

impl ReceiptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptStatus::Pending => "pending",
            ReceiptStatus::Processing => "processing",
            ReceiptStatus::Completed => "completed",
            ReceiptStatus::PartialFailed => "partial_failed",
            ReceiptStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReceiptStatus::Completed | ReceiptStatus::PartialFailed | ReceiptStatus::Failed
        )
    }
}

impl fmt::Display for ReceiptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReceiptStatus {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ReceiptStatus::Pending),
            "processing" => Ok(ReceiptStatus::Processing),
            "completed" => Ok(ReceiptStatus::Completed),
            "partial_failed" => Ok(ReceiptStatus::PartialFailed),
            "failed" => Ok(ReceiptStatus::Failed),
            other => Err(DispatchError::validation(
                "status",
                format!("unknown receipt status '{}'", other),
            )),
        }
    }
}

/// Receipt-level view of one target's outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformResult {
    pub platform: String,
    pub target: String,
    pub success: bool,
    pub message_id: Option<String>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub duration: Duration,
}

impl PlatformResult {
    pub fn from_send_result(platform: &str, result: &SendResult) -> Self {
        Self {
            platform: platform.to_string(),
            target: result.target.value.clone(),
            success: result.success,
            message_id: result.message_id.clone(),
            error: result.error.clone(),
            timestamp: result.timestamp,
            duration: result.duration,
        }
    }

    pub fn failure<P: Into<String>, T: Into<String>, E: Into<String>>(
        platform: P,
        target: T,
        error: E,
    ) -> Self {
        Self {
            platform: platform.into(),
            target: target.into(),
            success: false,
            message_id: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
            duration: Duration::ZERO,
        }
    }
}

/// Aggregated outcome of one dispatched message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub message_id: String,
    pub status: ReceiptStatus,
    pub results: Vec<PlatformResult>,
    pub successful: usize,
    pub failed: usize,
    pub total: usize,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Receipt {
    pub fn new<S: Into<String>>(message_id: S) -> Self {
        Self {
            message_id: message_id.into(),
            status: ReceiptStatus::Pending,
            results: Vec::new(),
            successful: 0,
            failed: 0,
            total: 0,
            created_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    /// Append a result, keeping `total == successful + failed`
    pub fn add_result(&mut self, result: PlatformResult) {
        if result.success {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
        self.total += 1;
        self.results.push(result);
    }

    /// Recompute counts from the result list
    pub fn recount(&mut self) {
        self.successful = self.results.iter().filter(|r| r.success).count();
        self.failed = self.results.len() - self.successful;
        self.total = self.results.len();
    }

    pub fn platforms(&self) -> BTreeSet<&str> {
        self.results.iter().map(|r| r.platform.as_str()).collect()
    }

    pub fn results_for<'a>(&'a self, platform: &'a str) -> impl Iterator<Item = &'a PlatformResult> {
        self.results.iter().filter(move |r| r.platform == platform)
    }

    pub fn failed_results(&self) -> impl Iterator<Item = &PlatformResult> {
        self.results.iter().filter(|r| !r.success)
    }

    /// Time from creation to completion, or to now if still open
    pub fn processing_time(&self) -> Duration {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - self.created_at).to_std().unwrap_or_default()
    }
}

/// Overall status from counts under a partial-failure policy
///
/// Completed when nothing failed; Failed when nothing succeeded. Otherwise a
/// failure count within `tolerance` is still Completed, a failure ratio at or
/// above `threshold` is Failed and anything else is PartialFailed.
pub fn calculate_status(
    total: usize,
    successful: usize,
    failed: usize,
    threshold: f64,
    tolerance: usize,
) -> ReceiptStatus {
    if failed == 0 {
        return ReceiptStatus::Completed;
    }
    if successful == 0 {
        return ReceiptStatus::Failed;
    }
    if failed <= tolerance {
        return ReceiptStatus::Completed;
    }
    let ratio = failed as f64 / total.max(1) as f64;
    if ratio >= threshold {
        ReceiptStatus::Failed
    } else {
        ReceiptStatus::PartialFailed
    }
}

/// True only if every required platform appears and all of its results succeeded
pub fn check_required_platforms<S: AsRef<str>>(receipt: &Receipt, required: &[S]) -> bool {
    required.iter().all(|platform| {
        let mut results = receipt.results_for(platform.as_ref()).peekable();
        results.peek().is_some() && results.all(|r| r.success)
    })
}

/// Outcome of a batch ingestion
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub stored: usize,
    pub failed: Vec<String>,
}

/// Receipt status policy, storage, analytics and progress tracking
pub struct ReceiptAggregator {
    config: AggregatorConfig,
    store: Arc<ReceiptStore>,
    trackers: ReceiptTrackers,
    metrics: AggregateMetrics,
}

impl ReceiptAggregator {
    pub fn new(config: AggregatorConfig, store: Arc<ReceiptStore>) -> Self {
        Self {
            config,
            store,
            trackers: ReceiptTrackers::new(),
            metrics: AggregateMetrics::new(),
        }
    }

    /// Build the aggregator and its store from configuration
    pub fn from_config(config: AggregatorConfig) -> Result<Self> {
        let persistence: Option<Arc<dyn ReceiptPersistence>> = match config.persistence.kind {
            PersistenceKind::None => None,
            PersistenceKind::Memory => Some(Arc::new(MemoryReceiptPersistence::new())),
            PersistenceKind::File => {
                let path = config.persistence.path.clone().ok_or_else(|| {
                    DispatchError::config("persistence path is required for file persistence")
                })?;
                Some(Arc::new(FileReceiptPersistence::new(path)))
            }
        };
        let store = Arc::new(ReceiptStore::new(config.max_memory_receipts, persistence));
        Ok(Self::new(config, store))
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ReceiptStore> {
        &self.store
    }

    pub fn calculate_overall_status(&self, receipt: &Receipt) -> ReceiptStatus {
        calculate_status(
            receipt.total,
            receipt.successful,
            receipt.failed,
            self.config.partial_failure_threshold,
            self.config.failure_tolerance,
        )
    }

    pub fn check_required_platforms<S: AsRef<str>>(&self, receipt: &Receipt, required: &[S]) -> bool {
        check_required_platforms(receipt, required)
    }

    /// Recount, set status and completion time, and record metrics
    pub fn finalize(&self, mut receipt: Receipt) -> Receipt {
        receipt.recount();
        receipt.status = self.calculate_overall_status(&receipt);
        receipt.completed_at = Some(Utc::now());
        self.metrics
            .record(receipt.status, receipt.processing_time());

        debug!(
            message_id = %receipt.message_id,
            status = %receipt.status,
            successful = receipt.successful,
            failed = receipt.failed,
            "Receipt finalized"
        );
        receipt
    }

    /// Store an already finalized receipt
    pub async fn persist(&self, receipt: &Receipt) -> Result<()> {
        if let Err(e) = self.store.store(receipt.clone()).await {
            self.metrics.record_error();
            warn!(message_id = %receipt.message_id, error = %e, "Failed to store receipt");
            return Err(e);
        }
        Ok(())
    }

    /// Finalize and store a receipt
    pub async fn process(&self, receipt: Receipt) -> Result<Receipt> {
        let receipt = self.finalize(receipt);
        self.persist(&receipt).await?;
        Ok(receipt)
    }

    /// Finalize and store many receipts, reporting which ones could not be stored
    pub async fn process_batch(&self, receipts: Vec<Receipt>) -> Result<BatchSummary> {
        let finalized: Vec<Receipt> = receipts.into_iter().map(|r| self.finalize(r)).collect();
        let mut summary = BatchSummary::default();

        match self.store.store_batch(finalized.clone()).await {
            Ok(()) => summary.stored = finalized.len(),
            Err(e) => {
                warn!(error = %e, "Batch store failed, storing receipts individually");
                for receipt in finalized {
                    let message_id = receipt.message_id.clone();
                    match self.store.store(receipt).await {
                        Ok(()) => summary.stored += 1,
                        Err(_) => {
                            self.metrics.record_error();
                            summary.failed.push(message_id);
                        }
                    }
                }
            }
        }
        Ok(summary)
    }

    pub async fn get(&self, message_id: &str) -> Result<Option<Receipt>> {
        self.store.get(message_id).await
    }

    pub async fn query(&self, filter: &ReceiptFilter) -> Result<Vec<Receipt>> {
        self.store.query(filter).await
    }

    /// Failure breakdown over stored receipts matching `filter`
    pub async fn analyze_failures(&self, filter: &ReceiptFilter) -> Result<FailureAnalysis> {
        let receipts = self.store.query(filter).await?;
        Ok(FailureAnalysis::from_receipts(&receipts))
    }

    pub fn serialize(&self, receipt: &Receipt) -> Result<Vec<u8>> {
        serialize_receipt(receipt)
    }

    pub fn deserialize(&self, bytes: &[u8]) -> Result<Receipt> {
        deserialize_receipt(bytes)
    }

    pub fn trackers(&self) -> &ReceiptTrackers {
        &self.trackers
    }

    /// Finalize an in-flight tracker and store the resulting receipt
    ///
    /// `error` is attached to the receipt when set. Only a missing tracker is
    /// an error; storage failures are logged and counted by `persist`.
    pub async fn complete_tracking(
        &self,
        message_id: &str,
        error: Option<String>,
    ) -> Result<Receipt> {
        let mut receipt = self.trackers.finalize(message_id)?;
        if error.is_some() {
            receipt.error = error;
        }
        let receipt = self.finalize(receipt);
        let _ = self.persist(&receipt).await;
        Ok(receipt)
    }

    /// Store a failed receipt for a message rejected before any platform was tried
    pub async fn record_rejected(&self, message_id: &str, error: &DispatchError) -> Receipt {
        let mut receipt = Receipt::new(message_id);
        receipt.status = ReceiptStatus::Failed;
        receipt.error = Some(error.to_string());
        receipt.completed_at = Some(Utc::now());
        self.metrics
            .record(receipt.status, receipt.processing_time());

        let _ = self.persist(&receipt).await;
        receipt
    }

    pub fn metrics(&self) -> AggregateMetricsSnapshot {
        self.metrics.snapshot()
    }
}

pub fn serialize_receipt(receipt: &Receipt) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(receipt)?)
}

pub fn deserialize_receipt(bytes: &[u8]) -> Result<Receipt> {
    Ok(serde_json::from_slice(bytes)?)
}

/// One JSON document per line
pub fn export_json_lines(receipts: &[Receipt]) -> Result<String> {
    let mut out = String::new();
    for receipt in receipts {
        out.push_str(&serde_json::to_string(receipt)?);
        out.push('\n');
    }
    Ok(out)
}

/// Accepts JSON lines or a single JSON array
pub fn import_json_lines(input: &str) -> Result<Vec<Receipt>> {
    let trimmed = input.trim_start();
    if trimmed.starts_with('[') {
        return Ok(serde_json::from_str(trimmed)?);
    }

    input
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(DispatchError::from))
        .collect()
}
