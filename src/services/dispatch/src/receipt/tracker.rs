//! In-flight progress for asynchronous dispatches

use super::{PlatformResult, Receipt, ReceiptStatus};
use crate::error::{DispatchError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Progress of one message whose platforms report back over time
#[derive(Debug, Clone)]
pub struct AsyncReceiptTracker {
    pub message_id: String,
    pub total_targets: usize,
    pub processed: usize,
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<PlatformResult>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Snapshot handed to callers polling a tracker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerProgress {
    pub message_id: String,
    pub processed: usize,
    pub successful: usize,
    pub failed: usize,
    pub total: usize,
    pub percent_complete: f64,
    pub complete: bool,
}

impl AsyncReceiptTracker {
    pub fn new<S: Into<String>>(message_id: S, total_targets: usize) -> Self {
        let now = Utc::now();
        Self {
            message_id: message_id.into(),
            total_targets,
            processed: 0,
            successful: 0,
            failed: 0,
            results: Vec::new(),
            started_at: now,
            updated_at: now,
        }
    }

    pub fn record(&mut self, result: PlatformResult) {
        self.processed += 1;
        if result.success {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
        self.updated_at = Utc::now();
        self.results.push(result);
    }

    pub fn percent_complete(&self) -> f64 {
        if self.total_targets == 0 {
            return 100.0;
        }
        (self.processed as f64 / self.total_targets as f64 * 100.0).min(100.0)
    }

    pub fn is_complete(&self) -> bool {
        self.processed >= self.total_targets
    }

    pub fn progress(&self) -> TrackerProgress {
        TrackerProgress {
            message_id: self.message_id.clone(),
            processed: self.processed,
            successful: self.successful,
            failed: self.failed,
            total: self.total_targets,
            percent_complete: self.percent_complete(),
            complete: self.is_complete(),
        }
    }

    /// Turn the tracker into a receipt; targets that never reported count as failed
    pub fn into_receipt(self) -> Receipt {
        let mut receipt = Receipt::new(self.message_id);
        receipt.created_at = self.started_at;
        receipt.status = ReceiptStatus::Processing;
        for result in self.results {
            receipt.add_result(result);
        }

        let missing = self.total_targets.saturating_sub(self.processed);
        if missing > 0 {
            receipt.error = Some(format!("{} targets never reported", missing));
            for _ in 0..missing {
                receipt.add_result(PlatformResult::failure("unknown", "", "no result reported"));
            }
        }
        receipt
    }
}

/// Concurrent registry of trackers keyed by message id
#[derive(Default)]
pub struct ReceiptTrackers {
    trackers: DashMap<String, AsyncReceiptTracker>,
}

impl ReceiptTrackers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin tracking; restarting an id replaces its previous tracker
    pub fn start(&self, message_id: &str, total_targets: usize) {
        self.trackers.insert(
            message_id.to_string(),
            AsyncReceiptTracker::new(message_id, total_targets),
        );
    }

    pub fn record(&self, message_id: &str, result: PlatformResult) -> Result<TrackerProgress> {
        let mut tracker = self
            .trackers
            .get_mut(message_id)
            .ok_or_else(|| DispatchError::not_found(format!("tracker {}", message_id)))?;
        tracker.record(result);
        Ok(tracker.progress())
    }

    pub fn progress(&self, message_id: &str) -> Option<TrackerProgress> {
        self.trackers.get(message_id).map(|t| t.progress())
    }

    pub fn finalize(&self, message_id: &str) -> Result<Receipt> {
        self.trackers
            .remove(message_id)
            .map(|(_, tracker)| tracker.into_receipt())
            .ok_or_else(|| DispatchError::not_found(format!("tracker {}", message_id)))
    }

    pub fn active(&self) -> usize {
        self.trackers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_percent() {
        let mut tracker = AsyncReceiptTracker::new("m1", 4);
        assert_eq!(tracker.percent_complete(), 0.0);

        tracker.record(PlatformResult::failure("sms", "+1", "HTTP 500"));
        let mut ok = PlatformResult::failure("email", "a@b.c", "");
        ok.success = true;
        tracker.record(ok);

        let progress = tracker.progress();
        assert_eq!(progress.processed, 2);
        assert_eq!(progress.successful, 1);
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.percent_complete, 50.0);
        assert!(!progress.complete);
    }

    #[test]
    fn test_missing_targets_become_failures() {
        let tracker = AsyncReceiptTracker::new("m1", 3);
        let receipt = tracker.into_receipt();
        assert_eq!(receipt.total, 3);
        assert_eq!(receipt.failed, 3);
        assert!(receipt.error.is_some());
    }

    #[test]
    fn test_registry_unknown_id() {
        let trackers = ReceiptTrackers::new();
        assert!(trackers
            .record("nope", PlatformResult::failure("sms", "+1", "x"))
            .is_err());
        assert!(trackers.finalize("nope").is_err());

        trackers.start("m1", 1);
        assert_eq!(trackers.active(), 1);
        trackers.finalize("m1").unwrap();
        assert_eq!(trackers.active(), 0);
    }
}
