//! Retry decorator with exponential backoff and dead-letter routing

use super::{Queue, WorkItem};
use crate::config::RetryConfig;
use crate::error::{DispatchError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Exponential backoff: `initial * multiplier^attempt`, capped at `max`
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Scale each delay by a random factor in 0.75..=1.25 before capping
    pub jitter: bool,
}

impl BackoffPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            initial: config.initial_interval(),
            max: config.max_interval(),
            multiplier: config.multiplier,
            jitter: config.jitter,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let mut millis = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);

        if self.jitter {
            use rand::Rng;
            millis *= rand::thread_rng().gen_range(0.75..=1.25);
        }

        let capped = millis.min(self.max.as_millis() as f64);
        if capped.is_finite() && capped > 0.0 {
            Duration::from_millis(capped as u64)
        } else {
            self.max
        }
    }
}

/// Result of a single `retry` call
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    /// Re-enqueued, invisible until `visible_at`
    Rescheduled {
        attempt: u32,
        delay: Duration,
        visible_at: DateTime<Utc>,
    },
    /// Retry budget exhausted; item is now in the dead-letter queue
    DeadLettered { reason: String },
    /// Retry budget exhausted with dead lettering disabled
    Dropped { reason: String },
}

/// Retry statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryStats {
    pub total_retried: u64,
    pub dead_lettered: u64,
    pub dropped: u64,
    pub replayed: u64,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub last_dead_lettered_at: Option<DateTime<Utc>>,
}

/// Queue decorator adding backoff rescheduling and a dead-letter queue
pub struct RetryQueue {
    base: Arc<dyn Queue>,
    dead_letter: Option<Arc<dyn Queue>>,
    policy: BackoffPolicy,
    max_retries: u32,
    max_elapsed: Option<Duration>,
    stats: RwLock<RetryStats>,
}

impl RetryQueue {
    pub fn new(
        base: Arc<dyn Queue>,
        dead_letter: Option<Arc<dyn Queue>>,
        config: &RetryConfig,
    ) -> Self {
        Self {
            base,
            dead_letter,
            policy: BackoffPolicy::from_config(config),
            max_retries: config.max_retries,
            max_elapsed: config.max_elapsed_time(),
            stats: RwLock::new(RetryStats::default()),
        }
    }

    /// Retry budget stamped on items entering through this queue
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn base(&self) -> &Arc<dyn Queue> {
        &self.base
    }

    /// Reschedule an item with backoff, or dead-letter it once its budget is spent
    ///
    /// An item the base queue refuses (full or closed) is dead-lettered rather
    /// than dropped.
    pub async fn retry(&self, mut item: WorkItem) -> Result<RetryOutcome> {
        let now = Utc::now();
        let attempt = item.retry_count;
        item.retry_count = item.retry_count.saturating_add(1);
        item.updated_at = now;

        if let Some(max_elapsed) = self.max_elapsed {
            let elapsed = (now - item.created_at).to_std().unwrap_or_default();
            if elapsed > max_elapsed {
                let reason = format!(
                    "max elapsed time exceeded after {} attempts ({:?})",
                    item.retry_count, elapsed
                );
                return self.move_to_dead_letter(item, reason).await;
            }
        }

        if item.retry_count > item.max_retries {
            let reason = format!("max retries exceeded ({})", item.max_retries);
            return self.move_to_dead_letter(item, reason).await;
        }

        let delay = self.policy.delay_for(attempt);
        let visible_at = now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        item.scheduled_at = Some(visible_at);

        let item_id = item.id;
        let retry_count = item.retry_count;
        if let Err(e) = self.base.enqueue(item.clone()).await {
            warn!(item_id = %item_id, error = %e, "Retry enqueue refused, dead lettering work item");
            return self
                .move_to_dead_letter(item, format!("retry enqueue failed: {}", e))
                .await;
        }

        {
            let mut stats = self.stats.write();
            stats.total_retried += 1;
            stats.last_retry_at = Some(now);
        }

        info!(
            item_id = %item_id,
            attempt = retry_count,
            delay_ms = delay.as_millis() as u64,
            "Work item scheduled for retry"
        );

        Ok(RetryOutcome::Rescheduled {
            attempt: retry_count,
            delay,
            visible_at,
        })
    }

    /// Move an item straight to the dead-letter queue
    pub async fn move_to_dead_letter(
        &self,
        mut item: WorkItem,
        reason: String,
    ) -> Result<RetryOutcome> {
        item.scheduled_at = None;
        item.updated_at = Utc::now();
        if item.last_error.is_none() {
            item.last_error = Some(reason.clone());
        }

        let Some(dead_letter) = &self.dead_letter else {
            warn!(item_id = %item.id, reason = %reason, "Dead lettering disabled, dropping work item");
            self.stats.write().dropped += 1;
            return Ok(RetryOutcome::Dropped { reason });
        };

        let item_id = item.id;
        if let Err(e) = dead_letter.enqueue(item).await {
            error!(item_id = %item_id, error = %e, "Failed to move work item to dead letter queue");
            return Err(e);
        }

        {
            let mut stats = self.stats.write();
            stats.dead_lettered += 1;
            stats.last_dead_lettered_at = Some(Utc::now());
        }

        warn!(item_id = %item_id, reason = %reason, "Work item moved to dead letter queue");
        Ok(RetryOutcome::DeadLettered { reason })
    }

    pub fn dead_letter_enabled(&self) -> bool {
        self.dead_letter.is_some()
    }

    /// Inspect dead-lettered items without removing them
    pub async fn dead_letter_items(&self, limit: usize) -> Result<Vec<WorkItem>> {
        match &self.dead_letter {
            Some(dead_letter) => dead_letter.list(limit).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn dead_letter_size(&self) -> Result<usize> {
        match &self.dead_letter {
            Some(dead_letter) => dead_letter.size().await,
            None => Ok(0),
        }
    }

    /// Move up to `limit` dead-lettered items back to the main queue with a fresh budget
    pub async fn replay_dead_letter(&self, limit: usize) -> Result<usize> {
        let Some(dead_letter) = &self.dead_letter else {
            return Ok(0);
        };

        let mut replayed = 0;
        while replayed < limit {
            let mut item = match dead_letter.dequeue().await {
                Ok(item) => item,
                Err(DispatchError::QueueEmpty) => break,
                Err(e) => return Err(e),
            };

            item.retry_count = 0;
            item.scheduled_at = None;

            if let Err(e) = self.base.enqueue(item.clone()).await {
                warn!(item_id = %item.id, error = %e, "Replay stopped, returning item to dead letter queue");
                dead_letter.enqueue(item).await?;
                break;
            }
            replayed += 1;
        }

        if replayed > 0 {
            self.stats.write().replayed += replayed as u64;
            info!(count = replayed, "Replayed dead letter items");
        }
        Ok(replayed)
    }

    pub async fn purge_dead_letter(&self) -> Result<()> {
        if let Some(dead_letter) = &self.dead_letter {
            dead_letter.clear().await?;
        }
        Ok(())
    }

    pub fn stats(&self) -> RetryStats {
        self.stats.read().clone()
    }
}

#[async_trait]
impl Queue for RetryQueue {
    async fn enqueue(&self, item: WorkItem) -> Result<()> {
        self.base.enqueue(item).await
    }

    async fn dequeue(&self) -> Result<WorkItem> {
        self.base.dequeue().await
    }

    async fn peek(&self) -> Result<WorkItem> {
        self.base.peek().await
    }

    async fn size(&self) -> Result<usize> {
        self.base.size().await
    }

    async fn list(&self, limit: usize) -> Result<Vec<WorkItem>> {
        self.base.list(limit).await
    }

    async fn clear(&self) -> Result<()> {
        self.base.clear().await
    }

    async fn close(&self) -> Result<()> {
        let base = self.base.close().await;
        if let Some(dead_letter) = &self.dead_letter {
            dead_letter.close().await?;
        }
        debug!("Retry queue closed");
        base
    }

    fn capacity(&self) -> usize {
        self.base.capacity()
    }
}
