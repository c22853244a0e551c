//! Work queue abstraction and backends
//!
//! A [`Queue`] stores [`WorkItem`]s ordered by priority (highest first) and,
//! within a priority, by visibility time then enqueue order. Items scheduled in
//! the future stay invisible to `dequeue` until their time elapses.
//! [`RetryQueue`] decorates any queue with exponential backoff and dead-letter
//! routing.

pub mod memory;
pub mod redis_queue;
pub mod retry;

pub use memory::MemoryQueue;
pub use redis_queue::RedisQueue;
pub use retry::{BackoffPolicy, RetryQueue, RetryStats};

use crate::config::{QueueConfig, QueueKind};
use crate::error::Result;
use crate::models::{Message, Priority};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Queue envelope around a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub message: Message,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set by the queue on every enqueue
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Item is invisible to consumers until this time
    pub scheduled_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl WorkItem {
    pub fn new(message: Message) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            priority: message.priority,
            scheduled_at: message.scheduled_at,
            message,
            created_at: now,
            updated_at: now,
            enqueued_at: now,
            retry_count: 0,
            max_retries: 3,
            last_error: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_schedule(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn is_visible_at(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.map_or(true, |at| at <= now)
    }

    /// Time used to order items of equal priority
    pub fn ordering_time(&self) -> DateTime<Utc> {
        self.scheduled_at.unwrap_or(self.enqueued_at)
    }
}

/// Capacity-bounded, priority and time aware store of work items
#[async_trait]
pub trait Queue: Send + Sync {
    /// Add an item; fails with `QueueFull` when at capacity
    async fn enqueue(&self, item: WorkItem) -> Result<()>;

    /// Remove the highest priority visible item; fails with `QueueEmpty` when none
    async fn dequeue(&self) -> Result<WorkItem>;

    /// Same selection as `dequeue` without removing the item
    async fn peek(&self) -> Result<WorkItem>;

    /// Number of stored items, visible or not
    async fn size(&self) -> Result<usize>;

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.size().await? == 0)
    }

    /// Non-destructive listing in dequeue order, invisible items included
    async fn list(&self, limit: usize) -> Result<Vec<WorkItem>>;

    async fn clear(&self) -> Result<()>;

    /// Release all state; safe to call more than once
    async fn close(&self) -> Result<()>;

    fn capacity(&self) -> usize;
}

/// Build the configured queue backend
pub async fn build_queue(config: &QueueConfig) -> Result<Arc<dyn Queue>> {
    match config.kind {
        QueueKind::Memory => Ok(Arc::new(MemoryQueue::new(config.capacity))),
        QueueKind::Redis => {
            let queue = RedisQueue::connect(&config.redis, config.capacity, "main").await?;
            Ok(Arc::new(queue))
        }
    }
}

/// Build the dead-letter queue matching the configured backend
pub async fn build_dead_letter_queue(config: &QueueConfig) -> Result<Option<Arc<dyn Queue>>> {
    if !config.dead_letter_enabled {
        return Ok(None);
    }
    match config.kind {
        QueueKind::Memory => Ok(Some(Arc::new(MemoryQueue::new(
            config.dead_letter_capacity,
        )))),
        QueueKind::Redis => {
            let queue =
                RedisQueue::connect(&config.redis, config.dead_letter_capacity, "dead_letter")
                    .await?;
            Ok(Some(Arc::new(queue)))
        }
    }
}
