//! In-memory queue backend

use super::{Queue, WorkItem};
use crate::error::{DispatchError, Result};
use crate::models::Priority;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use tracing::debug;

/// Highest priority first, then earliest visibility time, then insertion order
type OrderKey = (Reverse<Priority>, DateTime<Utc>, u64);

#[derive(Default)]
struct MemoryQueueState {
    items: BTreeMap<OrderKey, WorkItem>,
    next_seq: u64,
    closed: bool,
}

impl MemoryQueueState {
    fn first_visible(&self, now: DateTime<Utc>) -> Option<OrderKey> {
        self.items
            .iter()
            .find(|(_, item)| item.is_visible_at(now))
            .map(|(key, _)| *key)
    }
}

/// Volatile priority queue living for the lifetime of the process
pub struct MemoryQueue {
    capacity: usize,
    state: Mutex<MemoryQueueState>,
}

impl MemoryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(MemoryQueueState::default()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Remove the first item visible at `now`
    pub fn dequeue_at(&self, now: DateTime<Utc>) -> Result<WorkItem> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(DispatchError::QueueClosed);
        }

        let key = state.first_visible(now).ok_or(DispatchError::QueueEmpty)?;
        state.items.remove(&key).ok_or(DispatchError::QueueEmpty)
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn enqueue(&self, mut item: WorkItem) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(DispatchError::QueueClosed);
        }
        if state.items.len() >= self.capacity {
            return Err(DispatchError::QueueFull {
                capacity: self.capacity,
            });
        }

        let now = Utc::now();
        item.enqueued_at = now;
        item.updated_at = now;

        let seq = state.next_seq;
        state.next_seq += 1;
        let key = (Reverse(item.priority), item.ordering_time(), seq);

        debug!(item_id = %item.id, priority = %item.priority, "Enqueued work item");
        state.items.insert(key, item);
        Ok(())
    }

    async fn dequeue(&self) -> Result<WorkItem> {
        self.dequeue_at(Utc::now())
    }

    async fn peek(&self) -> Result<WorkItem> {
        let state = self.state.lock();
        if state.closed {
            return Err(DispatchError::QueueClosed);
        }

        state
            .first_visible(Utc::now())
            .and_then(|key| state.items.get(&key).cloned())
            .ok_or(DispatchError::QueueEmpty)
    }

    async fn size(&self) -> Result<usize> {
        Ok(self.state.lock().items.len())
    }

    async fn list(&self, limit: usize) -> Result<Vec<WorkItem>> {
        Ok(self
            .state
            .lock()
            .items
            .values()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn clear(&self) -> Result<()> {
        self.state.lock().items.clear();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            state.items.clear();
            debug!("Memory queue closed");
        }
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}
