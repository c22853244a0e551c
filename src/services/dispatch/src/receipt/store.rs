//! Receipt storage: bounded in-memory index with pluggable persistence fallback

use super::{Receipt, ReceiptStatus};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Criteria for receipt queries; empty sets match everything
#[derive(Debug, Clone, Default)]
pub struct ReceiptFilter {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub statuses: HashSet<ReceiptStatus>,
    pub platforms: HashSet<String>,
    pub message_ids: HashSet<String>,
    pub limit: Option<usize>,
}

impl ReceiptFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_time_range(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self.end_time = Some(end);
        self
    }

    pub fn with_statuses<I: IntoIterator<Item = ReceiptStatus>>(mut self, statuses: I) -> Self {
        self.statuses.extend(statuses);
        self
    }

    pub fn with_platforms<I, S>(mut self, platforms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.platforms.extend(platforms.into_iter().map(Into::into));
        self
    }

    pub fn with_message_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.message_ids.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, receipt: &Receipt) -> bool {
        if let Some(start) = self.start_time {
            if receipt.created_at < start {
                return false;
            }
        }
        if let Some(end) = self.end_time {
            if receipt.created_at > end {
                return false;
            }
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&receipt.status) {
            return false;
        }
        if !self.message_ids.is_empty() && !self.message_ids.contains(&receipt.message_id) {
            return false;
        }
        if !self.platforms.is_empty()
            && !receipt
                .results
                .iter()
                .any(|r| self.platforms.contains(&r.platform))
        {
            return false;
        }
        true
    }

    /// Newest first, truncated to the limit
    fn finish(&self, mut receipts: Vec<Receipt>) -> Vec<Receipt> {
        receipts.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        if let Some(limit) = self.limit {
            receipts.truncate(limit);
        }
        receipts
    }
}

/// Durable home for receipts evicted from (or never held in) memory
#[async_trait]
pub trait ReceiptPersistence: Send + Sync {
    async fn save(&self, receipt: &Receipt) -> Result<()>;

    async fn save_batch(&self, receipts: &[Receipt]) -> Result<()> {
        for receipt in receipts {
            self.save(receipt).await?;
        }
        Ok(())
    }

    async fn load(&self, message_id: &str) -> Result<Option<Receipt>>;

    async fn query(&self, filter: &ReceiptFilter) -> Result<Vec<Receipt>>;
}

/// Persistence kept in a map, mainly for tests and single-process setups
#[derive(Default)]
pub struct MemoryReceiptPersistence {
    receipts: RwLock<HashMap<String, Receipt>>,
}

impl MemoryReceiptPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.receipts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.receipts.read().is_empty()
    }
}

#[async_trait]
impl ReceiptPersistence for MemoryReceiptPersistence {
    async fn save(&self, receipt: &Receipt) -> Result<()> {
        self.receipts
            .write()
            .insert(receipt.message_id.clone(), receipt.clone());
        Ok(())
    }

    async fn load(&self, message_id: &str) -> Result<Option<Receipt>> {
        Ok(self.receipts.read().get(message_id).cloned())
    }

    async fn query(&self, filter: &ReceiptFilter) -> Result<Vec<Receipt>> {
        let matched = self
            .receipts
            .read()
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        Ok(filter.finish(matched))
    }
}

/// Append-only JSON-lines file; the last line for a message id wins
pub struct FileReceiptPersistence {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileReceiptPersistence {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, receipts: &[Receipt]) -> Result<()> {
        let payload = super::export_json_lines(receipts)?;
        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(payload.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_all(&self) -> Result<HashMap<String, Receipt>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };

        let mut receipts = HashMap::new();
        for (line_no, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Receipt>(line) {
                Ok(receipt) => {
                    receipts.insert(receipt.message_id.clone(), receipt);
                }
                Err(e) => {
                    warn!(path = %self.path.display(), line = line_no + 1, error = %e, "Skipping corrupt receipt line");
                }
            }
        }
        Ok(receipts)
    }
}

#[async_trait]
impl ReceiptPersistence for FileReceiptPersistence {
    async fn save(&self, receipt: &Receipt) -> Result<()> {
        self.append(std::slice::from_ref(receipt)).await
    }

    async fn save_batch(&self, receipts: &[Receipt]) -> Result<()> {
        self.append(receipts).await
    }

    async fn load(&self, message_id: &str) -> Result<Option<Receipt>> {
        Ok(self.read_all().await?.remove(message_id))
    }

    async fn query(&self, filter: &ReceiptFilter) -> Result<Vec<Receipt>> {
        let matched = self
            .read_all()
            .await?
            .into_values()
            .filter(|r| filter.matches(r))
            .collect();
        Ok(filter.finish(matched))
    }
}

#[derive(Default)]
struct IndexState {
    receipts: HashMap<String, Receipt>,
    /// Insertion order, oldest first
    order: VecDeque<String>,
}

/// In-memory receipt index with optional persistence behind it
pub struct ReceiptStore {
    index: RwLock<IndexState>,
    max_entries: usize,
    persistence: Option<Arc<dyn ReceiptPersistence>>,
}

impl ReceiptStore {
    pub fn new(max_entries: usize, persistence: Option<Arc<dyn ReceiptPersistence>>) -> Self {
        Self {
            index: RwLock::new(IndexState::default()),
            max_entries: max_entries.max(1),
            persistence,
        }
    }

    pub fn in_memory(max_entries: usize) -> Self {
        Self::new(max_entries, None)
    }

    fn index_receipt(&self, receipt: Receipt) {
        let mut index = self.index.write();
        let id = receipt.message_id.clone();
        if index.receipts.insert(id.clone(), receipt).is_none() {
            index.order.push_back(id);
        }

        while index.receipts.len() > self.max_entries {
            let Some(oldest) = index.order.pop_front() else {
                break;
            };
            index.receipts.remove(&oldest);
            debug!(message_id = %oldest, "Evicted receipt from memory index");
        }
    }

    /// Persist (when configured) then index a receipt
    pub async fn store(&self, receipt: Receipt) -> Result<()> {
        if let Some(persistence) = &self.persistence {
            persistence.save(&receipt).await?;
        }
        self.index_receipt(receipt);
        Ok(())
    }

    pub async fn store_batch(&self, receipts: Vec<Receipt>) -> Result<()> {
        if let Some(persistence) = &self.persistence {
            persistence.save_batch(&receipts).await?;
        }
        for receipt in receipts {
            self.index_receipt(receipt);
        }
        Ok(())
    }

    pub async fn get(&self, message_id: &str) -> Result<Option<Receipt>> {
        let cached = self.index.read().receipts.get(message_id).cloned();
        if cached.is_some() {
            return Ok(cached);
        }
        match &self.persistence {
            Some(persistence) => persistence.load(message_id).await,
            None => Ok(None),
        }
    }

    /// Query the index, topping up from persistence when the index falls short
    pub async fn query(&self, filter: &ReceiptFilter) -> Result<Vec<Receipt>> {
        let mut found: HashMap<String, Receipt> = self
            .index
            .read()
            .receipts
            .values()
            .filter(|r| filter.matches(r))
            .map(|r| (r.message_id.clone(), r.clone()))
            .collect();

        let satisfied = filter.limit.is_some_and(|limit| found.len() >= limit);
        if !satisfied {
            if let Some(persistence) = &self.persistence {
                for receipt in persistence.query(filter).await? {
                    found.entry(receipt.message_id.clone()).or_insert(receipt);
                }
            }
        }

        Ok(filter.finish(found.into_values().collect()))
    }

    pub fn memory_len(&self) -> usize {
        self.index.read().receipts.len()
    }

    pub fn has_persistence(&self) -> bool {
        self.persistence.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receipt::PlatformResult;
    use chrono::Duration;
    use tempfile::TempDir;

    fn create_test_receipt(id: &str, status: ReceiptStatus, platform: &str) -> Receipt {
        let mut receipt = Receipt::new(id);
        receipt.add_result(PlatformResult::failure(platform, "t1", "boom"));
        receipt.status = status;
        receipt
    }

    #[tokio::test]
    async fn test_filter_by_status_platform_and_ids() {
        let store = ReceiptStore::in_memory(100);
        store
            .store(create_test_receipt("a", ReceiptStatus::Failed, "sms"))
            .await
            .unwrap();
        store
            .store(create_test_receipt("b", ReceiptStatus::Completed, "email"))
            .await
            .unwrap();
        store
            .store(create_test_receipt("c", ReceiptStatus::Failed, "email"))
            .await
            .unwrap();

        let failed = store
            .query(&ReceiptFilter::new().with_statuses([ReceiptStatus::Failed]))
            .await
            .unwrap();
        assert_eq!(failed.len(), 2);

        let email_failed = store
            .query(
                &ReceiptFilter::new()
                    .with_statuses([ReceiptStatus::Failed])
                    .with_platforms(["email"]),
            )
            .await
            .unwrap();
        assert_eq!(email_failed.len(), 1);
        assert_eq!(email_failed[0].message_id, "c");

        let by_id = store
            .query(&ReceiptFilter::new().with_message_ids(["a", "b"]).with_limit(1))
            .await
            .unwrap();
        assert_eq!(by_id.len(), 1);
    }

    #[tokio::test]
    async fn test_filter_by_time_range() {
        let store = ReceiptStore::in_memory(100);
        let mut old = create_test_receipt("old", ReceiptStatus::Completed, "sms");
        old.created_at = Utc::now() - Duration::days(2);
        store.store(old).await.unwrap();
        store
            .store(create_test_receipt("new", ReceiptStatus::Completed, "sms"))
            .await
            .unwrap();

        let recent = store
            .query(&ReceiptFilter::new().with_time_range(
                Utc::now() - Duration::hours(1),
                Utc::now() + Duration::hours(1),
            ))
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].message_id, "new");
    }

    #[tokio::test]
    async fn test_eviction_falls_back_to_persistence() {
        let persistence = Arc::new(MemoryReceiptPersistence::new());
        let store = ReceiptStore::new(2, Some(persistence.clone()));

        for id in ["a", "b", "c"] {
            store
                .store(create_test_receipt(id, ReceiptStatus::Failed, "sms"))
                .await
                .unwrap();
        }

        assert_eq!(store.memory_len(), 2);
        assert_eq!(persistence.len(), 3);

        // "a" was evicted from memory but is still reachable
        let evicted = store.get("a").await.unwrap();
        assert!(evicted.is_some());

        let all = store.query(&ReceiptFilter::new()).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_without_persistence_evicted_is_gone() {
        let store = ReceiptStore::in_memory(1);
        store
            .store(create_test_receipt("a", ReceiptStatus::Failed, "sms"))
            .await
            .unwrap();
        store
            .store(create_test_receipt("b", ReceiptStatus::Failed, "sms"))
            .await
            .unwrap();
        assert!(store.get("a").await.unwrap().is_none());
        assert!(store.get("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_file_persistence_round_trip() {
        let dir = TempDir::new().unwrap();
        let persistence = FileReceiptPersistence::new(dir.path().join("receipts.jsonl"));

        assert!(persistence.load("missing").await.unwrap().is_none());

        let first = create_test_receipt("a", ReceiptStatus::Failed, "sms");
        persistence.save(&first).await.unwrap();

        let mut updated = first.clone();
        updated.status = ReceiptStatus::Completed;
        persistence
            .save_batch(&[
                updated.clone(),
                create_test_receipt("b", ReceiptStatus::Failed, "email"),
            ])
            .await
            .unwrap();

        assert_eq!(persistence.load("a").await.unwrap(), Some(updated));

        let failed = persistence
            .query(&ReceiptFilter::new().with_statuses([ReceiptStatus::Failed]))
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].message_id, "b");
    }

    #[tokio::test]
    async fn test_file_persistence_skips_corrupt_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("receipts.jsonl");
        let persistence = FileReceiptPersistence::new(&path);
        persistence
            .save(&create_test_receipt("a", ReceiptStatus::Failed, "sms"))
            .await
            .unwrap();

        let mut contents = tokio::fs::read_to_string(&path).await.unwrap();
        contents.push_str("{not json\n");
        tokio::fs::write(&path, contents).await.unwrap();

        let all = persistence.query(&ReceiptFilter::new()).await.unwrap();
        assert_eq!(all.len(), 1);
    }
}
