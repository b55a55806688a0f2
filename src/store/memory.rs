//! In-memory Durable Store
//!
//! Same contract as [`SqliteStore`](super::SqliteStore) without persistence.
//! Used by tests and the `--ephemeral` CLI flag. Writes can be made to
//! fail on demand to exercise the storage-unavailable paths.

use super::{fresh_attempt, DurableStore, StorageEstimate};
use crate::error::{Result, SyncError};
use crate::models::{Item, MutationRecord};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
struct Inner {
    todos: BTreeMap<String, Item>,
    queue: Vec<MutationRecord>,
    dead_letters: Vec<MutationRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    quota_bytes: Option<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(mut self, quota_bytes: Option<u64>) -> Self {
        self.quota_bytes = quota_bytes;
        self
    }

    /// Make every subsequent write fail with `StorageUnavailable`
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent read fail with `StorageUnavailable`
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn check_readable(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(SyncError::StorageUnavailable("database is locked".into()));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncError::StorageUnavailable("quota exceeded".into()));
        }
        Ok(())
    }
}

/// Stable FIFO: by enqueue time, then insertion order
fn sorted_queue(queue: &[MutationRecord]) -> Vec<MutationRecord> {
    let mut records = queue.to_vec();
    records.sort_by_key(|r| r.enqueued_at);
    records
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get_all(&self) -> Result<Vec<Item>> {
        self.check_readable()?;
        let inner = self.inner.lock();
        let mut items: Vec<Item> = inner.todos.values().cloned().collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(items)
    }

    async fn get(&self, id: &str) -> Result<Option<Item>> {
        self.check_readable()?;
        Ok(self.inner.lock().todos.get(id).cloned())
    }

    async fn put(&self, item: &Item) -> Result<()> {
        self.check_writable()?;
        self.inner.lock().todos.insert(item.id.clone(), item.clone());
        Ok(())
    }

    async fn add(&self, item: &Item) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        if inner.todos.contains_key(&item.id) {
            return Err(SyncError::AlreadyExists(item.id.clone()));
        }
        inner.todos.insert(item.id.clone(), item.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.check_writable()?;
        self.inner.lock().todos.remove(id);
        Ok(())
    }

    async fn bulk_put(&self, items: &[Item]) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        for item in items {
            inner.todos.insert(item.id.clone(), item.clone());
        }
        Ok(())
    }

    async fn replace_all(&self, items: &[Item]) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        inner.todos = items.iter().map(|i| (i.id.clone(), i.clone())).collect();
        Ok(())
    }

    async fn enqueue(&self, record: &MutationRecord) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        if inner.queue.iter().any(|r| r.id == record.id) {
            return Err(SyncError::AlreadyExists(record.id.clone()));
        }
        inner.queue.push(record.clone());
        Ok(())
    }

    async fn list_queue(&self) -> Result<Vec<MutationRecord>> {
        self.check_readable()?;
        Ok(sorted_queue(&self.inner.lock().queue))
    }

    async fn remove_from_queue(&self, id: &str) -> Result<()> {
        self.check_writable()?;
        self.inner.lock().queue.retain(|r| r.id != id);
        Ok(())
    }

    async fn clear_queue(&self) -> Result<()> {
        self.check_writable()?;
        self.inner.lock().queue.clear();
        Ok(())
    }

    async fn queue_len(&self) -> Result<usize> {
        self.check_readable()?;
        Ok(self.inner.lock().queue.len())
    }

    async fn update_queue_record(&self, record: &MutationRecord) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        let slot = inner
            .queue
            .iter_mut()
            .find(|r| r.id == record.id)
            .ok_or_else(|| SyncError::NotFound(format!("queued mutation {}", record.id)))?;
        // position is fixed by the original enqueue time
        let enqueued_at = slot.enqueued_at;
        *slot = record.clone();
        slot.enqueued_at = enqueued_at;
        Ok(())
    }

    async fn retarget_queue(&self, old_id: &str, new_id: &str) -> Result<usize> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        Ok(inner
            .queue
            .iter_mut()
            .filter_map(|r| r.retarget(old_id, new_id).then_some(()))
            .count())
    }

    async fn dead_letter(&self, record: &MutationRecord) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        inner.queue.retain(|r| r.id != record.id);
        inner.dead_letters.retain(|r| r.id != record.id);
        inner.dead_letters.push(record.clone());
        Ok(())
    }

    async fn list_dead_letters(&self) -> Result<Vec<MutationRecord>> {
        self.check_readable()?;
        Ok(self.inner.lock().dead_letters.clone())
    }

    async fn requeue_dead_letters(&self) -> Result<usize> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        let records = std::mem::take(&mut inner.dead_letters);
        let count = records.len();
        inner.queue.extend(records.iter().map(fresh_attempt));
        Ok(count)
    }

    async fn health_check(&self) -> bool {
        !self.fail_writes.load(Ordering::SeqCst) && !self.fail_reads.load(Ordering::SeqCst)
    }

    async fn estimate(&self) -> Option<StorageEstimate> {
        let inner = self.inner.lock();
        let usage: usize = inner
            .todos
            .values()
            .filter_map(|i| serde_json::to_vec(i).ok())
            .map(|b| b.len())
            .chain(
                inner
                    .queue
                    .iter()
                    .chain(inner.dead_letters.iter())
                    .filter_map(|r| serde_json::to_vec(r).ok())
                    .map(|b| b.len()),
            )
            .sum();
        Some(StorageEstimate {
            usage_bytes: usage as u64,
            quota_bytes: self.quota_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failing_writes() {
        let store = MemoryStore::new();
        store.put(&Item::new_local("a")).await.unwrap();
        store.set_fail_writes(true);

        let err = store.put(&Item::new_local("b")).await.unwrap_err();
        assert!(matches!(err, SyncError::StorageUnavailable(_)));
        assert!(!store.health_check().await);
        // reads still work
        assert_eq!(store.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_record_keeps_position() {
        let store = MemoryStore::new();
        let first = MutationRecord::delete("1");
        let second = MutationRecord::delete("2");
        store.enqueue(&first).await.unwrap();
        store.enqueue(&second).await.unwrap();

        let mut bumped = first.clone();
        bumped.attempts = 2;
        bumped.enqueued_at = second.enqueued_at + chrono::Duration::seconds(5);
        store.update_queue_record(&bumped).await.unwrap();

        let queue = store.list_queue().await.unwrap();
        assert_eq!(queue[0].id, first.id);
        assert_eq!(queue[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_estimate_grows() {
        let store = MemoryStore::new().with_quota(Some(1000));
        let before = store.estimate().await.unwrap().usage_bytes;
        store.put(&Item::new_local("Buy milk")).await.unwrap();
        let after = store.estimate().await.unwrap();
        assert!(after.usage_bytes > before);
        assert_eq!(after.quota_bytes, Some(1000));
    }
}
