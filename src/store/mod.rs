//! Durable Store
//!
//! Key-value persistence for two collections, `todos` (keyed by item id) and
//! `sync-queue` (keyed by mutation id, FIFO by enqueue time), plus a
//! dead-letter collection for mutations that stopped retrying.
//!
//! Every write is atomic and durable before it returns. Failures surface as
//! [`SyncError::StorageUnavailable`](crate::error::SyncError::StorageUnavailable);
//! callers treat that as a warning, never as fatal.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::models::{Item, MutationRecord};
use async_trait::async_trait;

/// Storage usage snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageEstimate {
    pub usage_bytes: u64,
    pub quota_bytes: Option<u64>,
}

impl StorageEstimate {
    /// Fraction of the quota in use, when a quota is known
    pub fn usage_ratio(&self) -> Option<f64> {
        self.quota_bytes
            .filter(|q| *q > 0)
            .map(|q| self.usage_bytes as f64 / q as f64)
    }
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    // -- items --

    async fn get_all(&self) -> Result<Vec<Item>>;

    async fn get(&self, id: &str) -> Result<Option<Item>>;

    /// Insert or replace
    async fn put(&self, item: &Item) -> Result<()>;

    /// Insert; fails if the id already exists
    async fn add(&self, item: &Item) -> Result<()>;

    /// Remove; missing ids are not an error
    async fn delete(&self, id: &str) -> Result<()>;

    /// Insert or replace many items in one transaction
    async fn bulk_put(&self, items: &[Item]) -> Result<()>;

    /// Make `items` the entire contents of the collection, in one transaction
    async fn replace_all(&self, items: &[Item]) -> Result<()>;

    // -- sync queue --

    async fn enqueue(&self, record: &MutationRecord) -> Result<()>;

    /// Pending mutations in enqueue order
    async fn list_queue(&self) -> Result<Vec<MutationRecord>>;

    async fn remove_from_queue(&self, id: &str) -> Result<()>;

    async fn clear_queue(&self) -> Result<()>;

    async fn queue_len(&self) -> Result<usize>;

    /// Persist retry bookkeeping for a queued record, keeping its position
    async fn update_queue_record(&self, record: &MutationRecord) -> Result<()>;

    /// Point queued mutations for `old_id` at `new_id`; returns how many changed
    async fn retarget_queue(&self, old_id: &str, new_id: &str) -> Result<usize>;

    // -- dead letters --

    /// Move a record out of the queue into the dead-letter collection
    async fn dead_letter(&self, record: &MutationRecord) -> Result<()>;

    async fn list_dead_letters(&self) -> Result<Vec<MutationRecord>>;

    /// Put dead letters back at the end of the queue with a clean retry
    /// budget; returns how many moved
    async fn requeue_dead_letters(&self) -> Result<usize>;

    // -- capability probes --

    /// Cheap read/write round trip
    async fn health_check(&self) -> bool;

    /// `None` when the backend cannot tell
    async fn estimate(&self) -> Option<StorageEstimate>;
}

/// Reset retry bookkeeping before a record goes back on the queue
pub(crate) fn fresh_attempt(record: &MutationRecord) -> MutationRecord {
    let mut record = record.clone();
    record.attempts = 0;
    record.next_attempt_at = None;
    record.last_error = None;
    record.enqueued_at = chrono::Utc::now();
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_ratio() {
        let estimate = StorageEstimate {
            usage_bytes: 80,
            quota_bytes: Some(100),
        };
        assert_eq!(estimate.usage_ratio(), Some(0.8));

        let unknown = StorageEstimate {
            usage_bytes: 80,
            quota_bytes: None,
        };
        assert_eq!(unknown.usage_ratio(), None);

        let zero = StorageEstimate {
            usage_bytes: 0,
            quota_bytes: Some(0),
        };
        assert_eq!(zero.usage_ratio(), None);
    }
}
