//! Todo Sync Service - the session object collaborators talk to.
//!
//! Owns the connectivity flag, event bus, queue, read coordinator and
//! connectivity monitor for one store/remote pair. Writes are optimistic:
//! they land in the durable store and the queue before any network call.

use super::{FlushReport, LoadState, MutationQueue, ReadCoordinator, RetryPolicy};
use crate::config::{FlushOnWrite, SyncConfig};
use crate::connectivity::{ConnectivityMonitor, ConnectivityProbe, HttpProbe, OnlineState};
use crate::error::{Result, SyncError};
use crate::events::{EventBus, Subscription};
use crate::models::{Category, Item, MutationRecord};
use crate::remote::{HttpRemote, RemoteClient};
use crate::store::{DurableStore, SqliteStore, StorageEstimate};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Snapshot for status badges
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub online: bool,
    /// Queued mutations not yet confirmed
    pub pending: usize,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// A flush is in progress
    pub syncing: bool,
}

/// Result of an optimistic write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    /// The item as written locally (still under its local id for creates)
    pub item: Item,
    /// Set when part of the write could not be persisted
    pub storage_warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorageReport {
    pub healthy: bool,
    pub estimate: Option<StorageEstimate>,
    pub warning: Option<String>,
}

enum LocalWrite<'a> {
    Add(&'a Item),
    Put(&'a Item),
    Delete(&'a str),
}

pub struct TodoSync {
    config: SyncConfig,
    events: EventBus,
    queue: Arc<MutationQueue>,
    coordinator: ReadCoordinator,
    monitor: Arc<ConnectivityMonitor>,
    /// Flushes spawned by writes under `FlushOnWrite::Background`
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl TodoSync {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn DurableStore>,
        remote: Arc<dyn RemoteClient>,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> Self {
        let events = EventBus::new();
        let online = OnlineState::new(true);
        let queue = Arc::new(MutationQueue::new(
            store,
            remote,
            events.clone(),
            online.clone(),
            RetryPolicy::from_config(&config.queue),
        ));
        let coordinator = ReadCoordinator::for_queue(&queue);
        let monitor = Arc::new(ConnectivityMonitor::new(
            online,
            queue.clone(),
            events.clone(),
            probe,
            config.poll_interval(),
        ));

        Self {
            config,
            events,
            queue,
            coordinator,
            monitor,
            background: Mutex::new(Vec::new()),
        }
    }

    /// SQLite store, HTTP remote and HTTP probe from configuration
    pub fn open(config: SyncConfig) -> Result<Self> {
        let store = Arc::new(
            SqliteStore::open(&config.storage.db_path)?.with_quota(config.storage.quota_bytes),
        );
        let remote = Arc::new(HttpRemote::from_config(&config)?);
        let probe = Arc::new(HttpProbe::new(&config.remote.base_url, config.probe_timeout())?);
        info!(
            db = %config.storage.db_path.display(),
            base_url = %config.remote.base_url,
            "todo sync opened"
        );
        Ok(Self::new(config, store, remote, probe))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<MutationQueue> {
        &self.queue
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.monitor.is_online()
    }

    /// Platform connectivity signal; going online flushes once
    pub async fn set_online(&self, online: bool) -> Option<FlushReport> {
        self.monitor.set_online(online).await
    }

    /// Run the connectivity poller until `cancel` fires
    pub fn start(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = self.monitor.clone();
        tokio::spawn(async move { monitor.run(cancel).await })
    }

    pub async fn load(&self) -> LoadState {
        self.coordinator.load().await
    }

    pub async fn flush(&self) -> FlushReport {
        self.queue.flush().await
    }

    /// Wait for flushes started in the background by earlier writes.
    /// Call before dropping the runtime.
    pub async fn settle(&self) {
        let handles = std::mem::take(&mut *self.background.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "background flush task failed");
            }
        }
    }

    /// Add a todo under a fresh `local-` id
    pub async fn create_item(&self, title: &str) -> Result<WriteReceipt> {
        let title = title.trim();
        if title.is_empty() {
            return Err(SyncError::InvalidMutation("title is empty".into()));
        }

        let item = Item::new_local(title);
        let record = MutationRecord::create(item.clone());
        let storage_warning = self.persist(LocalWrite::Add(&item), &record).await?;
        info!(id = %item.id, "todo created locally");

        self.after_write().await;
        Ok(WriteReceipt {
            item,
            storage_warning,
        })
    }

    pub async fn toggle_item(&self, id: &str) -> Result<WriteReceipt> {
        let current = self.find(id).await?;
        let item = current.toggled();
        let record = MutationRecord::update(item.clone());
        let storage_warning = self.persist(LocalWrite::Put(&item), &record).await?;
        info!(id, completed = item.completed, "todo toggled locally");

        self.after_write().await;
        Ok(WriteReceipt {
            item,
            storage_warning,
        })
    }

    pub async fn remove_item(&self, id: &str) -> Result<WriteReceipt> {
        let item = self.find(id).await?;
        let record = MutationRecord::delete(id);
        let storage_warning = self.persist(LocalWrite::Delete(id), &record).await?;
        info!(id, "todo removed locally");

        self.after_write().await;
        Ok(WriteReceipt {
            item,
            storage_warning,
        })
    }

    pub async fn status(&self) -> SyncStatus {
        let pending = self.queue.pending().await.unwrap_or_else(|e| {
            warn!(error = %e, "could not count pending mutations");
            0
        });
        SyncStatus {
            online: self.is_online(),
            pending,
            last_sync: self.queue.last_sync(),
            last_error: self.queue.last_error(),
            syncing: self.queue.is_flushing(),
        }
    }

    /// Pending mutations in replay order
    pub async fn pending_mutations(&self) -> Result<Vec<MutationRecord>> {
        self.queue.list().await
    }

    /// Category listing; needs the network, nothing is cached
    pub async fn categories(&self) -> Result<Vec<Category>> {
        if !self.is_online() {
            return Err(SyncError::NetworkUnavailable("offline".into()));
        }
        self.queue.remote().list_categories().await
    }

    pub async fn dead_letters(&self) -> Result<Vec<MutationRecord>> {
        self.queue.dead_letters().await
    }

    pub async fn requeue_dead_letters(&self) -> Result<usize> {
        let moved = self.queue.requeue_dead_letters().await?;
        if moved > 0 {
            self.after_write().await;
        }
        Ok(moved)
    }

    /// Drop every pending mutation without sending it
    pub async fn clear_queue(&self) -> Result<()> {
        self.queue.clear().await
    }

    pub async fn storage_report(&self) -> StorageReport {
        let store = self.queue.store();
        let healthy = store.health_check().await;
        let estimate = store.estimate().await;

        let warning = if !healthy {
            Some("Local storage failed its health check; offline changes may not persist".into())
        } else {
            estimate
                .and_then(|e| e.usage_ratio())
                .filter(|ratio| *ratio > self.config.storage.warn_ratio)
                .map(|ratio| format!("Storage is almost full ({:.0}% used)", ratio * 100.0))
        };
        if let Some(warning) = &warning {
            warn!("{}", warning);
        }

        StorageReport {
            healthy,
            estimate,
            warning,
        }
    }

    async fn find(&self, id: &str) -> Result<Item> {
        self.queue
            .store()
            .get(id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("todo {}", id)))
    }

    /// Write the local copy and queue the mutation together. Losing one half
    /// becomes a warning; losing both is an error.
    async fn persist(&self, write: LocalWrite<'_>, record: &MutationRecord) -> Result<Option<String>> {
        let store = self.queue.store();
        let (stored, queued) = {
            let _gate = self.queue.gate().write().await;
            let stored = match write {
                LocalWrite::Add(item) => store.add(item).await,
                LocalWrite::Put(item) => store.put(item).await,
                LocalWrite::Delete(id) => store.delete(id).await,
            };
            let queued = self.queue.append(record).await;
            (stored, queued)
        };

        match (stored, queued) {
            (Ok(()), Ok(())) => Ok(None),
            (Err(e), Ok(())) => {
                warn!(error = %e, "local write failed, mutation still queued");
                Ok(Some(format!("Change queued for sync but not saved locally: {}", e)))
            }
            (Ok(()), Err(e)) => {
                warn!(error = %e, "could not queue mutation");
                Ok(Some(format!("Change saved locally but not queued for sync: {}", e)))
            }
            (Err(e), Err(_)) => Err(e),
        }
    }

    async fn after_write(&self) {
        if !self.is_online() {
            debug!("offline, write stays queued");
            return;
        }
        match self.config.queue.flush_on_write {
            FlushOnWrite::Inline => {
                self.queue.flush().await;
            }
            FlushOnWrite::Background => {
                let queue = self.queue.clone();
                let handle = tokio::spawn(async move {
                    queue.flush().await;
                });
                let mut background = self.background.lock();
                background.retain(|h| !h.is_finished());
                background.push(handle);
            }
            FlushOnWrite::Never => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SyncEvent;
    use crate::remote::InMemoryRemote;
    use crate::store::MemoryStore;

    fn service(mode: FlushOnWrite) -> (TodoSync, Arc<MemoryStore>, Arc<InMemoryRemote>) {
        let mut config = SyncConfig::default();
        config.queue.flush_on_write = mode;
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(InMemoryRemote::new());
        let sync = TodoSync::new(config, store.clone(), remote.clone(), remote.clone());
        (sync, store, remote)
    }

    #[tokio::test]
    async fn test_create_is_optimistic() {
        let (sync, store, remote) = service(FlushOnWrite::Never);
        let receipt = sync.create_item("  Buy milk ").await.unwrap();

        assert!(receipt.item.is_local());
        assert_eq!(receipt.item.title, "Buy milk");
        assert_eq!(receipt.storage_warning, None);
        assert!(store.get(&receipt.item.id).await.unwrap().is_some());
        assert_eq!(sync.status().await.pending, 1);
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_empty_title_rejected() {
        let (sync, _, _) = service(FlushOnWrite::Never);
        assert!(matches!(
            sync.create_item("   ").await,
            Err(SyncError::InvalidMutation(_))
        ));
    }

    #[tokio::test]
    async fn test_storage_failure_becomes_warning() {
        let (sync, store, _) = service(FlushOnWrite::Never);
        let item = sync.create_item("a").await.unwrap().item;

        store.set_fail_writes(true);
        let err = sync.toggle_item(&item.id).await.unwrap_err();
        // neither half persisted
        assert!(matches!(err, SyncError::StorageUnavailable(_)));

        let report = sync.storage_report().await;
        assert!(!report.healthy);
        assert!(report.warning.is_some());
    }

    #[tokio::test]
    async fn test_inline_flush_reconciles() {
        let (sync, store, remote) = service(FlushOnWrite::Inline);
        remote.assign_ids(["srv-9"]);
        let mut events = sync.subscribe();

        let receipt = sync.create_item("Walk dog").await.unwrap();
        assert!(store.get(&receipt.item.id).await.unwrap().is_none());
        assert!(store.get("srv-9").await.unwrap().is_some());

        let seen = events.drain();
        assert!(seen.contains(&SyncEvent::SyncComplete { synced: 1, total: 1 }));
        assert_eq!(seen.last(), Some(&SyncEvent::QueueDepthChanged(0)));
    }

    #[tokio::test]
    async fn test_settle_waits_for_background_flush() {
        let (sync, _, remote) = service(FlushOnWrite::Background);
        let receipt = sync.create_item("Buy milk").await.unwrap();
        // the write returns before the spawned flush has run
        assert!(receipt.item.is_local());

        sync.settle().await;
        assert_eq!(sync.status().await.pending, 0);
        let server = remote.items();
        assert_eq!(server.len(), 1);
        assert_eq!(server[0].title, "Buy milk");
        // nothing left to wait for
        sync.settle().await;
    }

    #[tokio::test]
    async fn test_toggle_missing_item() {
        let (sync, _, _) = service(FlushOnWrite::Never);
        assert!(matches!(
            sync.toggle_item("nope").await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_categories_need_network() {
        let (sync, _, remote) = service(FlushOnWrite::Never);
        remote.set_categories(vec![Category {
            id: "c1".into(),
            name: "Work".into(),
        }]);
        assert_eq!(sync.categories().await.unwrap().len(), 1);

        sync.set_online(false).await;
        assert!(matches!(
            sync.categories().await,
            Err(SyncError::NetworkUnavailable(_))
        ));
    }
}
