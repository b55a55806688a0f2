//! Offline-first sync core
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                      TodoSync                        │
//! │  write ──▶ DurableStore ──▶ MutationQueue ──▶ Remote │
//! │                 ▲                 ▲                  │
//! │  load ──▶ ReadCoordinator   ConnectivityMonitor      │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Local writes land in the store first and are replayed against the remote
//! side by the queue. Reads prefer the remote and fall back to the store.

pub mod coordinator;
pub mod queue;
pub mod service;

pub use coordinator::{LoadState, ReadCoordinator};
pub use queue::{FlushReport, MutationQueue, RetryPolicy};
pub use service::{StorageReport, SyncStatus, TodoSync, WriteReceipt};

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, MutexGuard};

/// Serializes store reconciliation between the queue, local writes and the
/// read path, and counts local changes so a slow `load()` can tell that the
/// store moved under it.
#[derive(Debug, Default)]
pub(crate) struct ReconcileGate {
    lock: Mutex<()>,
    generation: AtomicU64,
}

impl ReconcileGate {
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Enter to change the store
    pub(crate) async fn write(&self) -> MutexGuard<'_, ()> {
        let guard = self.lock.lock().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        guard
    }

    /// Enter to read a consistent store/queue snapshot
    pub(crate) async fn read(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}
