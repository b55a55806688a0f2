//! Todo Sync - offline-first synchronization core for a todo list
//!
//! Local writes are applied to a durable store right away and recorded in a
//! mutation queue, which is replayed against the remote API whenever
//! connectivity allows. Reads prefer the remote list and fall back to the
//! store.

pub mod config;
pub mod connectivity;
pub mod error;
pub mod events;
pub mod models;
pub mod remote;
pub mod store;
pub mod sync;

pub use config::{FlushOnWrite, SyncConfig};
pub use connectivity::{ConnectivityMonitor, ConnectivityProbe, HttpProbe, OnlineState};
pub use error::{Result, SyncError};
pub use events::{EventBus, Subscription, SyncEvent};
pub use models::{Category, Item, MutationKind, MutationPayload, MutationRecord, NewItem};
pub use remote::{HttpRemote, InMemoryRemote, RemoteClient};
pub use store::{DurableStore, MemoryStore, SqliteStore, StorageEstimate};
pub use sync::{
    FlushReport, LoadState, MutationQueue, ReadCoordinator, RetryPolicy, StorageReport,
    SyncStatus, TodoSync, WriteReceipt,
};
