//! Read/Reconciliation Coordinator
//!
//! `load()` prefers the remote list and mirrors it into the store; on any
//! remote failure it serves whatever the store holds. It never returns an
//! error: the outcome is a [`LoadState`].

use super::{MutationQueue, ReconcileGate};
use crate::connectivity::OnlineState;
use crate::error::Result;
use crate::models::{Item, MutationKind, MutationRecord};
use crate::remote::RemoteClient;
use crate::store::DurableStore;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of a load
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    /// Fresh from the remote side, with pending local changes applied
    Remote(Vec<Item>),
    /// Remote unavailable; last-known-good local copy
    Cached { items: Vec<Item>, reason: String },
    /// Neither source could be read
    Failed { message: String },
}

impl LoadState {
    pub fn items(&self) -> &[Item] {
        match self {
            LoadState::Remote(items) | LoadState::Cached { items, .. } => items,
            LoadState::Failed { .. } => &[],
        }
    }

    pub fn into_items(self) -> Vec<Item> {
        match self {
            LoadState::Remote(items) | LoadState::Cached { items, .. } => items,
            LoadState::Failed { .. } => Vec::new(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, LoadState::Remote(_))
    }

    /// Message worth showing to the user, if any
    pub fn error(&self) -> Option<&str> {
        match self {
            LoadState::Failed { message } => Some(message),
            _ => None,
        }
    }
}

/// Pending local intent for one item
enum Intent {
    Upsert(Item),
    Removed,
}

pub struct ReadCoordinator {
    store: Arc<dyn DurableStore>,
    remote: Arc<dyn RemoteClient>,
    online: OnlineState,
    gate: Arc<ReconcileGate>,
}

impl ReadCoordinator {
    pub fn new(
        store: Arc<dyn DurableStore>,
        remote: Arc<dyn RemoteClient>,
        online: OnlineState,
    ) -> Self {
        Self {
            store,
            remote,
            online,
            gate: Arc::new(ReconcileGate::default()),
        }
    }

    /// Coordinator over the same store, remote and online flag as `queue`
    pub fn for_queue(queue: &MutationQueue) -> Self {
        Self {
            store: queue.store().clone(),
            remote: queue.remote().clone(),
            online: queue.online().clone(),
            gate: queue.gate().clone(),
        }
    }

    pub async fn load(&self) -> LoadState {
        if !self.online.is_online() {
            return self.cached("offline".to_string()).await;
        }

        let generation = self.gate.generation();
        let remote_items = match self.remote.list().await {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "remote list failed, using local copy");
                return self.cached(e.to_string()).await;
            }
        };

        let _gate = self.gate.read().await;
        let items = match self.merge_pending(remote_items.clone()).await {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "could not read pending mutations, serving remote list as-is");
                remote_items
            }
        };

        if self.gate.generation() != generation {
            // a flush or local write landed while the list was in flight;
            // its SyncComplete/QueueDepthChanged event prompts a reload
            debug!("store changed during load, not mirroring");
        } else if let Err(e) = self.store.replace_all(&items).await {
            warn!(error = %e, "could not mirror remote list into store");
        }

        info!(count = items.len(), "loaded todos from remote");
        LoadState::Remote(items)
    }

    async fn cached(&self, reason: String) -> LoadState {
        match self.store.get_all().await {
            Ok(items) => {
                debug!(count = items.len(), reason = %reason, "serving cached todos");
                LoadState::Cached { items, reason }
            }
            Err(e) => {
                warn!(error = %e, "local store unreadable");
                LoadState::Failed {
                    message: format!("Failed to load todos: {}; {}", reason, e),
                }
            }
        }
    }

    /// Overlay queued local changes on the remote list
    async fn merge_pending(&self, remote_items: Vec<Item>) -> Result<Vec<Item>> {
        let queue = self.store.list_queue().await?;
        if queue.is_empty() {
            return Ok(remote_items);
        }

        let local: HashMap<String, Item> = match self.store.get_all().await {
            Ok(items) => items.into_iter().map(|i| (i.id.clone(), i)).collect(),
            Err(e) => {
                warn!(error = %e, "local items unreadable, using queued payloads");
                HashMap::new()
            }
        };

        let intents = pending_intents(&queue, &local);
        let mut merged: Vec<Item> = Vec::with_capacity(remote_items.len());
        for item in remote_items {
            match intents.get(&item.id) {
                Some(Intent::Removed) => continue,
                Some(Intent::Upsert(local)) => merged.push(local.clone()),
                None => merged.push(item),
            }
        }

        // pending creates the remote has not seen yet; an update for an item
        // missing remotely does not bring it back
        for record in queue.iter().filter(|r| r.kind == MutationKind::Create) {
            if let Some(Intent::Upsert(item)) = intents.get(record.item_id()) {
                if !merged.iter().any(|m| m.id == item.id) {
                    merged.push(item.clone());
                }
            }
        }
        Ok(merged)
    }
}

/// Final intent per item after replaying the queue in order
fn pending_intents(
    queue: &[MutationRecord],
    local: &HashMap<String, Item>,
) -> HashMap<String, Intent> {
    let mut intents = HashMap::new();
    for record in queue {
        let id = record.item_id().to_string();
        let intent = match record.kind {
            MutationKind::Delete => Intent::Removed,
            MutationKind::Create | MutationKind::Update => {
                match local.get(&id).or_else(|| record.item()) {
                    Some(item) => Intent::Upsert(item.clone()),
                    None => continue,
                }
            }
        };
        intents.insert(id, intent);
    }
    intents
}
