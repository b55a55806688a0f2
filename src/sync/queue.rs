//! Mutation Queue Manager
//!
//! Appends mutation records and replays them against the remote side in
//! enqueue order. A record leaves the queue only after the remote confirmed
//! it and the matching local reconciliation was written, so a crash mid-flush
//! never loses a pending mutation (delivery is at-least-once).
//!
//! Failure handling per record:
//! - `NetworkUnavailable`: stays queued untouched
//! - transient `RequestFailed`: attempt charged, exponential backoff
//! - permanent errors or exhausted attempts: moved to the dead-letter store
//!
//! Once a record for an item fails or is deferred, later records for the same
//! item wait for the next pass so they are never replayed out of order.

use super::ReconcileGate;
use crate::config::QueueConfig;
use crate::connectivity::OnlineState;
use crate::error::{Result, SyncError};
use crate::events::{EventBus, SyncEvent};
use crate::models::{Item, MutationKind, MutationPayload, MutationRecord};
use crate::remote::RemoteClient;
use crate::store::DurableStore;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Retry policy for failed mutations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed attempts before a record is dead-lettered
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Retry on every flush, no backoff
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_base: Duration::ZERO,
            backoff_max: Duration::ZERO,
        }
    }

    /// Delay before the next attempt after `attempts` failures:
    /// `base * 2^(attempts - 1)`, capped at `backoff_max`
    pub fn delay_for(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempts - 1).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

/// Why a flush did not run a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushSkip {
    Offline,
    /// Another flush was running; it picks up a follow-up pass instead
    Coalesced,
}

/// Outcome of a flush. Counts are summed over follow-up passes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Records confirmed by the remote and removed from the queue
    pub synced: usize,
    /// Queue length at the start of the pass
    pub total: usize,
    /// Records that failed and stay queued
    pub failed: usize,
    /// Records held back by backoff or by an earlier failure for the same item
    pub deferred: usize,
    pub dead_lettered: usize,
    pub passes: usize,
    pub skipped: Option<FlushSkip>,
}

impl FlushReport {
    fn skipped(reason: FlushSkip) -> Self {
        Self {
            skipped: Some(reason),
            ..Default::default()
        }
    }

    fn absorb(&mut self, pass: FlushReport) {
        self.synced += pass.synced;
        self.total += pass.total;
        self.failed += pass.failed;
        self.deferred += pass.deferred;
        self.dead_lettered += pass.dead_lettered;
        self.passes += pass.passes;
    }

    /// Records still queued after the flush
    pub fn remaining(&self) -> usize {
        self.failed + self.deferred
    }
}

#[derive(Debug, Clone, Default)]
struct QueueStats {
    last_sync: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// Remote result of one record
enum Applied {
    Created(Item),
    Updated(Item),
    Deleted,
}

/// Clears the in-flight flag however the flush ends
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct MutationQueue {
    store: Arc<dyn DurableStore>,
    remote: Arc<dyn RemoteClient>,
    events: EventBus,
    online: OnlineState,
    policy: RetryPolicy,
    gate: Arc<ReconcileGate>,
    flushing: AtomicBool,
    rerun_requested: AtomicBool,
    stats: RwLock<QueueStats>,
}

impl MutationQueue {
    pub fn new(
        store: Arc<dyn DurableStore>,
        remote: Arc<dyn RemoteClient>,
        events: EventBus,
        online: OnlineState,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            remote,
            events,
            online,
            policy,
            gate: Arc::new(ReconcileGate::default()),
            flushing: AtomicBool::new(false),
            rerun_requested: AtomicBool::new(false),
            stats: RwLock::new(QueueStats::default()),
        }
    }

    pub(crate) fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    pub(crate) fn remote(&self) -> &Arc<dyn RemoteClient> {
        &self.remote
    }

    pub(crate) fn online(&self) -> &OnlineState {
        &self.online
    }

    pub(crate) fn gate(&self) -> &Arc<ReconcileGate> {
        &self.gate
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::SeqCst)
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.stats.read().last_sync
    }

    pub fn last_error(&self) -> Option<String> {
        self.stats.read().last_error.clone()
    }

    /// Append a mutation. Never touches the network.
    pub async fn enqueue(
        &self,
        kind: MutationKind,
        payload: MutationPayload,
        local_id: Option<String>,
    ) -> Result<MutationRecord> {
        let record = MutationRecord::new(kind, payload, local_id)?;
        {
            let _gate = self.gate.write().await;
            self.append(&record).await?;
        }
        Ok(record)
    }

    /// Append without taking the reconcile gate; the caller holds it
    pub(crate) async fn append(&self, record: &MutationRecord) -> Result<()> {
        self.store.enqueue(record).await?;
        debug!(
            mutation_id = %record.id,
            kind = %record.kind,
            item_id = record.item_id(),
            "enqueued mutation"
        );
        self.emit_depth().await;
        Ok(())
    }

    /// Pending records in replay order
    pub async fn list(&self) -> Result<Vec<MutationRecord>> {
        self.store.list_queue().await
    }

    pub async fn pending(&self) -> Result<usize> {
        self.store.queue_len().await
    }

    pub async fn clear(&self) -> Result<()> {
        {
            let _gate = self.gate.write().await;
            self.store.clear_queue().await?;
        }
        info!("sync queue cleared");
        self.emit_depth().await;
        Ok(())
    }

    pub async fn dead_letters(&self) -> Result<Vec<MutationRecord>> {
        self.store.list_dead_letters().await
    }

    /// Give dead letters a fresh retry budget at the end of the queue
    pub async fn requeue_dead_letters(&self) -> Result<usize> {
        let moved = {
            let _gate = self.gate.write().await;
            self.store.requeue_dead_letters().await?
        };
        if moved > 0 {
            info!(moved, "requeued dead letters");
            self.emit_depth().await;
        }
        Ok(moved)
    }

    /// Drain the queue against the remote side.
    ///
    /// No-op while offline. At most one flush runs at a time; a call that
    /// arrives during a flush makes the running one do another pass.
    pub async fn flush(&self) -> FlushReport {
        let mut report = FlushReport::default();
        loop {
            if !self.online.is_online() {
                debug!("offline, flush skipped");
                if report.passes == 0 {
                    report = FlushReport::skipped(FlushSkip::Offline);
                }
                return report;
            }

            if self
                .flushing
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                self.rerun_requested.store(true, Ordering::SeqCst);
                debug!("flush in progress, coalesced into a follow-up pass");
                if report.passes == 0 {
                    report = FlushReport::skipped(FlushSkip::Coalesced);
                }
                return report;
            }

            {
                let _guard = FlushGuard(&self.flushing);
                loop {
                    self.rerun_requested.store(false, Ordering::SeqCst);
                    report.absorb(self.run_pass().await);
                    if !self.rerun_requested.load(Ordering::SeqCst) || !self.online.is_online() {
                        break;
                    }
                    debug!("running follow-up pass");
                }
            }

            // a request can slip in between the last check and the guard drop
            if !self.rerun_requested.swap(false, Ordering::SeqCst) {
                return report;
            }
        }
    }

    async fn run_pass(&self) -> FlushReport {
        let records = match self.store.list_queue().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "could not read sync queue");
                self.stats.write().last_error = Some(e.to_string());
                return FlushReport {
                    passes: 1,
                    ..Default::default()
                };
            }
        };

        let mut report = FlushReport {
            total: records.len(),
            passes: 1,
            ..Default::default()
        };
        if records.is_empty() {
            return report;
        }

        info!(total = report.total, "flushing sync queue");
        let now = Utc::now();
        let mut held: HashSet<String> = HashSet::new();
        let mut reconciled: HashMap<String, String> = HashMap::new();
        let mut last_error = None;

        for mut record in records {
            // the store copy was retargeted already, this is the in-pass copy
            if let Some(server_id) = reconciled.get(record.item_id()).cloned() {
                let local_id = record.item_id().to_string();
                record.retarget(&local_id, &server_id);
            }

            let item_id = record.item_id().to_string();
            if held.contains(&item_id) {
                debug!(mutation_id = %record.id, %item_id, "held behind earlier mutation");
                report.deferred += 1;
                continue;
            }
            if !record.is_due(now) {
                debug!(mutation_id = %record.id, %item_id, "backing off");
                held.insert(item_id);
                report.deferred += 1;
                continue;
            }

            match self.apply(&record).await {
                Ok(applied) => match self.commit(&record, applied).await {
                    Ok(server_id) => {
                        report.synced += 1;
                        if let Some(server_id) = server_id {
                            reconciled.insert(item_id, server_id);
                        }
                    }
                    Err(e) => {
                        warn!(
                            mutation_id = %record.id,
                            error = %e,
                            "remote confirmed but local commit failed"
                        );
                        last_error = Some(e.to_string());
                        held.insert(item_id);
                        report.failed += 1;
                    }
                },
                Err(e) => {
                    last_error = Some(e.to_string());
                    held.insert(item_id);
                    self.record_failure(record, e, &mut report).await;
                }
            }
        }

        {
            let mut stats = self.stats.write();
            stats.last_sync = Some(Utc::now());
            stats.last_error = last_error;
        }

        info!(
            synced = report.synced,
            total = report.total,
            failed = report.failed,
            deferred = report.deferred,
            dead_lettered = report.dead_lettered,
            "flush pass complete"
        );
        self.events.emit(SyncEvent::SyncComplete {
            synced: report.synced,
            total: report.total,
        });
        self.emit_depth().await;
        report
    }

    /// Send one record to the remote side
    async fn apply(&self, record: &MutationRecord) -> Result<Applied> {
        debug!(mutation_id = %record.id, kind = %record.kind, item_id = record.item_id(), "replaying");
        match record.kind {
            MutationKind::Create => {
                let item = payload_item(record)?;
                Ok(Applied::Created(self.remote.create(&item.as_new()).await?))
            }
            MutationKind::Update => {
                let item = payload_item(record)?;
                Ok(Applied::Updated(self.remote.update(item).await?))
            }
            MutationKind::Delete => match self.remote.delete(record.item_id()).await {
                Ok(()) => Ok(Applied::Deleted),
                // already gone remotely, which is what we wanted
                Err(SyncError::NotFound(_)) => {
                    debug!(item_id = record.item_id(), "delete target already gone");
                    Ok(Applied::Deleted)
                }
                Err(e) => Err(e),
            },
        }
    }

    /// Remote confirm -> local reconciliation -> queue removal.
    /// Returns the server id when a create replaced a local id.
    async fn commit(&self, record: &MutationRecord, applied: Applied) -> Result<Option<String>> {
        let _gate = self.gate.write().await;

        let server_id = match applied {
            Applied::Created(server_item) => self.reconcile_create(record, server_item).await?,
            Applied::Updated(server_item) => {
                self.reconcile_update(record, server_item).await?;
                None
            }
            Applied::Deleted => {
                self.store.delete(record.item_id()).await?;
                None
            }
        };

        self.store.remove_from_queue(&record.id).await?;
        Ok(server_id)
    }

    async fn reconcile_create(
        &self,
        record: &MutationRecord,
        server_item: Item,
    ) -> Result<Option<String>> {
        let local_id = record
            .local_id
            .clone()
            .unwrap_or_else(|| record.item_id().to_string());
        let server_id = server_item.id.clone();

        match self.store.get(&local_id).await? {
            Some(local) => {
                let mut merged = server_item;
                // edits made while the create was in flight win
                if record.item().map_or(false, |sent| local.updated_at > sent.updated_at) {
                    merged.title = local.title;
                    merged.completed = local.completed;
                    merged.updated_at = local.updated_at.max(merged.created_at);
                }
                if local_id != server_id {
                    self.store.delete(&local_id).await?;
                }
                self.store.put(&merged).await?;
            }
            None => {
                let removed_locally = self
                    .store
                    .list_queue()
                    .await?
                    .iter()
                    .any(|r| r.kind == MutationKind::Delete && r.item_id() == local_id);
                if removed_locally {
                    debug!(%local_id, "item deleted locally before its create synced");
                } else {
                    self.store.put(&server_item).await?;
                }
            }
        }

        if local_id == server_id {
            return Ok(None);
        }
        let moved = self.store.retarget_queue(&local_id, &server_id).await?;
        debug!(%local_id, %server_id, moved, "reconciled identifier");
        Ok(Some(server_id))
    }

    async fn reconcile_update(&self, record: &MutationRecord, server_item: Item) -> Result<()> {
        match self.store.get(record.item_id()).await? {
            Some(local)
                if record
                    .item()
                    .map_or(true, |sent| local.updated_at <= sent.updated_at) =>
            {
                self.store.put(&server_item).await?;
            }
            Some(_) => debug!(item_id = record.item_id(), "newer local edit pending"),
            None => debug!(item_id = record.item_id(), "item removed locally"),
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        mut record: MutationRecord,
        error: SyncError,
        report: &mut FlushReport,
    ) {
        if error.is_offline() {
            debug!(mutation_id = %record.id, error = %error, "network unavailable, left queued");
            report.failed += 1;
            return;
        }

        record.attempts += 1;
        record.last_error = Some(error.to_string());

        if error.is_permanent() || record.attempts >= self.policy.max_attempts {
            warn!(
                mutation_id = %record.id,
                item_id = record.item_id(),
                kind = %record.kind,
                attempts = record.attempts,
                error = %error,
                "moving mutation to dead letters"
            );
            let moved = {
                let _gate = self.gate.write().await;
                self.store.dead_letter(&record).await
            };
            match moved {
                Ok(()) => {
                    report.dead_lettered += 1;
                    self.events.emit(SyncEvent::MutationDeadLettered {
                        mutation_id: record.id.clone(),
                        item_id: record.item_id().to_string(),
                        error: error.to_string(),
                    });
                }
                Err(e) => {
                    warn!(mutation_id = %record.id, error = %e, "could not dead-letter mutation");
                    report.failed += 1;
                }
            }
            return;
        }

        let delay = self.policy.delay_for(record.attempts);
        record.next_attempt_at = if delay.is_zero() {
            None
        } else {
            chrono::Duration::from_std(delay)
                .ok()
                .map(|d| Utc::now() + d)
        };
        debug!(
            mutation_id = %record.id,
            attempts = record.attempts,
            retry_in_ms = delay.as_millis() as u64,
            error = %error,
            "mutation failed, will retry"
        );
        if let Err(e) = self.store.update_queue_record(&record).await {
            warn!(mutation_id = %record.id, error = %e, "could not persist retry state");
        }
        report.failed += 1;
    }

    async fn emit_depth(&self) {
        match self.store.queue_len().await {
            Ok(depth) => self.events.emit(SyncEvent::QueueDepthChanged(depth)),
            Err(e) => warn!(error = %e, "could not read queue depth"),
        }
    }
}

fn payload_item(record: &MutationRecord) -> Result<&Item> {
    record.item().ok_or_else(|| {
        SyncError::InvalidMutation(format!("{} of {} has no item payload", record.kind, record.item_id()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::{InMemoryRemote, RemoteCall};
    use crate::store::MemoryStore;

    fn queue_with(remote: Arc<InMemoryRemote>, policy: RetryPolicy) -> (MutationQueue, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let queue = MutationQueue::new(
            store.clone(),
            remote,
            EventBus::new(),
            OnlineState::new(true),
            policy,
        );
        (queue, store)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(60),
        };
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(5), Duration::from_secs(32));
        assert_eq!(policy.delay_for(6), Duration::from_secs(60));
        assert_eq!(policy.delay_for(200), Duration::from_secs(60));
        assert_eq!(RetryPolicy::immediate(3).delay_for(4), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_offline_flush_is_noop() {
        let remote = Arc::new(InMemoryRemote::new());
        let (queue, _store) = queue_with(remote.clone(), RetryPolicy::immediate(3));
        queue.online().set(false);
        queue
            .enqueue(MutationKind::Delete, MutationPayload::Id { id: "1".into() }, None)
            .await
            .unwrap();

        let report = queue.flush().await;
        assert_eq!(report.skipped, Some(FlushSkip::Offline));
        assert!(remote.calls().is_empty());
        assert_eq!(queue.pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_backoff_defers_record_and_followers() {
        let remote = Arc::new(InMemoryRemote::new());
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_base: Duration::from_secs(60),
            backoff_max: Duration::from_secs(600),
        };
        let (queue, _store) = queue_with(remote.clone(), policy);

        let item = Item::new_local("a");
        queue.append(&MutationRecord::create(item.clone())).await.unwrap();
        queue.append(&MutationRecord::delete(item.id.clone())).await.unwrap();
        remote.fail_next(
            crate::remote::memory::RemoteOp::Create,
            SyncError::RequestFailed { status: Some(503), message: "busy".into() },
        );

        let first = queue.flush().await;
        assert_eq!(first.failed, 1);
        assert_eq!(first.deferred, 1);

        let records = queue.list().await.unwrap();
        assert_eq!(records[0].attempts, 1);
        assert!(records[0].next_attempt_at.is_some());

        // still backing off: nothing goes out
        remote.clear_calls();
        let second = queue.flush().await;
        assert_eq!(second.deferred, 2);
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_delete_of_missing_remote_item_succeeds() {
        let remote = Arc::new(InMemoryRemote::new());
        let (queue, _store) = queue_with(remote.clone(), RetryPolicy::immediate(3));
        queue.append(&MutationRecord::delete("gone")).await.unwrap();

        let report = queue.flush().await;
        assert_eq!(report.synced, 1);
        assert_eq!(remote.calls(), vec![RemoteCall::Delete { id: "gone".into() }]);
        assert_eq!(queue.pending().await.unwrap(), 0);
    }
}
