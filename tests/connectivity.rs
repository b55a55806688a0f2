//! Connectivity monitor and session behaviour

use std::sync::Arc;
use std::time::Duration;
use todo_sync::connectivity::PollOutcome;
use todo_sync::remote::memory::RemoteCall;
use todo_sync::{
    FlushOnWrite, InMemoryRemote, LoadState, MemoryStore, SyncConfig, SyncEvent, TodoSync,
};
use tokio_util::sync::CancellationToken;

fn session(mode: FlushOnWrite) -> (TodoSync, Arc<InMemoryRemote>) {
    let mut config = SyncConfig::default();
    config.queue.flush_on_write = mode;
    config.connectivity.poll_interval_secs = 1;
    let remote = Arc::new(InMemoryRemote::new());
    let sync = TodoSync::new(
        config,
        Arc::new(MemoryStore::new()),
        remote.clone(),
        remote.clone(),
    );
    (sync, remote)
}

#[tokio::test]
async fn test_transitions_emit_once() {
    let (sync, _) = session(FlushOnWrite::Never);
    let mut events = sync.subscribe();

    assert!(sync.set_online(false).await.is_none());
    assert!(sync.set_online(false).await.is_none());
    sync.set_online(true).await;
    sync.set_online(true).await;

    let changes: Vec<_> = events
        .drain()
        .into_iter()
        .filter(|e| matches!(e, SyncEvent::ConnectivityChanged(_)))
        .collect();
    assert_eq!(
        changes,
        vec![
            SyncEvent::ConnectivityChanged(false),
            SyncEvent::ConnectivityChanged(true)
        ]
    );
}

#[tokio::test]
async fn test_offline_writes_flush_on_reconnect() {
    let (sync, remote) = session(FlushOnWrite::Inline);
    sync.set_online(false).await;

    let receipt = sync.create_item("Buy milk").await.unwrap();
    sync.toggle_item(&receipt.item.id).await.unwrap();
    assert!(remote.calls().is_empty());
    assert_eq!(sync.status().await.pending, 2);

    // offline reads come from the store
    let state = sync.load().await;
    assert!(matches!(state, LoadState::Cached { .. }));
    assert_eq!(state.items().len(), 1);

    let report = sync.set_online(true).await.unwrap();
    assert_eq!((report.synced, report.total), (2, 2));
    assert_eq!(
        remote.calls(),
        vec![
            RemoteCall::Create {
                title: "Buy milk".into()
            },
            RemoteCall::Update { id: "srv-1".into() },
        ]
    );

    let status = sync.status().await;
    assert_eq!(status.pending, 0);
    assert!(status.online);
    assert!(status.last_sync.is_some());

    // reconnecting again without going offline does nothing
    assert!(sync.set_online(true).await.is_none());

    let server = remote.items();
    assert_eq!(server.len(), 1);
    assert!(server[0].completed);
}

#[tokio::test]
async fn test_poll_detects_outage_and_recovery() {
    let (sync, remote) = session(FlushOnWrite::Never);
    sync.create_item("queued").await.unwrap();

    remote.set_reachable(false);
    assert_eq!(sync.monitor().poll_once().await, PollOutcome::WentOffline);
    assert!(!sync.is_online());

    remote.set_reachable(true);
    match sync.monitor().poll_once().await {
        PollOutcome::Flushed(report) => assert_eq!(report.synced, 1),
        other => panic!("expected a flush, got {other:?}"),
    }
    assert_eq!(sync.status().await.pending, 0);
}

#[tokio::test]
async fn test_poll_backstop_flushes_pending_queue() {
    let (sync, remote) = session(FlushOnWrite::Never);
    sync.create_item("missed transition").await.unwrap();

    // still online, no transition, but the queue is not empty
    match sync.monitor().poll_once().await {
        PollOutcome::Flushed(report) => assert_eq!(report.synced, 1),
        other => panic!("expected a flush, got {other:?}"),
    }
    assert_eq!(remote.items().len(), 1);
    assert_eq!(
        sync.monitor().poll_once().await,
        PollOutcome::Idle { online: true }
    );
}

#[tokio::test]
async fn test_background_poller_stops_on_cancel() {
    let (sync, remote) = session(FlushOnWrite::Never);
    sync.create_item("from poller").await.unwrap();

    let mut events = sync.subscribe();
    let cancel = CancellationToken::new();
    // first tick fires immediately
    let handle = sync.start(cancel.child_token());

    let deadline = tokio::time::timeout(Duration::from_secs(5), async {
        while remote.items().is_empty() {
            let _ = events.recv().await;
        }
    });
    deadline.await.unwrap();

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_zero_poll_interval_does_not_kill_poller() {
    let mut config = SyncConfig::default();
    config.connectivity.poll_interval_secs = 0;
    assert!(config.validate().is_err());

    // constructed directly, skipping validation
    let remote = Arc::new(InMemoryRemote::new());
    let sync = TodoSync::new(config, Arc::new(MemoryStore::new()), remote.clone(), remote);
    assert_eq!(sync.monitor().poll_interval(), Duration::from_secs(1));

    let cancel = CancellationToken::new();
    let handle = sync.start(cancel.child_token());
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}
