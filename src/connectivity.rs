//! Connectivity Monitor
//!
//! Owns the online/offline flag shared with the mutation queue. Platform
//! signals arrive through [`ConnectivityMonitor::set_online`]; a coarse poll
//! of a [`ConnectivityProbe`] backs them up in case a transition was missed.
//!
//! ```rust,ignore
//! let cancel = CancellationToken::new();
//! tokio::spawn({
//!     let monitor = monitor.clone();
//!     let cancel = cancel.child_token();
//!     async move { monitor.run(cancel).await }
//! });
//! ```

use crate::events::{EventBus, SyncEvent};
use crate::sync::{FlushReport, MutationQueue};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shortest poll period the monitor accepts
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Shared online flag
#[derive(Debug, Clone)]
pub struct OnlineState(Arc<AtomicBool>);

impl OnlineState {
    pub fn new(online: bool) -> Self {
        Self(Arc::new(AtomicBool::new(online)))
    }

    pub fn is_online(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Store the new value; returns whether it changed
    pub fn set(&self, online: bool) -> bool {
        self.0.swap(online, Ordering::SeqCst) != online
    }
}

impl Default for OnlineState {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Capability probe for connectivity. `None` means "can't tell".
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self) -> Option<bool>;
}

/// Probe that issues a GET against the API base URL
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> crate::error::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn probe(&self) -> Option<bool> {
        match self.client.get(&self.url).send().await {
            // any answer at all means the network path works
            Ok(_) => Some(true),
            Err(e) if e.is_connect() || e.is_timeout() => Some(false),
            Err(e) => {
                debug!(error = %e, "connectivity probe inconclusive");
                None
            }
        }
    }
}

/// What one poll tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Probe could not tell; state left alone
    Unknown,
    /// State unchanged and nothing to flush
    Idle { online: bool },
    /// A flush ran, either after a transition or as the backstop
    Flushed(FlushReport),
    /// Went offline
    WentOffline,
}

pub struct ConnectivityMonitor {
    online: OnlineState,
    queue: Arc<MutationQueue>,
    events: EventBus,
    probe: Arc<dyn ConnectivityProbe>,
    poll_interval: Duration,
}

impl ConnectivityMonitor {
    pub fn new(
        online: OnlineState,
        queue: Arc<MutationQueue>,
        events: EventBus,
        probe: Arc<dyn ConnectivityProbe>,
        poll_interval: Duration,
    ) -> Self {
        if poll_interval < MIN_POLL_INTERVAL {
            warn!(
                requested_ms = poll_interval.as_millis() as u64,
                "poll interval too short, using {}s",
                MIN_POLL_INTERVAL.as_secs()
            );
        }
        Self {
            online,
            queue,
            events,
            probe,
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.is_online()
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Apply a platform connectivity signal.
    ///
    /// Emits `ConnectivityChanged` on transitions only. Going online flushes
    /// the queue once; if a flush is already running the request is folded
    /// into a follow-up pass of that flush.
    pub async fn set_online(&self, online: bool) -> Option<FlushReport> {
        if !self.online.set(online) {
            return None;
        }

        info!(online, "connectivity changed");
        self.events.emit(SyncEvent::ConnectivityChanged(online));

        if online {
            Some(self.queue.flush().await)
        } else {
            None
        }
    }

    /// Probe once and act on the answer
    pub async fn poll_once(&self) -> PollOutcome {
        let Some(online) = self.probe.probe().await else {
            return PollOutcome::Unknown;
        };

        let was_online = self.online.is_online();
        if let Some(report) = self.set_online(online).await {
            return PollOutcome::Flushed(report);
        }
        if was_online && !online {
            return PollOutcome::WentOffline;
        }

        // backstop for missed transition events
        if online && !self.queue.is_flushing() {
            let pending = self.queue.pending().await.unwrap_or(0);
            if pending > 0 {
                debug!(pending, "backstop flush");
                return PollOutcome::Flushed(self.queue.flush().await);
            }
        }
        PollOutcome::Idle { online }
    }

    /// Poll until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        info!(interval_secs = self.poll_interval.as_secs(), "connectivity monitor started");
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("connectivity monitor stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let outcome = self.poll_once().await;
                    debug!(?outcome, "connectivity poll");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_online_state_reports_changes() {
        let state = OnlineState::new(false);
        assert!(!state.set(false));
        assert!(state.set(true));
        assert!(state.is_online());
        assert!(!state.set(true));

        let shared = state.clone();
        shared.set(false);
        assert!(!state.is_online());
    }
}
