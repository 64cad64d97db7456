//! Connectivity monitoring.
//!
//! Device-level online/offline signals are optimistic: the OS can report
//! "online" while the API is unreachable. The monitor therefore treats those
//! signals as hints that trigger an immediate reachability probe, and only
//! the probe result feeds the debounced state. A transition to offline is
//! reported only after signal loss persists past a grace window, so a
//! momentary blip does not abort a sync pass.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::Instant;

/// Reachability check against the remote API's health endpoint.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn reachable(&self) -> bool;
}

/// Debounced connectivity state transition logic.
///
/// Pure with respect to time: callers feed in observations with an explicit
/// `now`, which keeps the transition rules testable without timers.
#[derive(Debug)]
pub(crate) struct Debounce {
    grace: Duration,
    online: bool,
    offline_since: Option<Instant>,
}

impl Debounce {
    pub(crate) fn new(grace: Duration, initially_online: bool) -> Self {
        Self {
            grace,
            online: initially_online,
            offline_since: None,
        }
    }

    /// Feed one reachability observation. Returns `Some(state)` when the
    /// reported state transitions.
    pub(crate) fn observe(&mut self, reachable: bool, now: Instant) -> Option<bool> {
        if reachable {
            self.offline_since = None;
            if !self.online {
                self.online = true;
                return Some(true);
            }
            return None;
        }

        let since = *self.offline_since.get_or_insert(now);
        if self.online && now.duration_since(since) >= self.grace {
            self.online = false;
            return Some(false);
        }
        None
    }

    /// Deadline at which a pending offline suspicion matures and a re-probe
    /// is due.
    pub(crate) fn recheck_deadline(&self) -> Option<Instant> {
        match self.offline_since {
            Some(since) if self.online => Some(since + self.grace),
            _ => None,
        }
    }
}

/// Observes online/offline transitions by combining a periodic reachability
/// probe with externally supplied hints.
pub struct ConnectivityMonitor {
    online_rx: watch::Receiver<bool>,
    hint_tx: mpsc::UnboundedSender<bool>,
    shutdown: Arc<Notify>,
}

impl ConnectivityMonitor {
    /// Spawn the monitor task. The state starts optimistic (online) and is
    /// corrected by the first probe.
    pub fn spawn(
        probe: Arc<dyn ReachabilityProbe>,
        probe_interval: Duration,
        offline_grace: Duration,
    ) -> Self {
        let (watch_tx, online_rx) = watch::channel(true);
        let (hint_tx, mut hint_rx) = mpsc::unbounded_channel::<bool>();
        let shutdown = Arc::new(Notify::new());

        let task_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut debounce = Debounce::new(offline_grace, true);
            let mut interval = tokio::time::interval(probe_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                let recheck = debounce.recheck_deadline();
                tokio::select! {
                    _ = task_shutdown.notified() => break,
                    hint = hint_rx.recv() => {
                        match hint {
                            // A hint in either direction triggers an immediate
                            // probe; the device's own claim is never trusted.
                            Some(_) => {}
                            None => break,
                        }
                    }
                    _ = interval.tick() => {}
                    _ = sleep_until_opt(recheck) => {}
                }

                let reachable = probe.reachable().await;
                if let Some(online) = debounce.observe(reachable, Instant::now()) {
                    tracing::info!(online, "connectivity transition");
                    let _ = watch_tx.send(online);
                }
            }
        });

        Self {
            online_rx,
            hint_tx,
            shutdown,
        }
    }

    /// Current reported state.
    pub fn is_online(&self) -> bool {
        *self.online_rx.borrow()
    }

    /// Subscribe to transitions in either direction.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.online_rx.clone()
    }

    /// Feed a device-level connectivity signal (a hint, not ground truth).
    pub fn hint_online(&self, online: bool) {
        let _ = self.hint_tx.send(online);
    }

    /// Stop the monitor task.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
