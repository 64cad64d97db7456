//! Public facade of the offline sync engine.
//!
//! `OfflineEngine` is the single surface consumed by the rendering layer:
//! read-only derived state (`is_online`, `pending_actions`, `is_syncing`,
//! `last_sync_at`, `should_show_offline_indicator`) plus the explicit
//! commands (`submit`, `force_sync`, `clear_pending_actions`,
//! `storage_info`). The engine is constructed explicitly with its
//! collaborators injected — no module-level singleton — so tests and the
//! application composition root can own as many independent instances as
//! they need. The UI is just one subscriber of the event bus among possibly
//! several.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use fablink_core::ActionId;
use fablink_events::{InMemoryEventBus, Subscription};

use crate::action::{ActionKind, EntityKey, PendingAction};
use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityMonitor, ReachabilityProbe};
use crate::coordinator::{PassOutcome, PhaseEvent, SyncCoordinator};
use crate::store::{ActionStore, StorageInfo, StoreError};
use crate::transport::RemoteApi;

/// A user mutation handed to the engine.
#[derive(Debug, Clone)]
pub struct MutationRequest {
    pub kind: ActionKind,
    pub entity: EntityKey,
    pub payload: Value,
    pub signature: Option<String>,
    pub optimistic: Option<Value>,
}

impl MutationRequest {
    pub fn new(kind: ActionKind, entity: EntityKey, payload: Value) -> Self {
        Self {
            kind,
            entity,
            payload,
            signature: None,
            optimistic: None,
        }
    }

    /// Dedup key: a later submit with the same signature replaces the queued
    /// payload instead of appending (e.g. a debounced text field).
    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    /// JSON merge patch applied to the local read model while the action is
    /// pending.
    pub fn with_optimistic(mut self, patch: Value) -> Self {
        self.optimistic = Some(patch);
        self
    }
}

/// Notification published on the engine's event bus.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    ConnectivityChanged { online: bool },
    ActionEnqueued { id: ActionId, replaced_previous: bool },
    ActionSynced { id: ActionId },
    ActionFailed { id: ActionId, error: String },
    ActionAbandoned { id: ActionId, error: String, rolled_back: bool },
    ActionDiscarded { id: ActionId },
    SyncStarted,
    SyncCompleted { synced: usize, failed: usize, abandoned: usize },
    SyncAborted { synced: usize },
    QueueCleared { discarded: usize },
}

/// Point-in-time view of the engine, bundled for a render cycle.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub is_online: bool,
    pub pending_actions: Vec<PendingAction>,
    pub is_syncing: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub should_show_offline_indicator: bool,
}

/// Failure submitting a mutation to the engine.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The durable store is at capacity. Surfaced immediately; the engine
    /// never drops older actions to make room.
    #[error("offline action storage is full (capacity {capacity}); sync or discard pending actions first")]
    StorageFull { capacity: usize },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure of a per-action user command.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unknown action: {0}")]
    UnknownAction(ActionId),
    #[error("action {0} is not awaiting user resolution")]
    NotRestartable(ActionId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The offline-first sync engine.
pub struct OfflineEngine {
    coordinator: Arc<SyncCoordinator>,
    monitor: ConnectivityMonitor,
    force: Arc<Notify>,
    restart_failed_requested: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl OfflineEngine {
    /// Rehydrate from the store and start the background worker and
    /// connectivity monitor.
    pub async fn start(
        config: SyncConfig,
        store: Arc<dyn ActionStore>,
        api: Arc<dyn RemoteApi>,
        probe: Arc<dyn ReachabilityProbe>,
    ) -> Result<Self, StoreError> {
        let bus = Arc::new(InMemoryEventBus::new());
        let coordinator = Arc::new(
            SyncCoordinator::initialize(config.clone(), store, api, bus).await?,
        );
        let monitor =
            ConnectivityMonitor::spawn(probe, config.probe_interval, config.offline_grace);

        let force = Arc::new(Notify::new());
        let restart_failed_requested = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(Notify::new());

        let worker = tokio::spawn(run_worker(
            coordinator.clone(),
            monitor.subscribe(),
            force.clone(),
            restart_failed_requested.clone(),
            shutdown.clone(),
        ));

        Ok(Self {
            coordinator,
            monitor,
            force,
            restart_failed_requested,
            shutdown,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn is_online(&self) -> bool {
        self.monitor.is_online()
    }

    pub fn pending_actions(&self) -> Vec<PendingAction> {
        self.coordinator.pending_actions()
    }

    pub fn is_syncing(&self) -> bool {
        self.coordinator.is_syncing()
    }

    /// Timestamp of the last fully drained sync pass.
    pub fn last_sync_at(&self) -> Option<DateTime<Utc>> {
        self.coordinator.last_sync_at()
    }

    /// True iff offline, or actions are pending, or a sync pass is running.
    pub fn should_show_offline_indicator(&self) -> bool {
        self.snapshot().should_show_offline_indicator
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let is_online = self.monitor.is_online();
        let pending_actions = self.coordinator.pending_actions();
        let is_syncing = self.coordinator.is_syncing();
        EngineSnapshot {
            should_show_offline_indicator: !is_online
                || !pending_actions.is_empty()
                || is_syncing,
            is_online,
            pending_actions,
            is_syncing,
            last_sync_at: self.coordinator.last_sync_at(),
        }
    }

    /// Subscribe to engine notifications.
    pub fn subscribe(&self) -> Subscription<EngineEvent> {
        self.coordinator.subscribe()
    }

    /// Submit a mutation. The action is durably queued (and optimistically
    /// applied) regardless of connectivity; syncing happens in the
    /// background.
    pub async fn submit(&self, request: MutationRequest) -> Result<PendingAction, SubmitError> {
        self.coordinator.enqueue(request).await
    }

    /// Start a sync pass now: cancels any backoff wait and restarts failed
    /// actions with a fresh attempt budget (the user's gesture is the
    /// acknowledgement). A call while a pass is already running does not
    /// queue a duplicate pass. Attempts of queued actions are not reset.
    pub fn force_sync(&self) {
        self.restart_failed_requested.store(true, Ordering::SeqCst);
        self.force.notify_one();
    }

    /// Feed a device-level connectivity signal (hint, not ground truth).
    pub fn hint_online(&self, online: bool) {
        self.monitor.hint_online(online);
    }

    /// Discard every pending action, of any status. Destructive; only call
    /// from an explicit, user-acknowledged gesture.
    pub async fn clear_pending_actions(&self) -> Result<usize, StoreError> {
        self.coordinator.clear_all().await
    }

    /// Occupancy of the durable store, for UI diagnostics.
    pub async fn storage_info(&self) -> Result<StorageInfo, StoreError> {
        self.coordinator.storage_info().await
    }

    /// Restart a single failed/abandoned action (edit-and-resubmit path).
    pub async fn retry_action(&self, id: ActionId) -> Result<(), EngineError> {
        self.coordinator.retry_action(id).await
    }

    /// Remove a single action and roll back its optimistic effect.
    pub async fn discard_action(&self, id: ActionId) -> Result<(), EngineError> {
        self.coordinator.discard_action(id).await
    }

    /// Optimistic view of an entity's read model.
    pub fn read_model(&self, entity: &EntityKey) -> Option<Value> {
        self.coordinator.read_model(entity)
    }

    /// Prime the server-confirmed snapshot for an entity (e.g. after a
    /// regular fetch outside the engine).
    pub fn seed_read_model(&self, entity: EntityKey, body: Value) {
        self.coordinator.seed_read_model(entity, body);
    }

    /// Stop the background worker and the connectivity monitor.
    pub async fn shutdown(&self) {
        self.shutdown.notify_one();
        self.monitor.shutdown();
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Background loop owning the sync schedule.
///
/// Passes start on reconnect, on the periodic timer (suspended while
/// offline) and on `force_sync`. At most one pass runs at a time; backoff
/// waits happen here so they can be cut short by `force_sync` or abandoned
/// when connectivity drops.
async fn run_worker(
    coordinator: Arc<SyncCoordinator>,
    mut online_rx: watch::Receiver<bool>,
    force: Arc<Notify>,
    restart_failed_requested: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
) {
    let mut interval = tokio::time::interval(coordinator.config().sync_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        let online_now = *online_rx.borrow();
        let trigger = tokio::select! {
            _ = shutdown.notified() => break,
            _ = force.notified() => Some(PhaseEvent::ForceSync),
            _ = interval.tick(), if online_now => Some(PhaseEvent::IntervalElapsed),
            changed = online_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let online = *online_rx.borrow();
                coordinator.publish(EngineEvent::ConnectivityChanged { online });
                if online {
                    // Reconnect: restart the suspended timer and sync
                    // immediately instead of waiting for the next tick.
                    interval.reset();
                    Some(PhaseEvent::CameOnline)
                } else {
                    None
                }
            }
        };

        let Some(trigger) = trigger else { continue };

        if restart_failed_requested.swap(false, Ordering::SeqCst) {
            let restarted = coordinator.restart_failed().await;
            if restarted > 0 {
                tracing::info!(restarted, "failed actions restarted by force_sync");
            }
        }

        // No sync attempt is ever made while offline, forced or not.
        if !*online_rx.borrow() {
            continue;
        }

        if drive_passes(
            &coordinator,
            &online_rx,
            &force,
            &restart_failed_requested,
            &shutdown,
            trigger,
        )
        .await
            == DriveEnd::Shutdown
        {
            break;
        }
    }

    tracing::debug!("sync worker stopped");
}

#[derive(Debug, PartialEq, Eq)]
enum DriveEnd {
    Done,
    Shutdown,
}

async fn drive_passes(
    coordinator: &Arc<SyncCoordinator>,
    online_rx: &watch::Receiver<bool>,
    force: &Notify,
    restart_failed_requested: &AtomicBool,
    shutdown: &Notify,
    first_trigger: PhaseEvent,
) -> DriveEnd {
    let mut trigger = first_trigger;
    loop {
        match coordinator.run_pass(online_rx, trigger).await {
            PassOutcome::Empty | PassOutcome::Drained | PassOutcome::Aborted => {
                return DriveEnd::Done;
            }
            PassOutcome::Backoff(delay) => {
                let mut rx = online_rx.clone();
                tokio::select! {
                    _ = shutdown.notified() => return DriveEnd::Shutdown,
                    _ = tokio::time::sleep(delay) => {
                        trigger = PhaseEvent::BackoffElapsed;
                    }
                    _ = force.notified() => {
                        if restart_failed_requested.swap(false, Ordering::SeqCst) {
                            coordinator.restart_failed().await;
                        }
                        trigger = PhaseEvent::ForceSync;
                    }
                    res = rx.changed() => {
                        if res.is_err() || !*rx.borrow() {
                            coordinator.apply_phase_event(PhaseEvent::WentOffline);
                            return DriveEnd::Done;
                        }
                        trigger = PhaseEvent::BackoffElapsed;
                    }
                }
                if !*online_rx.borrow() {
                    coordinator.apply_phase_event(PhaseEvent::WentOffline);
                    return DriveEnd::Done;
                }
            }
        }
    }
}
