//! Sync coordinator: the state machine that drains the action queue against
//! the remote API.
//!
//! Phases move between `Idle`, `Syncing` and `BackoffWait` through the pure
//! [`next_phase`] function, so the transition table is unit-testable without
//! timers or network. The coordinator never propagates failures past its own
//! boundary: every error is classified and reflected into the affected
//! action's status, then surfaced through the event bus.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::watch;

use fablink_core::ActionId;
use fablink_events::{EventBus, InMemoryEventBus, Subscription};

use crate::action::{ActionStatus, EntityKey, PendingAction};
use crate::config::SyncConfig;
use crate::engine::{EngineError, EngineEvent, MutationRequest, SubmitError};
use crate::overlay::OptimisticOverlay;
use crate::queue::{ActionQueue, FailureDisposition};
use crate::store::{ActionStore, StorageInfo, StoreError};
use crate::transport::{ApiError, RemoteApi};

/// Coordinator phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Syncing,
    BackoffWait,
}

/// Stimulus driving a phase transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    /// Connectivity restored after being offline.
    CameOnline,
    /// The periodic sync timer fired while online.
    IntervalElapsed,
    /// Explicit user-triggered sync.
    ForceSync,
    /// Every queued action reached a terminal outcome.
    QueueDrained,
    /// Nothing runnable at pass start.
    QueueEmpty,
    /// A dequeued action failed with a retryable error.
    TransientFailure,
    /// The backoff timer elapsed.
    BackoffElapsed,
    /// Connectivity lost.
    WentOffline,
}

/// Pure phase-transition function. Stimuli that make no sense for the
/// current phase leave it unchanged.
pub fn next_phase(phase: SyncPhase, event: PhaseEvent) -> SyncPhase {
    use PhaseEvent::*;
    use SyncPhase::*;

    match (phase, event) {
        (Idle, CameOnline | IntervalElapsed | ForceSync) => Syncing,
        (Syncing, QueueDrained | QueueEmpty | WentOffline) => Idle,
        (Syncing, TransientFailure) => BackoffWait,
        (BackoffWait, BackoffElapsed | ForceSync) => Syncing,
        // The queue can empty out mid-backoff (user cleared or discarded the
        // retrying action); there is nothing left to wait for.
        (BackoffWait, WentOffline | QueueEmpty) => Idle,
        (phase, _) => phase,
    }
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Nothing runnable at pass start; no session was created.
    Empty,
    /// Every runnable action reached a terminal outcome.
    Drained,
    /// A transient failure scheduled a retry after the given delay.
    Backoff(Duration),
    /// Connectivity was lost mid-pass; remaining work stays queued.
    Aborted,
}

/// Ephemeral per-pass record. Created when a pass starts, dropped when it
/// completes; never persisted.
#[derive(Debug)]
struct SyncSession {
    started_at: DateTime<Utc>,
    in_flight: Option<ActionId>,
}

impl SyncSession {
    fn begin() -> Self {
        Self {
            started_at: Utc::now(),
            in_flight: None,
        }
    }

    fn elapsed(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }
}

/// The engine's state machine. Owns the queue, the overlay and the phase;
/// mirrors every durable transition into the action store.
pub struct SyncCoordinator {
    config: SyncConfig,
    store: Arc<dyn ActionStore>,
    api: Arc<dyn RemoteApi>,
    bus: Arc<InMemoryEventBus<EngineEvent>>,
    queue: Mutex<ActionQueue>,
    overlay: Mutex<OptimisticOverlay>,
    phase: Mutex<SyncPhase>,
    last_sync_at: Mutex<Option<DateTime<Utc>>>,
}

impl SyncCoordinator {
    /// Rehydrate the queue from the store and build the coordinator.
    ///
    /// Runs before any new action is accepted, so a reload cannot silently
    /// drop actions written just before a crash.
    pub async fn initialize(
        config: SyncConfig,
        store: Arc<dyn ActionStore>,
        api: Arc<dyn RemoteApi>,
        bus: Arc<InMemoryEventBus<EngineEvent>>,
    ) -> Result<Self, StoreError> {
        let loaded = store.load().await?;
        if !loaded.is_empty() {
            tracing::info!(count = loaded.len(), "rehydrated pending actions from store");
        }

        Ok(Self {
            overlay: Mutex::new(OptimisticOverlay::new(config.enable_optimistic_updates)),
            queue: Mutex::new(ActionQueue::rehydrate(loaded)),
            phase: Mutex::new(SyncPhase::Idle),
            last_sync_at: Mutex::new(None),
            config,
            store,
            api,
            bus,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.lock().unwrap()
    }

    pub fn is_syncing(&self) -> bool {
        self.phase() == SyncPhase::Syncing
    }

    pub fn pending_actions(&self) -> Vec<PendingAction> {
        self.queue.lock().unwrap().snapshot()
    }

    pub fn has_runnable(&self) -> bool {
        self.queue.lock().unwrap().has_runnable()
    }

    pub fn last_sync_at(&self) -> Option<DateTime<Utc>> {
        *self.last_sync_at.lock().unwrap()
    }

    pub fn subscribe(&self) -> Subscription<EngineEvent> {
        self.bus.subscribe()
    }

    /// Optimistic view of an entity's read model.
    pub fn read_model(&self, entity: &EntityKey) -> Option<Value> {
        self.overlay.lock().unwrap().view(entity)
    }

    /// Prime the server-confirmed snapshot for an entity.
    pub fn seed_read_model(&self, entity: EntityKey, body: Value) {
        self.overlay.lock().unwrap().seed(entity, body);
    }

    pub async fn storage_info(&self) -> Result<StorageInfo, StoreError> {
        self.store.storage_info().await
    }

    /// Append a mutation, or replace the payload of a still-queued action
    /// carrying the same signature (last-write-wins for rapid edits).
    pub async fn enqueue(&self, request: MutationRequest) -> Result<PendingAction, SubmitError> {
        if let Some(signature) = request.signature.as_deref() {
            let existing = self.queue.lock().unwrap().queued_with_signature(signature);
            if let Some(id) = existing {
                match self
                    .store
                    .replace_payload(id, &request.payload, request.optimistic.as_ref())
                    .await
                {
                    Ok(()) => {
                        let replaced = {
                            let mut queue = self.queue.lock().unwrap();
                            queue
                                .replace_payload(
                                    id,
                                    request.payload.clone(),
                                    request.optimistic.clone(),
                                )
                                .ok()
                                .and_then(|_| queue.get(id).cloned())
                        };
                        if let Some(action) = replaced {
                            self.overlay.lock().unwrap().apply(&action);
                            self.publish(EngineEvent::ActionEnqueued {
                                id,
                                replaced_previous: true,
                            });
                            tracing::debug!(action = %id, "replaced queued payload (same signature)");
                            return Ok(action);
                        }
                        // The twin left the queued state between lookup and
                        // replacement; append a fresh action below.
                    }
                    Err(StoreError::NotFound(_)) => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }

        let mut action = PendingAction::new(request.kind, request.entity, request.payload);
        action.signature = request.signature;
        action.optimistic = request.optimistic;

        match self.store.append(&action).await {
            Ok(()) => {}
            Err(StoreError::Full { capacity }) => {
                tracing::warn!(capacity, "enqueue rejected: action store is full");
                return Err(SubmitError::StorageFull { capacity });
            }
            Err(err) => return Err(err.into()),
        }

        self.queue.lock().unwrap().push(action.clone());
        self.overlay.lock().unwrap().apply(&action);
        self.publish(EngineEvent::ActionEnqueued {
            id: action.id,
            replaced_previous: false,
        });
        tracing::debug!(action = %action.id, kind = %action.kind, "action enqueued");
        Ok(action)
    }

    /// Run one sync pass: submit runnable actions head-first until the queue
    /// is drained, a transient failure schedules a backoff, or connectivity
    /// is lost.
    pub async fn run_pass(
        &self,
        online: &watch::Receiver<bool>,
        trigger: PhaseEvent,
    ) -> PassOutcome {
        if !self.has_runnable() {
            self.apply_phase_event(PhaseEvent::QueueEmpty);
            return PassOutcome::Empty;
        }

        self.apply_phase_event(trigger);
        let mut session = SyncSession::begin();
        self.publish(EngineEvent::SyncStarted);

        let mut synced = 0usize;
        let mut failed = 0usize;
        let mut abandoned = 0usize;

        let outcome = loop {
            if !*online.borrow() {
                break PassOutcome::Aborted;
            }

            let next = self.queue.lock().unwrap().next_runnable().cloned();
            let Some(action) = next else {
                break PassOutcome::Drained;
            };

            if let Err(err) = self.queue.lock().unwrap().mark_in_flight(action.id) {
                tracing::error!("failed to mark action {} in flight: {err}", action.id);
                break PassOutcome::Aborted;
            }
            debug_assert!(session.in_flight.is_none());
            session.in_flight = Some(action.id);

            if let Err(err) = self
                .store
                .update_status(
                    action.id,
                    ActionStatus::InFlight,
                    action.attempts,
                    action.last_error.as_deref(),
                )
                .await
            {
                tracing::warn!("failed to persist in-flight transition of {}: {err}", action.id);
            }

            tracing::debug!(
                action = %action.id,
                kind = %action.kind,
                attempts = action.attempts,
                "submitting action"
            );

            // The call is always awaited to completion; abandoning it mid-way
            // could leave the server-side effect and local state divergent.
            let result = self.api.submit(&action).await;
            session.in_flight = None;

            match result {
                Ok(body) => {
                    if let Err(err) = self.store.remove(action.id).await {
                        // The endpoints are idempotent; a re-submit after a
                        // reload is safe, losing the action would not be.
                        tracing::error!(
                            "failed to remove synced action {} from store: {err}",
                            action.id
                        );
                    }
                    self.queue.lock().unwrap().remove(action.id);
                    self.overlay
                        .lock()
                        .unwrap()
                        .confirm(action.id, &action.entity, body);
                    synced += 1;
                    self.publish(EngineEvent::ActionSynced { id: action.id });
                }
                Err(err) if err.is_transient() => {
                    if !*online.borrow() {
                        // The drop to offline explains the failure; this was
                        // not a real attempt. Leave the action queued.
                        self.requeue_after_offline(&action).await;
                        break PassOutcome::Aborted;
                    }
                    match self.record_transient(&action, &err).await {
                        Some(FailureDisposition::Retry { attempts }) => {
                            let delay = self.config.backoff_delay(attempts);
                            self.apply_phase_event(PhaseEvent::TransientFailure);
                            tracing::info!(
                                action = %action.id,
                                attempts,
                                "transient failure; retrying in {delay:?}"
                            );
                            break PassOutcome::Backoff(delay);
                        }
                        Some(FailureDisposition::Exhausted { attempts }) => {
                            failed += 1;
                            tracing::warn!(
                                action = %action.id,
                                attempts,
                                "retries exhausted; action marked failed"
                            );
                            self.publish(EngineEvent::ActionFailed {
                                id: action.id,
                                error: err.to_string(),
                            });
                            // One poisoned action must not block the rest.
                            continue;
                        }
                        None => continue,
                    }
                }
                Err(err) => {
                    let recorded = self
                        .queue
                        .lock()
                        .unwrap()
                        .record_rejection(action.id, &err.to_string())
                        .ok();
                    if let Some(attempts) = recorded {
                        if let Err(store_err) = self
                            .store
                            .update_status(
                                action.id,
                                ActionStatus::Abandoned,
                                attempts,
                                Some(&err.to_string()),
                            )
                            .await
                        {
                            tracing::warn!(
                                "failed to persist abandonment of {}: {store_err}",
                                action.id
                            );
                        }
                    }
                    let rolled_back = self.overlay.lock().unwrap().rollback(action.id);
                    abandoned += 1;
                    tracing::warn!(action = %action.id, "action rejected permanently: {err}");
                    self.publish(EngineEvent::ActionAbandoned {
                        id: action.id,
                        error: err.to_string(),
                        rolled_back,
                    });
                    continue;
                }
            }
        };

        match outcome {
            PassOutcome::Drained => {
                *self.last_sync_at.lock().unwrap() = Some(Utc::now());
                self.apply_phase_event(PhaseEvent::QueueDrained);
                tracing::info!(
                    synced,
                    failed,
                    abandoned,
                    elapsed_ms = session.elapsed().num_milliseconds(),
                    "sync pass drained"
                );
                self.publish(EngineEvent::SyncCompleted {
                    synced,
                    failed,
                    abandoned,
                });
            }
            PassOutcome::Aborted => {
                self.apply_phase_event(PhaseEvent::WentOffline);
                tracing::info!(synced, "sync pass aborted: connection lost");
                self.publish(EngineEvent::SyncAborted { synced });
            }
            // Phase already moved to BackoffWait when the failure was
            // recorded; the caller owns the timer.
            PassOutcome::Backoff(_) | PassOutcome::Empty => {}
        }

        outcome
    }

    /// Remove all actions regardless of status, from queue and store alike.
    /// Only ever invoked from an explicit user gesture.
    pub async fn clear_all(&self) -> Result<usize, StoreError> {
        self.store.clear().await?;
        let discarded = self.queue.lock().unwrap().clear();
        self.overlay.lock().unwrap().clear_pending();
        tracing::info!(discarded, "pending actions cleared by user request");
        self.publish(EngineEvent::QueueCleared { discarded });
        Ok(discarded)
    }

    /// Restart every failed action: back to queued with a fresh attempt
    /// budget. The user triggering `force_sync` is the acknowledgement.
    pub async fn restart_failed(&self) -> usize {
        let restarted = self.queue.lock().unwrap().restart_failed();
        for id in &restarted {
            if let Err(err) = self
                .store
                .update_status(*id, ActionStatus::Queued, 0, None)
                .await
            {
                tracing::warn!("failed to persist restart of {id}: {err}");
            }
        }
        restarted.len()
    }

    /// User-driven restart of a single failed/abandoned action.
    pub async fn retry_action(&self, id: ActionId) -> Result<(), EngineError> {
        self.queue
            .lock()
            .unwrap()
            .reset_for_retry(id)
            .map_err(|err| match err {
                crate::queue::QueueError::NotFound(id) => EngineError::UnknownAction(id),
                _ => EngineError::NotRestartable(id),
            })?;
        self.store
            .update_status(id, ActionStatus::Queued, 0, None)
            .await?;
        Ok(())
    }

    /// User-driven removal of a single action, rolling back its optimistic
    /// effect (the "discard" resolution for abandoned actions).
    pub async fn discard_action(&self, id: ActionId) -> Result<(), EngineError> {
        if self.queue.lock().unwrap().remove(id).is_none() {
            return Err(EngineError::UnknownAction(id));
        }
        self.store.remove(id).await?;
        self.overlay.lock().unwrap().rollback(id);
        self.publish(EngineEvent::ActionDiscarded { id });
        Ok(())
    }

    pub(crate) fn apply_phase_event(&self, event: PhaseEvent) -> SyncPhase {
        let mut phase = self.phase.lock().unwrap();
        let next = next_phase(*phase, event);
        if next != *phase {
            tracing::debug!(from = ?*phase, to = ?next, event = ?event, "phase transition");
            *phase = next;
        }
        next
    }

    pub(crate) fn publish(&self, event: EngineEvent) {
        let _ = self.bus.publish(event);
    }

    async fn requeue_after_offline(&self, action: &PendingAction) {
        let requeued = self.queue.lock().unwrap().requeue(action.id).is_ok();
        if requeued {
            if let Err(store_err) = self
                .store
                .update_status(
                    action.id,
                    ActionStatus::Queued,
                    action.attempts,
                    action.last_error.as_deref(),
                )
                .await
            {
                tracing::warn!("failed to persist requeue of {}: {store_err}", action.id);
            }
        }
    }

    async fn record_transient(
        &self,
        action: &PendingAction,
        err: &ApiError,
    ) -> Option<FailureDisposition> {
        let disposition = self
            .queue
            .lock()
            .unwrap()
            .record_transient_failure(action.id, &err.to_string(), self.config.max_retries)
            .ok()?;

        let (status, attempts) = match disposition {
            FailureDisposition::Retry { attempts } => (ActionStatus::Queued, attempts),
            FailureDisposition::Exhausted { attempts } => (ActionStatus::Failed, attempts),
        };
        if let Err(store_err) = self
            .store
            .update_status(action.id, status, attempts, Some(&err.to_string()))
            .await
        {
            tracing::warn!("failed to persist failure of {}: {store_err}", action.id);
        }
        Some(disposition)
    }
}
