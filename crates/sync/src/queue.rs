//! In-memory, ordered queue of pending actions.
//!
//! The queue is a cache of the persistent action store and is rehydrated from
//! it before any new action is accepted. Ordering is strictly FIFO by
//! `created_at`; actions are never reordered ahead of older runnable work.
//! State transitions live here so the single-in-flight invariant is enforced
//! in one place.

use std::collections::HashSet;

use serde_json::Value;

use fablink_core::ActionId;

use crate::action::{ActionStatus, EntityKey, PendingAction};

/// Queue bookkeeping failure. These indicate a caller bug or a benign race
/// (e.g. an action cleared while its network call was outstanding); the
/// coordinator logs and continues.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("action not found in queue: {0}")]
    NotFound(ActionId),
    #[error("another action is already in flight: {0}")]
    AlreadyInFlight(ActionId),
    #[error("action is not in the expected state: {0}")]
    InvalidState(ActionId),
}

/// Outcome of recording a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Retry after backoff; carries the attempt count just recorded.
    Retry { attempts: u32 },
    /// Retries exhausted; the action is now `Failed`.
    Exhausted { attempts: u32 },
}

/// Ordered queue of not-yet-confirmed mutations.
#[derive(Debug, Default)]
pub struct ActionQueue {
    actions: Vec<PendingAction>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the queue from store contents (already FIFO-ordered).
    pub fn rehydrate(actions: Vec<PendingAction>) -> Self {
        Self { actions }
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn snapshot(&self) -> Vec<PendingAction> {
        self.actions.clone()
    }

    pub fn get(&self, id: ActionId) -> Option<&PendingAction> {
        self.actions.iter().find(|a| a.id == id)
    }

    pub fn in_flight(&self) -> Option<ActionId> {
        self.actions
            .iter()
            .find(|a| a.status == ActionStatus::InFlight)
            .map(|a| a.id)
    }

    /// Id of the still-queued action carrying this signature, if any.
    pub fn queued_with_signature(&self, signature: &str) -> Option<ActionId> {
        self.actions
            .iter()
            .find(|a| a.is_queued() && a.signature.as_deref() == Some(signature))
            .map(|a| a.id)
    }

    pub fn push(&mut self, action: PendingAction) {
        self.actions.push(action);
    }

    /// Last-write-wins replacement for rapid repeated edits.
    pub fn replace_payload(
        &mut self,
        id: ActionId,
        payload: Value,
        optimistic: Option<Value>,
    ) -> Result<(), QueueError> {
        let action = self.find_mut(id)?;
        if !action.is_queued() {
            return Err(QueueError::InvalidState(id));
        }
        action.payload = payload;
        action.optimistic = optimistic;
        Ok(())
    }

    /// Head of the queue eligible for submission.
    ///
    /// An unresolved (failed/abandoned) action gates later actions on the
    /// same entity, so submission order per entity is preserved; actions on
    /// other entities are not blocked by it.
    pub fn next_runnable(&self) -> Option<&PendingAction> {
        let mut gated: HashSet<&EntityKey> = HashSet::new();
        for action in &self.actions {
            match action.status {
                ActionStatus::Queued if !gated.contains(&action.entity) => return Some(action),
                _ => {
                    gated.insert(&action.entity);
                }
            }
        }
        None
    }

    pub fn has_runnable(&self) -> bool {
        self.next_runnable().is_some()
    }

    pub fn mark_in_flight(&mut self, id: ActionId) -> Result<(), QueueError> {
        if let Some(other) = self.in_flight() {
            return Err(QueueError::AlreadyInFlight(other));
        }
        let action = self.find_mut(id)?;
        if !action.is_queued() {
            return Err(QueueError::InvalidState(id));
        }
        action.status = ActionStatus::InFlight;
        Ok(())
    }

    /// Return an in-flight action to the queue without counting an attempt
    /// (offline abort path).
    pub fn requeue(&mut self, id: ActionId) -> Result<(), QueueError> {
        let action = self.find_mut(id)?;
        if !action.is_in_flight() {
            return Err(QueueError::InvalidState(id));
        }
        action.status = ActionStatus::Queued;
        Ok(())
    }

    /// Record a transient failure and decide between retry and exhaustion.
    pub fn record_transient_failure(
        &mut self,
        id: ActionId,
        error: &str,
        max_retries: u32,
    ) -> Result<FailureDisposition, QueueError> {
        let action = self.find_mut(id)?;
        action.attempts += 1;
        action.last_error = Some(error.to_string());
        if action.attempts < max_retries {
            action.status = ActionStatus::Queued;
            Ok(FailureDisposition::Retry {
                attempts: action.attempts,
            })
        } else {
            action.status = ActionStatus::Failed;
            Ok(FailureDisposition::Exhausted {
                attempts: action.attempts,
            })
        }
    }

    /// Record a permanent rejection: abandoned after exactly one attempt.
    pub fn record_rejection(&mut self, id: ActionId, error: &str) -> Result<u32, QueueError> {
        let action = self.find_mut(id)?;
        action.attempts += 1;
        action.last_error = Some(error.to_string());
        action.status = ActionStatus::Abandoned;
        Ok(action.attempts)
    }

    pub fn remove(&mut self, id: ActionId) -> Option<PendingAction> {
        let idx = self.actions.iter().position(|a| a.id == id)?;
        Some(self.actions.remove(idx))
    }

    /// User-acknowledged restart of a single unresolved action.
    pub fn reset_for_retry(&mut self, id: ActionId) -> Result<(), QueueError> {
        let action = self.find_mut(id)?;
        if !action.status.is_unresolved() {
            return Err(QueueError::InvalidState(id));
        }
        action.status = ActionStatus::Queued;
        action.attempts = 0;
        action.last_error = None;
        Ok(())
    }

    /// Restart every failed action (the `force_sync` acknowledgement path).
    /// Abandoned actions are untouched; they are never auto-retried.
    pub fn restart_failed(&mut self) -> Vec<ActionId> {
        let mut restarted = Vec::new();
        for action in &mut self.actions {
            if action.status == ActionStatus::Failed {
                action.status = ActionStatus::Queued;
                action.attempts = 0;
                action.last_error = None;
                restarted.push(action.id);
            }
        }
        restarted
    }

    pub fn clear(&mut self) -> usize {
        let n = self.actions.len();
        self.actions.clear();
        n
    }

    fn find_mut(&mut self, id: ActionId) -> Result<&mut PendingAction, QueueError> {
        self.actions
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(QueueError::NotFound(id))
    }
}
