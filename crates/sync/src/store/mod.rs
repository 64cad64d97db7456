//! Durable persistence for pending actions.
//!
//! The store is the source of truth for queue contents across reloads: the
//! in-memory queue is rehydrated from `load()` before any new action is
//! accepted. All implementations are bounded; `append` on a full store fails
//! loudly rather than silently dropping user-submitted mutations.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use fablink_core::ActionId;

use crate::action::{ActionStatus, PendingAction};

mod memory;
mod sqlite;

pub use memory::MemoryActionStore;
pub use sqlite::SqliteActionStore;

/// Default number of actions a store accepts before `append` fails.
pub const DEFAULT_CAPACITY: usize = 1_000;

/// Storage failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The store reached its capacity; the caller must surface this to the
    /// user instead of dropping the action.
    #[error("action store is full (capacity {capacity})")]
    Full { capacity: usize },
    /// An action with the same id is already persisted.
    #[error("action already exists: {0}")]
    AlreadyExists(ActionId),
    #[error("action not found: {0}")]
    NotFound(ActionId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Current occupancy of the store, surfaced for UI diagnostics.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StorageInfo {
    pub action_count: usize,
    pub approx_bytes: u64,
    pub capacity: usize,
}

/// Durable, ordered storage of pending actions.
///
/// `load` returns actions in FIFO order (`created_at`, then id — UUIDv7 ids
/// break ties deterministically). Records that cannot be decoded are skipped
/// and logged individually; rehydration never fails wholesale. Actions
/// persisted as in-flight are re-marked queued on load: a reload means the
/// previous process died mid-pass, and the action must be retried rather
/// than dropped.
#[async_trait]
pub trait ActionStore: Send + Sync {
    async fn load(&self) -> Result<Vec<PendingAction>, StoreError>;

    async fn append(&self, action: &PendingAction) -> Result<(), StoreError>;

    /// Persist a status transition together with its attempt count and error.
    async fn update_status(
        &self,
        id: ActionId,
        status: ActionStatus,
        attempts: u32,
        last_error: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Replace the payload of a still-queued action (signature dedup path).
    async fn replace_payload(
        &self,
        id: ActionId,
        payload: &Value,
        optimistic: Option<&Value>,
    ) -> Result<(), StoreError>;

    /// Remove an action. Removing an id that is no longer present is a no-op:
    /// the desired end state (absent) already holds.
    async fn remove(&self, id: ActionId) -> Result<(), StoreError>;

    async fn clear(&self) -> Result<(), StoreError>;

    async fn storage_info(&self) -> Result<StorageInfo, StoreError>;
}

/// Re-mark interrupted in-flight actions as queued after a reload.
pub(crate) fn requeue_interrupted(actions: &mut [PendingAction]) {
    for action in actions {
        if action.status == ActionStatus::InFlight {
            tracing::info!(
                action = %action.id,
                "re-queueing action left in flight by a previous session"
            );
            action.status = ActionStatus::Queued;
        }
    }
}

/// Rough per-action size estimate used for `StorageInfo::approx_bytes`.
pub(crate) fn approx_action_bytes(action: &PendingAction) -> u64 {
    serde_json::to_vec(action).map(|v| v.len() as u64).unwrap_or(0)
}
