//! In-memory action store for tests/dev.

use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;

use fablink_core::ActionId;

use super::{ActionStore, DEFAULT_CAPACITY, StorageInfo, StoreError, approx_action_bytes,
            requeue_interrupted};
use crate::action::{ActionStatus, PendingAction};

/// Volatile store with the same contract as the durable ones.
///
/// Useful for tests and for environments where persistence is handled by the
/// host (the engine itself never cares which implementation it is given).
#[derive(Debug)]
pub struct MemoryActionStore {
    actions: RwLock<Vec<PendingAction>>,
    capacity: usize,
}

impl MemoryActionStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            actions: RwLock::new(Vec::new()),
            capacity,
        }
    }
}

impl Default for MemoryActionStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> StoreError {
    StoreError::Storage("action store lock poisoned".to_string())
}

#[async_trait]
impl ActionStore for MemoryActionStore {
    async fn load(&self) -> Result<Vec<PendingAction>, StoreError> {
        let actions = self.actions.read().map_err(|_| poisoned())?;
        let mut out = actions.clone();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        requeue_interrupted(&mut out);
        Ok(out)
    }

    async fn append(&self, action: &PendingAction) -> Result<(), StoreError> {
        let mut actions = self.actions.write().map_err(|_| poisoned())?;
        if actions.len() >= self.capacity {
            return Err(StoreError::Full {
                capacity: self.capacity,
            });
        }
        if actions.iter().any(|a| a.id == action.id) {
            return Err(StoreError::AlreadyExists(action.id));
        }
        actions.push(action.clone());
        Ok(())
    }

    async fn update_status(
        &self,
        id: ActionId,
        status: ActionStatus,
        attempts: u32,
        last_error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut actions = self.actions.write().map_err(|_| poisoned())?;
        let action = actions
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(StoreError::NotFound(id))?;
        action.status = status;
        action.attempts = attempts;
        action.last_error = last_error.map(str::to_string);
        Ok(())
    }

    async fn replace_payload(
        &self,
        id: ActionId,
        payload: &Value,
        optimistic: Option<&Value>,
    ) -> Result<(), StoreError> {
        let mut actions = self.actions.write().map_err(|_| poisoned())?;
        let action = actions
            .iter_mut()
            .find(|a| a.id == id && a.status == ActionStatus::Queued)
            .ok_or(StoreError::NotFound(id))?;
        action.payload = payload.clone();
        action.optimistic = optimistic.cloned();
        Ok(())
    }

    async fn remove(&self, id: ActionId) -> Result<(), StoreError> {
        let mut actions = self.actions.write().map_err(|_| poisoned())?;
        actions.retain(|a| a.id != id);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut actions = self.actions.write().map_err(|_| poisoned())?;
        actions.clear();
        Ok(())
    }

    async fn storage_info(&self) -> Result<StorageInfo, StoreError> {
        let actions = self.actions.read().map_err(|_| poisoned())?;
        Ok(StorageInfo {
            action_count: actions.len(),
            approx_bytes: actions.iter().map(approx_action_bytes).sum(),
            capacity: self.capacity,
        })
    }
}
