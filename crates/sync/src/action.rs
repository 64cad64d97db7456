//! Pending action model: a durable record of a user mutation that has not
//! yet been confirmed by the marketplace API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use fablink_core::{ActionId, OrderId, QuoteId};

/// Logical entity a mutation affects.
///
/// Two actions with the same `EntityKey` must reach the server in the order
/// they were enqueued locally; actions on different entities carry no
/// cross-entity ordering guarantee.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(String);

impl EntityKey {
    pub fn order(id: OrderId) -> Self {
        Self(format!("order:{id}"))
    }

    pub fn quote(id: QuoteId) -> Self {
        Self(format!("quote:{id}"))
    }

    /// Key for an entity type the engine has no dedicated constructor for.
    pub fn custom(kind: &str, id: &str) -> Self {
        Self(format!("{kind}:{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The raw identifier portion of the key (after the type prefix).
    pub fn raw_id(&self) -> &str {
        match self.0.split_once(':') {
            Some((_, id)) => id,
            None => &self.0,
        }
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for EntityKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Mutation type, routed to the matching remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    CreateOrder,
    UpdateOrder,
    BulkOperation,
    AcceptQuote,
    /// Extension point for mutations the engine does not know about.
    Custom(String),
}

impl ActionKind {
    pub fn as_str(&self) -> &str {
        match self {
            ActionKind::CreateOrder => "create_order",
            ActionKind::UpdateOrder => "update_order",
            ActionKind::BulkOperation => "bulk_operation",
            ActionKind::AcceptQuote => "accept_quote",
            ActionKind::Custom(kind) => kind,
        }
    }

    /// Parse a stored kind string. Unknown strings round-trip as `Custom`.
    pub fn parse(s: &str) -> Self {
        match s {
            "create_order" => ActionKind::CreateOrder,
            "update_order" => ActionKind::UpdateOrder,
            "bulk_operation" => ActionKind::BulkOperation,
            "accept_quote" => ActionKind::AcceptQuote,
            other => ActionKind::Custom(other.to_string()),
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a pending action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Waiting for the next sync pass.
    Queued,
    /// Currently being submitted to the API.
    InFlight,
    /// Exhausted its transient retries; waits for user-driven restart.
    Failed,
    /// Permanently rejected by the API; waits for user resolution.
    Abandoned,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Queued => "queued",
            ActionStatus::InFlight => "in_flight",
            ActionStatus::Failed => "failed",
            ActionStatus::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(ActionStatus::Queued),
            "in_flight" => Some(ActionStatus::InFlight),
            "failed" => Some(ActionStatus::Failed),
            "abandoned" => Some(ActionStatus::Abandoned),
            _ => None,
        }
    }

    /// Whether the action still needs user attention before it can sync again.
    pub fn is_unresolved(&self) -> bool {
        matches!(self, ActionStatus::Failed | ActionStatus::Abandoned)
    }
}

/// A user mutation queued for synchronization.
///
/// Exactly one `PendingAction` exists per logical user mutation. The record
/// survives reloads via the action store; `id` is stable and UUIDv7, so
/// creation order is recoverable from the id alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAction {
    pub id: ActionId,
    pub kind: ActionKind,
    pub entity: EntityKey,
    /// Opaque, serializable arguments for the mutation.
    pub payload: Value,
    /// Caller-supplied dedup key; re-enqueueing with a live signature
    /// replaces the payload instead of appending.
    pub signature: Option<String>,
    /// JSON merge patch applied to the cached read model while pending.
    pub optimistic: Option<Value>,
    pub status: ActionStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl PendingAction {
    pub fn new(kind: ActionKind, entity: EntityKey, payload: Value) -> Self {
        Self {
            id: ActionId::new(),
            kind,
            entity,
            payload,
            signature: None,
            optimistic: None,
            status: ActionStatus::Queued,
            attempts: 0,
            created_at: Utc::now(),
            last_error: None,
        }
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    pub fn with_optimistic(mut self, patch: Value) -> Self {
        self.optimistic = Some(patch);
        self
    }

    pub fn is_queued(&self) -> bool {
        self.status == ActionStatus::Queued
    }

    pub fn is_in_flight(&self) -> bool {
        self.status == ActionStatus::InFlight
    }
}
