//! `fablink-sync` — offline-first synchronization engine for the
//! marketplace client.
//!
//! The engine sits between the UI and the network: user mutations are
//! durably queued, applied optimistically to the local read model, and
//! drained against the remote API on reconnect, on a periodic timer and on
//! demand. Failures are classified (transient vs. permanent), retried with
//! exponential backoff, and surfaced — never silently dropped.
//!
//! Components, leaves first:
//!
//! - [`store`] — durable persistence of pending actions (source of truth
//!   across reloads)
//! - [`connectivity`] — debounced online/offline detection with an API
//!   reachability probe
//! - [`queue`] — FIFO queue of not-yet-confirmed mutations, backed by the
//!   store
//! - [`coordinator`] — the sync state machine: drain, retry, classify
//! - [`overlay`] — optimistic read-model overlay with server-wins
//!   reconciliation
//! - [`engine`] — the facade consumed by the UI

pub mod action;
pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod engine;
pub mod http;
pub mod overlay;
pub mod queue;
pub mod store;
pub mod transport;

pub use action::{ActionKind, ActionStatus, EntityKey, PendingAction};
pub use config::SyncConfig;
pub use connectivity::{ConnectivityMonitor, ReachabilityProbe};
pub use coordinator::{PassOutcome, PhaseEvent, SyncCoordinator, SyncPhase, next_phase};
pub use engine::{
    EngineError, EngineEvent, EngineSnapshot, MutationRequest, OfflineEngine, SubmitError,
};
pub use http::{HttpProbe, HttpRemoteApi};
pub use overlay::OptimisticOverlay;
pub use queue::{ActionQueue, FailureDisposition, QueueError};
pub use store::{
    ActionStore, MemoryActionStore, SqliteActionStore, StorageInfo, StoreError,
};
pub use transport::{ApiError, RemoteApi};
