//! Client-side notification plumbing.
//!
//! The sync engine publishes its state transitions through the bus defined
//! here; the rendering layer, background services, and tests are all just
//! subscribers. No consumer is special-cased.

pub mod bus;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use in_memory_bus::InMemoryEventBus;
