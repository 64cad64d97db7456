//! Event publishing/subscription abstraction (mechanics only).
//!
//! A deliberately lightweight pub/sub seam:
//!
//! - **Transport-agnostic**: in-memory channels here; nothing stops a bridge
//!   to a service worker or another process.
//! - **Broadcast semantics**: every subscriber gets a copy of every message.
//! - **No persistence**: the bus distributes notifications; durable state
//!   lives in the action store, which is the source of truth.
//!
//! Consumers must tolerate duplicate notifications: a subscriber that missed
//! messages can always re-read the current engine snapshot, so delivery is
//! best-effort.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// A subscription to a message stream.
///
/// Each subscription receives a copy of all messages published after it was
/// created. Designed for single-threaded consumption; hand the subscription
/// to one consumer (a render loop, a test) and poll it there.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently buffered without blocking.
    pub fn drain(&self) -> Vec<M> {
        let mut out = Vec::new();
        while let Ok(msg) = self.receiver.try_recv() {
            out.push(msg);
        }
        out
    }
}

/// Domain-agnostic event bus (pub/sub abstraction).
///
/// `publish` can fail (lock poisoning, transport error); the caller decides
/// whether that matters. Implementations must be safe to share across
/// threads, since the engine publishes from a background task while the UI
/// subscribes from its own.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
