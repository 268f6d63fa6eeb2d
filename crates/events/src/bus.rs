//! Publish/subscribe abstraction.
//!
//! A bus hands every subscriber its own copy of each published message
//! (broadcast). Delivery is in publish order per subscriber; there is no
//! persistence and no replay, so a subscriber only sees messages published
//! after it subscribed.
//!
//! Unsubscribing is dropping the [`Subscription`]. Implementations prune the
//! dead receiver the next time they publish.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::time::Duration;

/// A subscription to a message stream.
///
/// ## Usage Pattern
///
/// ```ignore
/// let subscription = bus.subscribe();
///
/// // Non-blocking: apply whatever has arrived so far.
/// for change in subscription.drain() {
///     apply(change);
/// }
/// ```
///
/// Subscriptions are meant for a single consumer. Share one behind a mutex
/// if several tasks need to pull from it.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Take every message that is already queued, in arrival order.
    ///
    /// Never blocks. An empty vec means nothing was pending (or the bus is
    /// gone).
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Transport-agnostic pub/sub bus.
///
/// `publish()` may fail (e.g. internal lock poisoned); the error is returned
/// to the publisher, which decides whether that matters. Implementations must
/// be shareable across threads.
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
