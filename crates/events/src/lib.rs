//! `greenify-events` — notification plumbing (mechanics only).
//!
//! The identity service pushes session changes through an [`EventBus`], and the
//! session context fans its own transitions out to observers the same way.
//! Nothing in here knows what a session is.

pub mod bus;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
