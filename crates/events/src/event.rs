use chrono::{DateTime, Utc};

/// A notification carried over an [`EventBus`](crate::EventBus).
///
/// Events are facts: they are cloned per subscriber and never mutated.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name (e.g. "auth.signed_in").
    fn event_type(&self) -> &'static str;

    /// When the event occurred.
    fn occurred_at(&self) -> DateTime<Utc>;
}
