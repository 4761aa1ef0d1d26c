use chrono::{DateTime, Utc};

/// A fact the ledger records about an order stream.
///
/// Once committed an event is never rewritten; the payload shape is tracked by
/// `version` so older rows can still be decoded.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Dotted name stored alongside the payload, e.g. `purchasing.order.created`.
    fn event_type(&self) -> &'static str;

    fn version(&self) -> u32;

    /// Business time of the change, taken from the caller's context.
    fn occurred_at(&self) -> DateTime<Utc>;
}
