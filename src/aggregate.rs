//! Aggregate trait and the record reducer shared by replay and live folding.

use std::future::Future;

use serde::{Serialize, de::DeserializeOwned};

use crate::event::{EventRecord, decode_domain_event};

/// A domain aggregate whose state is derived from its event history.
///
/// The implementing type itself serves as the aggregate's state.
/// State is built by folding domain events through the [`apply`](Aggregate::apply) method.
///
/// # Associated Types
///
/// - `Command`: the set of commands this aggregate can handle.
/// - `DomainEvent`: the set of events this aggregate can produce and apply.
///   Must be an adjacently tagged serde enum (`#[serde(tag = "type",
///   content = "data")]`); the tag is the event type written to the log and
///   the variant list is the reducer dispatch table.
/// - `Error`: command rejection / validation error.
///
/// # Contract
///
/// - [`handle`](Aggregate::handle) validates a command against the current state and
///   returns zero or more events. It may await external checks; while it is
///   suspended no other command for the same stream is processed.
/// - [`apply`](Aggregate::apply) must be a pure, total function. It is used
///   identically for replay and for folding freshly committed events.
pub trait Aggregate: Default + Clone + Send + Sync + 'static {
    /// Identifies this aggregate type (e.g. "product"). Also the category of
    /// every stream created through [`AggregateStore::get`](crate::AggregateStore::get).
    const AGGREGATE_TYPE: &'static str;

    /// The set of commands this aggregate can handle.
    type Command: Send + 'static;

    /// The set of events this aggregate can produce and apply.
    type DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone + 'static;

    /// Command rejection / validation error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Validate a command against the current state and produce events.
    ///
    /// Returns `Ok(vec![])` if the command is already satisfied (a no-op).
    /// Returns `Err` to reject the command; nothing is persisted.
    fn handle(
        &self,
        cmd: Self::Command,
    ) -> impl Future<Output = Result<Vec<Self::DomainEvent>, Self::Error>> + Send;

    /// Apply a single event to produce the next state.
    ///
    /// Unknown event variants should be ignored (return `self` unchanged)
    /// to maintain forward compatibility.
    fn apply(self, event: &Self::DomainEvent) -> Self;

    /// Whether this aggregate type may be instantiated on `stream_id`.
    ///
    /// Override to reserve system streams or restrict an aggregate to its
    /// own category. Defaults to accepting every stream.
    fn owns_stream(_stream_id: &str) -> bool {
        true
    }
}

/// Fold one stored record into aggregate state.
///
/// Decodes the record into `A::DomainEvent` and delegates to `A::apply`.
/// Records that do not decode (unknown type, foreign payload format,
/// malformed data) leave the state unchanged.
pub fn fold_record<A: Aggregate>(state: A, record: &EventRecord) -> A {
    match decode_domain_event::<A::DomainEvent>(record) {
        Some(event) => state.apply(&event),
        None => state,
    }
}
