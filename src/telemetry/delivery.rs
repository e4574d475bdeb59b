//! Delivery span helpers.
//!
//! A drain runs inside an `outbox.drain` span; every entry it tries to
//! deliver gets a child `outbox.deliver` span.

use tracing::Span;

use crate::model::{Destination, EntryId};

/// Start a span covering one whole drain.
///
/// `outbox.delivered` is declared empty and filled in when the drain settles.
pub fn start_drain_span(destination: &Destination, pending: usize) -> Span {
    tracing::info_span!(
        "outbox.drain",
        "outbox.exchange" = %destination.exchange,
        "outbox.routing_key" = %destination.routing_key,
        "outbox.pending" = pending,
        "outbox.delivered" = tracing::field::Empty,
    )
}

/// Start a span for a single delivery attempt.
pub fn start_deliver_span(id: &EntryId) -> Span {
    tracing::info_span!(
        "outbox.deliver",
        "outbox.entry_id" = %id,
        "outbox.stage" = tracing::field::Empty,
    )
}

/// Record the stage an attempt reached (connect, publish, ack, remove).
///
/// Emits a tracing `debug` event scoped to the given span.
pub fn record_stage(span: &Span, stage: &'static str) {
    span.record("outbox.stage", stage);
    span.in_scope(|| {
        tracing::debug!(stage, "delivery_stage");
    });
}
