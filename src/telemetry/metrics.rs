//! Metric instrument factories for outbox-sender.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"outbox-sender"` meter.

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for outbox-sender instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("outbox-sender")
}

/// Counter: entries persisted to the queue store.
pub fn entries_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("outbox.entries.enqueued")
        .with_description("Number of entries persisted to the outbox")
        .build()
}

/// Counter: entries removed after acknowledgement.
pub fn entries_removed() -> Counter<u64> {
    meter()
        .u64_counter("outbox.entries.removed")
        .with_description("Number of acknowledged entries removed from the outbox")
        .build()
}

/// Counter: delivery attempts.
/// Labels: `result` ("ack" | "nack" | "connect_error" | "publish_error").
pub fn deliveries() -> Counter<u64> {
    meter()
        .u64_counter("outbox.deliveries")
        .with_description("Number of delivery attempts by result")
        .build()
}

/// Histogram: wall time of a whole drain in milliseconds.
/// Labels: `result` ("drained" | "stopped").
pub fn drain_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("outbox.drain.duration_ms")
        .with_description("Drain duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Shorthand for the single `result` label used by the counters above.
pub fn result_label(result: &'static str) -> [KeyValue; 1] {
    [KeyValue::new("result", result)]
}
