//! Metric instrument factories for ddq-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"ddq-rs"` meter; with no
//! provider registered they are no-ops.

use opentelemetry::metrics::{Counter, Meter};

/// Returns the shared meter for ddq-rs instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("ddq-rs")
}

/// Counter: `send` outcomes.
/// Labels: `result` ("created" | "requeued" | "exhausted" | "error").
pub fn messages_sent() -> Counter<u64> {
    meter()
        .u64_counter("ddq.messages.sent")
        .with_description("Number of send calls by outcome")
        .build()
}

/// Counter: claim attempts made by the poller.
/// Labels: `result` ("claimed" | "empty" | "deadlock" | "released" | "error").
pub fn claims() -> Counter<u64> {
    meter()
        .u64_counter("ddq.claims")
        .with_description("Number of claim attempts by outcome")
        .build()
}

/// Counter: lock conflicts seen.
/// Labels: `operation` ("claim" | "reap").
pub fn deadlocks() -> Counter<u64> {
    meter()
        .u64_counter("ddq.deadlocks")
        .with_description("Number of deadlock or serialization conflicts")
        .build()
}

/// Counter: expired leases released by the reaper.
pub fn leases_reaped() -> Counter<u64> {
    meter()
        .u64_counter("ddq.leases.reaped")
        .with_description("Number of expired claims returned to the pool")
        .build()
}

/// Counter: wrapped-message handler calls.
/// Labels: `operation` ("heartbeat" | "requeue" | "remove"),
/// `result` ("ok" | "fenced" | "fallback" | "error").
pub fn handler_operations() -> Counter<u64> {
    meter()
        .u64_counter("ddq.handler.operations")
        .with_description("Number of heartbeat/requeue/remove calls by outcome")
        .build()
}
