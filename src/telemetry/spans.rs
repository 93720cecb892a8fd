//! Span helpers for queue operations.
//!
//! Tick spans carry the table and the listener's owner token. Record spans
//! carry the record hash.

use tracing::Span;

use crate::model::{MessageHash, OwnerToken};

/// Span for one tick of a timer chain ("poll" or "reap").
pub fn tick_span(chain: &'static str, table: &str, owner: &OwnerToken) -> Span {
    tracing::debug_span!(
        "ddq.tick",
        "ddq.chain" = chain,
        "ddq.table" = table,
        "ddq.owner" = %owner,
        "ddq.outcome" = tracing::field::Empty,
    )
}

/// Span for an operation on one record (send, heartbeat, requeue, remove).
pub fn record_span(operation: &'static str, hash: &MessageHash) -> Span {
    tracing::info_span!(
        "ddq.record",
        "ddq.operation" = operation,
        "ddq.hash" = %hash,
        "ddq.outcome" = tracing::field::Empty,
    )
}

/// Record how an operation ended on its span.
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("ddq.outcome", outcome);
}
