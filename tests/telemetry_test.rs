//! Integration tests for telemetry initialization and span helpers.

use ddq_rs::model::{MessageHash, OwnerToken};
use ddq_rs::telemetry::{TelemetryConfig, init_telemetry, metrics, spans};
use opentelemetry::KeyValue;

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    // This may return Err if a global subscriber was already set by
    // another test in this process; that is acceptable.
    let config = TelemetryConfig {
        endpoint: None,
        service_name: "ddq-test".to_string(),
        log_level: "debug".to_string(),
    };
    if let Ok(guard) = init_telemetry(config) {
        assert!(!guard.is_exporting());
        guard.force_flush();
    }
}

#[test]
fn tick_span_creates_and_records_outcome() {
    let owner = OwnerToken::generate();
    let span = spans::tick_span("poll", "jobs", &owner);
    spans::record_outcome(&span, "empty");
}

#[test]
fn record_span_creates_and_records_outcome() {
    let hash = MessageHash::compute("hello", Some("topicA"));
    let span = spans::record_span("remove", &hash);
    let _enter = span.enter();
    spans::record_outcome(&span, "removed");
}

#[test]
fn counters_are_usable_without_a_provider() {
    metrics::messages_sent().add(1, &[KeyValue::new("result", "created")]);
    metrics::claims().add(1, &[KeyValue::new("result", "empty")]);
    metrics::deadlocks().add(1, &[KeyValue::new("operation", "claim")]);
    metrics::leases_reaped().add(3, &[]);
    metrics::handler_operations().add(
        1,
        &[
            KeyValue::new("operation", "heartbeat"),
            KeyValue::new("result", "ok"),
        ],
    );
}
