//! Metrics definitions for the Session Coordinator.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sc_` prefix for Session Coordinator
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `actor_type`: 3 values (coordinator, session, egress)
//! - `event`: 7 values (signaling event names)
//! - `status`: 7 values (success plus `ScError::status_label`)
//! - `operation`: engine call names (~12 values)
//! - `state`: egress states (5 values)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Signaling round trips include one or more engine calls
        .set_buckets_for_metric(
            Matcher::Prefix("sc_signaling".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 10.000,
            ],
        )
        .map_err(|e| format!("Failed to set signaling latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Registry Gauges
// ============================================================================

/// Metric: `sc_sessions_active`
pub fn set_sessions_active(count: usize) {
    // usize to f64 conversion is safe for realistic counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("sc_sessions_active").set(count as f64);
}

/// Metric: `sc_transports_active`
pub fn set_transports_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sc_transports_active").set(count as f64);
}

/// Metric: `sc_producers_active`
pub fn set_producers_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sc_producers_active").set(count as f64);
}

/// Metric: `sc_consumers_active`
pub fn set_consumers_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sc_consumers_active").set(count as f64);
}

// ============================================================================
// Actor Mailbox Metrics
// ============================================================================

/// Set the number of messages queued across all actors of a type.
///
/// Metric: `sc_actor_mailbox_depth`
/// Labels: `actor_type` (session, egress)
///
/// High values indicate the actor is falling behind in message processing.
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sc_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

/// Record an actor panic event.
///
/// Metric: `sc_actor_panics_total`
/// Labels: `actor_type`
///
/// ALERT: Any non-zero value indicates a bug.
pub fn record_actor_panic(actor_type: &str) {
    counter!("sc_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}

/// Record a notification dropped because the recipient's outbound queue was full.
///
/// Metric: `sc_messages_dropped_total`
/// Labels: `actor_type`
pub fn record_message_dropped(actor_type: &str) {
    counter!("sc_messages_dropped_total", "actor_type" => actor_type.to_string()).increment(1);
}

// ============================================================================
// Signaling Metrics
// ============================================================================

/// Record a handled signaling request.
///
/// Metrics: `sc_signaling_requests_total{event,status}`,
/// `sc_signaling_latency_seconds{event}`
pub fn record_signaling_request(event: &str, status: &str, duration: Duration) {
    counter!("sc_signaling_requests_total",
        "event" => event.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("sc_signaling_latency_seconds", "event" => event.to_string())
        .record(duration.as_secs_f64());
}

// ============================================================================
// Engine and Egress Metrics
// ============================================================================

/// Metric: `sc_engine_timeouts_total{operation}`
pub fn record_engine_timeout(operation: &str) {
    counter!("sc_engine_timeouts_total", "operation" => operation.to_string()).increment(1);
}

/// Metric: `sc_egress_transitions_total{state}`
pub fn record_egress_transition(state: &str) {
    counter!("sc_egress_transitions_total", "state" => state.to_string()).increment(1);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    // Without an installed recorder these calls go to the global no-op recorder.
    #[test]
    fn test_recording_without_recorder_is_harmless() {
        set_sessions_active(3);
        set_transports_active(6);
        set_producers_active(2);
        set_consumers_active(4);
        set_actor_mailbox_depth("session", 10);
        record_actor_panic("session");
        record_message_dropped("session");
        record_signaling_request("produce", "success", Duration::from_millis(4));
        record_engine_timeout("produce");
        record_egress_transition("running");
    }

    #[test]
    fn test_metrics_are_emitted_with_bounded_labels() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            set_sessions_active(2);
            record_signaling_request("consume", "incompatible", Duration::from_millis(3));
            record_engine_timeout("consume");
            record_egress_transition("abandoned");
        });

        let snapshot = snapshotter.snapshot().into_vec();

        let find = |name: &str| {
            snapshot
                .iter()
                .find(|(key, _, _, _)| key.key().name() == name)
                .map(|(key, _, _, value)| (key.key().clone(), value.clone()))
        };

        let (_, sessions) = find("sc_sessions_active").expect("sessions gauge recorded");
        assert!(matches!(sessions, DebugValue::Gauge(v) if v.into_inner() == 2.0));

        let (key, requests) =
            find("sc_signaling_requests_total").expect("request counter recorded");
        assert!(matches!(requests, DebugValue::Counter(1)));
        assert!(key
            .labels()
            .any(|l| l.key() == "status" && l.value() == "incompatible"));

        let (key, _) = find("sc_engine_timeouts_total").expect("timeout counter recorded");
        assert!(key
            .labels()
            .any(|l| l.key() == "operation" && l.value() == "consume"));

        assert!(find("sc_signaling_latency_seconds").is_some());
        assert!(find("sc_egress_transitions_total").is_some());
    }
}
