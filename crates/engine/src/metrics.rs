//! Metrics instrumentation for engine observability.

use std::time::Instant;

/// Record a command accepted by `submit`.
pub fn increment_submitted() {
    metrics::counter!("viewlink_commands_submitted", 1);
}

/// Record a command suppressed as a duplicate.
pub fn increment_suppressed() {
    metrics::counter!("viewlink_commands_suppressed", 1);
}

/// Record a command executed by the drain loop.
pub fn increment_executed() {
    metrics::counter!("viewlink_commands_executed", 1);
}

/// Record a correlation entry that expired without a response.
pub fn increment_correlation_timeout() {
    metrics::counter!("viewlink_correlation_timeouts", 1);
}

/// Record a response that arrived for an unknown or expired id.
pub fn increment_late_response() {
    metrics::counter!("viewlink_late_responses", 1);
}

/// Record a watchdog or lazy forced release of the execution lock.
pub fn increment_lock_force_release() {
    metrics::counter!("viewlink_lock_force_releases", 1);
}

/// Record a scheduled reconnect attempt.
pub fn increment_reconnect_attempt() {
    metrics::counter!("viewlink_reconnect_attempts", 1);
}

/// Record remote round-trip latency.
pub fn record_round_trip(duration_ms: f64) {
    metrics::histogram!("viewlink_round_trip_latency", duration_ms);
}

/// Record time spent waiting for the execution lock.
pub fn record_lock_wait(duration_ms: f64) {
    metrics::histogram!("viewlink_lock_wait_duration", duration_ms);
}

/// RAII timer for automatic metric recording.
pub struct MetricTimer {
    start: Instant,
    metric_name: &'static str,
}

impl MetricTimer {
    pub fn new(metric_name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            metric_name,
        }
    }
}

impl Drop for MetricTimer {
    fn drop(&mut self) {
        let duration_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        match self.metric_name {
            "viewlink_round_trip_latency" => record_round_trip(duration_ms),
            "viewlink_lock_wait_duration" => record_lock_wait(duration_ms),
            _ => {}
        }
    }
}
