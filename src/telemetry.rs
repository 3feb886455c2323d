//! Observability hooks: `tracing` structured logs plus `metrics` counters
//! and histograms. Wiring these into an exporter (Prometheus, OTLP, ...) is
//! a collaborator's job — this module only emits the named events.

use std::time::Duration;

use crate::error::{ErrorClass, Operation};

/// Records a completed query/exec/prepare dispatch: one `queries_total`
/// counter increment and one `query_duration_seconds` histogram
/// observation, plus (when `threshold` is non-zero and exceeded) a
/// warn-level slow-query log record and the companion metric.
///
/// `sql` is logged only in redacted/length form — bound values are never
/// logged.
pub fn record_dispatch(op: Operation, status: &'static str, duration: Duration, sql: &str, arg_count: usize, slow_query_threshold: Duration) {
    metrics::counter!("queries_total", 1, "operation" => op.as_str(), "status" => status);
    metrics::histogram!("query_duration_seconds", duration);

    if status == "ok" {
        tracing::debug!(operation = %op, duration_ms = duration.as_millis() as u64, "query dispatched");
    }

    if !slow_query_threshold.is_zero() && duration >= slow_query_threshold {
        metrics::counter!("queries_slow_total", 1, "operation" => op.as_str());
        tracing::warn!(
            operation = %op,
            sql_len = sql.len(),
            arg_count,
            duration_ms = duration.as_millis() as u64,
            threshold_ms = slow_query_threshold.as_millis() as u64,
            "slow query"
        );
    }
}

/// Records a classified failure. Retryable classes log at `warn` (the
/// retry engine will likely recover); everything else logs at `error`.
pub fn record_failure(op: Operation, class: ErrorClass, retry_count: Option<u32>) {
    metrics::counter!("queries_total", 1, "operation" => op.as_str(), "status" => "error");
    if class.retriable() {
        tracing::warn!(operation = %op, class = %class, retry_count, "classified retryable failure");
    } else {
        tracing::error!(operation = %op, class = %class, "terminal failure");
    }
}

pub fn record_connection_acquired(wait: Duration) {
    metrics::counter!("connections_active", 1);
    metrics::histogram!("sql.connection_acquire", wait);
}

pub fn record_connection_created() {
    metrics::counter!("connections_total", 1);
}

/// `metrics`'s `counter!` has no decrement; `connections_active` as an
/// always-increasing count isn't useful, so released connections are
/// surfaced only through the pool's own stats snapshot (see `pool::Stats`),
/// not through this telemetry facade.
pub fn record_connection_released() {}

pub fn record_transaction_outcome(outcome: &'static str, attempts: u32) {
    metrics::counter!("transactions_total", 1, "outcome" => outcome);
    if attempts > 1 {
        tracing::info!(attempts, outcome, "transaction completed after retry");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeEvent {
    Healthy,
    Unhealthy,
    ReconnectStarted,
    ReconnectSuccess,
    ReconnectFailed,
    ReconnectAbandoned,
}

impl ProbeEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            ProbeEvent::Healthy => "healthy",
            ProbeEvent::Unhealthy => "unhealthy",
            ProbeEvent::ReconnectStarted => "reconnect_started",
            ProbeEvent::ReconnectSuccess => "reconnect_success",
            ProbeEvent::ReconnectFailed => "reconnect_failed",
            ProbeEvent::ReconnectAbandoned => "reconnect_abandoned",
        }
    }
}

/// Emits exactly one probe transition event per state-machine transition.
pub fn record_probe_event(event: ProbeEvent) {
    metrics::counter!("probe_events_total", 1, "event" => event.as_str());
    match event {
        ProbeEvent::Healthy => tracing::info!(event = event.as_str(), "probe transition"),
        ProbeEvent::Unhealthy | ProbeEvent::ReconnectFailed => {
            tracing::warn!(event = event.as_str(), "probe transition")
        }
        ProbeEvent::ReconnectAbandoned => tracing::error!(event = event.as_str(), "probe transition"),
        ProbeEvent::ReconnectStarted | ProbeEvent::ReconnectSuccess => {
            tracing::info!(event = event.as_str(), "probe transition")
        }
    }
}

/// Low-cardinality periodic "probe still succeeding" event, emitted on the
/// first success after startup or after a `Healthy` transition,
/// not on every tick.
pub fn record_probe_success_tick() {
    metrics::counter!("probe_success_total", 1);
    tracing::debug!("probe tick succeeded");
}
