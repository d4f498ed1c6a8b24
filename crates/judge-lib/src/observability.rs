//! Observability infrastructure for the alert judge
//!
//! Provides:
//! - Prometheus metrics (drops, queue depth, remote-write outcomes, events emitted)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::models::AlertEvent;

/// Buckets for remote-write round trips (in seconds)
const LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<JudgeMetricsInner> = OnceLock::new();

struct JudgeMetricsInner {
    invalid_samples: IntCounter,
    write_queue_dropped: IntCounter,
    write_queue_length: IntGauge,
    remote_write_batches: IntCounterVec,
    remote_write_retries: IntCounterVec,
    remote_write_latency_seconds: Histogram,
    query_errors: IntCounterVec,
    events: IntCounterVec,
    event_queue_dropped: IntCounter,
    cached_series: IntGauge,
    pull_evaluators: IntGauge,
    ring_unassigned: IntCounter,
    push_dropped: IntCounter,
}

impl JudgeMetricsInner {
    fn new() -> Self {
        Self {
            invalid_samples: register_int_counter!(
                "judge_invalid_samples_total",
                "Samples rejected by the converter"
            )
            .expect("Failed to register invalid_samples"),

            write_queue_dropped: register_int_counter!(
                "judge_write_queue_dropped_total",
                "Samples dropped because the write queue was full"
            )
            .expect("Failed to register write_queue_dropped"),

            write_queue_length: register_int_gauge!(
                "judge_write_queue_length",
                "Series waiting in the write queue"
            )
            .expect("Failed to register write_queue_length"),

            remote_write_batches: register_int_counter_vec!(
                "judge_remote_write_batches_total",
                "Remote-write batches by target and outcome",
                &["target", "result"]
            )
            .expect("Failed to register remote_write_batches"),

            remote_write_retries: register_int_counter_vec!(
                "judge_remote_write_retries_total",
                "Remote-write retry attempts by target",
                &["target"]
            )
            .expect("Failed to register remote_write_retries"),

            remote_write_latency_seconds: register_histogram!(
                "judge_remote_write_latency_seconds",
                "Latency of a single remote-write POST",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register remote_write_latency_seconds"),

            query_errors: register_int_counter_vec!(
                "judge_query_errors_total",
                "Backend query failures by caller",
                &["source"]
            )
            .expect("Failed to register query_errors"),

            events: register_int_counter_vec!(
                "judge_events_total",
                "Events handed to the event queue",
                &["kind"]
            )
            .expect("Failed to register events"),

            event_queue_dropped: register_int_counter!(
                "judge_event_queue_dropped_total",
                "Events dropped because the event queue was full"
            )
            .expect("Failed to register event_queue_dropped"),

            cached_series: register_int_gauge!(
                "judge_cached_series",
                "Series windows held by the point cache"
            )
            .expect("Failed to register cached_series"),

            pull_evaluators: register_int_gauge!(
                "judge_pull_evaluators",
                "PULL rule evaluators running on this instance"
            )
            .expect("Failed to register pull_evaluators"),

            ring_unassigned: register_int_counter!(
                "judge_ring_unassigned_total",
                "PULL rules skipped because the ring had no owner"
            )
            .expect("Failed to register ring_unassigned"),

            push_dropped: register_int_counter!(
                "judge_push_dropped_total",
                "Points dropped because a PUSH worker queue was full"
            )
            .expect("Failed to register push_dropped"),
        }
    }
}

/// Judge metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share it.
#[derive(Clone)]
pub struct JudgeMetrics {
    _private: (),
}

impl Default for JudgeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl JudgeMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(JudgeMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &JudgeMetricsInner {
        GLOBAL_METRICS.get_or_init(JudgeMetricsInner::new)
    }

    pub fn inc_invalid_sample(&self) {
        self.inner().invalid_samples.inc();
    }

    pub fn inc_write_queue_dropped(&self) {
        self.inner().write_queue_dropped.inc();
    }

    pub fn set_write_queue_length(&self, len: usize) {
        self.inner().write_queue_length.set(len as i64);
    }

    /// Record the final outcome of one batch for one target
    pub fn inc_remote_write(&self, target: &str, result: &str) {
        self.inner()
            .remote_write_batches
            .with_label_values(&[target, result])
            .inc();
    }

    pub fn inc_remote_write_retry(&self, target: &str) {
        self.inner()
            .remote_write_retries
            .with_label_values(&[target])
            .inc();
    }

    pub fn observe_remote_write_latency(&self, duration_secs: f64) {
        self.inner().remote_write_latency_seconds.observe(duration_secs);
    }

    pub fn inc_query_error(&self, source: &str) {
        self.inner().query_errors.with_label_values(&[source]).inc();
    }

    pub fn inc_event(&self, kind: &str) {
        self.inner().events.with_label_values(&[kind]).inc();
    }

    pub fn inc_event_dropped(&self) {
        self.inner().event_queue_dropped.inc();
    }

    pub fn set_cached_series(&self, count: usize) {
        self.inner().cached_series.set(count as i64);
    }

    pub fn set_pull_evaluators(&self, count: usize) {
        self.inner().pull_evaluators.set(count as i64);
    }

    pub fn inc_ring_unassigned(&self) {
        self.inner().ring_unassigned.inc();
    }

    pub fn inc_push_dropped(&self) {
        self.inner().push_dropped.inc();
    }

    /// Events dropped on a full event queue since start
    pub fn event_queue_dropped_total(&self) -> u64 {
        self.inner().event_queue_dropped.get()
    }

    /// Points dropped on a full PUSH worker queue since start
    pub fn push_dropped_total(&self) -> u64 {
        self.inner().push_dropped.get()
    }
}

/// Structured logger for judge lifecycle events
///
/// Every line carries a fixed `event` field and the instance endpoint.
#[derive(Clone)]
pub struct StructuredLogger {
    endpoint: String,
}

impl StructuredLogger {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    pub fn log_startup(&self, version: &str, datasource: &str) {
        info!(
            event = "judge_started",
            endpoint = %self.endpoint,
            version = %version,
            datasource = %datasource,
            "Alert judge started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "judge_shutdown",
            endpoint = %self.endpoint,
            reason = %reason,
            "Alert judge shutting down"
        );
    }

    /// Log an event the state store just handed downstream
    pub fn log_event_emitted(&self, event: &AlertEvent) {
        if event.is_alerting() {
            info!(
                event = "alert_emitted",
                endpoint = %self.endpoint,
                rule_id = event.rule_id,
                hash_id = %event.hash_id,
                trigger_time = event.trigger_time,
                pull = event.is_pull(),
                values = %event.values,
                "Alert emitted"
            );
        } else {
            info!(
                event = "recovery_emitted",
                endpoint = %self.endpoint,
                rule_id = event.rule_id,
                hash_id = %event.hash_id,
                trigger_time = event.trigger_time,
                pull = event.is_pull(),
                "Recovery emitted"
            );
        }
    }

    pub fn log_event_dropped(&self, event: &AlertEvent, capacity: usize) {
        warn!(
            event = "event_dropped",
            endpoint = %self.endpoint,
            rule_id = event.rule_id,
            hash_id = %event.hash_id,
            capacity = capacity,
            "Event queue full, event dropped"
        );
    }
}
