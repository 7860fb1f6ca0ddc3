//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `push_secret_pushes_total{store,outcome}` - Push attempts by destination store and outcome
//! - `push_secret_failures_total{kind}` - Failed pushes by failure kind
//! - `push_secret_backend_duration_seconds{store_kind}` - Duration of secret store calls
//! - `push_secret_retries_scheduled_total` - Backoff retries scheduled
//! - `push_secret_retries_exhausted_total` - Triples that exhausted their backoff retries
//! - `push_secret_drift_detected_total` - Remote values found modified out of band
//! - `push_secret_generator_runs_total{kind}` - Generator invocations
//! - `push_secret_generator_errors_total{kind}` - Generator failures
//! - `push_secret_queue_depth` - Tasks waiting for a worker
//! - `push_secret_in_flight` - Tasks currently executing
//! - `push_secret_store_healthy{store}` - Result of the last store health check (1 or 0)
//! - `push_secret_rules_reload_errors_total` - Rejected rule configuration reloads

use anyhow::Result;
use prometheus::{
    HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Registry,
};
use std::sync::LazyLock;

// Metrics
pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static PUSHES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "push_secret_pushes_total",
            "Total number of push attempts by destination store and outcome",
        ),
        &["store", "outcome"],
    )
    .expect("Failed to create PUSHES_TOTAL metric - this should never happen")
});

static FAILURES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "push_secret_failures_total",
            "Total number of failed pushes by failure kind",
        ),
        &["kind"],
    )
    .expect("Failed to create FAILURES_TOTAL metric - this should never happen")
});

static BACKEND_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new(
            "push_secret_backend_duration_seconds",
            "Duration of secret store calls in seconds by store kind",
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
        &["store_kind"],
    )
    .expect("Failed to create BACKEND_DURATION metric - this should never happen")
});

static RETRIES_SCHEDULED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "push_secret_retries_scheduled_total",
        "Total number of backoff retries scheduled",
    )
    .expect("Failed to create RETRIES_SCHEDULED_TOTAL metric - this should never happen")
});

static RETRIES_EXHAUSTED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "push_secret_retries_exhausted_total",
        "Total number of triples that exhausted their backoff retries",
    )
    .expect("Failed to create RETRIES_EXHAUSTED_TOTAL metric - this should never happen")
});

static DRIFT_DETECTED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "push_secret_drift_detected_total",
        "Total number of remote values found modified out of band",
    )
    .expect("Failed to create DRIFT_DETECTED_TOTAL metric - this should never happen")
});

static GENERATOR_RUNS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "push_secret_generator_runs_total",
            "Total number of generator invocations by generator kind",
        ),
        &["kind"],
    )
    .expect("Failed to create GENERATOR_RUNS_TOTAL metric - this should never happen")
});

static GENERATOR_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "push_secret_generator_errors_total",
            "Total number of generator failures by generator kind",
        ),
        &["kind"],
    )
    .expect("Failed to create GENERATOR_ERRORS_TOTAL metric - this should never happen")
});

static QUEUE_DEPTH: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("push_secret_queue_depth", "Tasks waiting for a worker")
        .expect("Failed to create QUEUE_DEPTH metric - this should never happen")
});

static IN_FLIGHT: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("push_secret_in_flight", "Tasks currently executing")
        .expect("Failed to create IN_FLIGHT metric - this should never happen")
});

static STORE_HEALTHY: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        prometheus::Opts::new(
            "push_secret_store_healthy",
            "Result of the last health check per store (1 healthy, 0 unhealthy)",
        ),
        &["store"],
    )
    .expect("Failed to create STORE_HEALTHY metric - this should never happen")
});

static RULES_RELOAD_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "push_secret_rules_reload_errors_total",
        "Total number of rejected rule configuration reloads",
    )
    .expect("Failed to create RULES_RELOAD_ERRORS_TOTAL metric - this should never happen")
});

#[allow(
    clippy::missing_errors_doc,
    reason = "Error documentation is provided in doc comments"
)]
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(PUSHES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(BACKEND_DURATION.clone()))?;
    REGISTRY.register(Box::new(RETRIES_SCHEDULED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RETRIES_EXHAUSTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DRIFT_DETECTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(GENERATOR_RUNS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(GENERATOR_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(QUEUE_DEPTH.clone()))?;
    REGISTRY.register(Box::new(IN_FLIGHT.clone()))?;
    REGISTRY.register(Box::new(STORE_HEALTHY.clone()))?;
    REGISTRY.register(Box::new(RULES_RELOAD_ERRORS_TOTAL.clone()))?;

    Ok(())
}

/// Render the registry in the Prometheus text exposition format
#[allow(
    clippy::missing_errors_doc,
    reason = "Error documentation is provided in doc comments"
)]
pub fn gather_text() -> Result<String> {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

pub fn record_push(store: &str, outcome: &str) {
    PUSHES_TOTAL.with_label_values(&[store, outcome]).inc();
}

pub fn increment_failures(kind: &str) {
    FAILURES_TOTAL.with_label_values(&[kind]).inc();
}

pub fn observe_backend_duration(store_kind: &str, duration: f64) {
    BACKEND_DURATION
        .with_label_values(&[store_kind])
        .observe(duration);
}

pub fn increment_retries_scheduled() {
    RETRIES_SCHEDULED_TOTAL.inc();
}

pub fn increment_retries_exhausted() {
    RETRIES_EXHAUSTED_TOTAL.inc();
}

pub fn increment_drift_detected() {
    DRIFT_DETECTED_TOTAL.inc();
}

pub fn record_generator_run(kind: &str, success: bool) {
    GENERATOR_RUNS_TOTAL.with_label_values(&[kind]).inc();
    if !success {
        GENERATOR_ERRORS_TOTAL.with_label_values(&[kind]).inc();
    }
}

pub fn set_queue_depth(depth: usize) {
    QUEUE_DEPTH.set(i64::try_from(depth).unwrap_or(i64::MAX));
}

pub fn increment_in_flight() {
    IN_FLIGHT.inc();
}

pub fn decrement_in_flight() {
    IN_FLIGHT.dec();
}

pub fn set_store_healthy(store: &str, healthy: bool) {
    STORE_HEALTHY
        .with_label_values(&[store])
        .set(i64::from(healthy));
}

pub fn remove_store(store: &str) {
    let _ = STORE_HEALTHY.remove_label_values(&[store]);
}

pub fn increment_rules_reload_errors() {
    RULES_RELOAD_ERRORS_TOTAL.inc();
}
