//! Prometheus metrics for the share engine
//!
//! This module is only compiled when the `metrics` feature is enabled.
//!
//! Exposed metrics:
//! - `share_item_outcomes_total` - Counter of item grant/revoke/verify outcomes
//! - `dataset_lock_wait_seconds` - Histogram of time spent waiting for a dataset lock
//! - `share_sweep_errors_total` - Counter of errors collected by background sweeps

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram, CounterVec, Encoder, Histogram, TextEncoder,
};
use std::time::Duration;

lazy_static! {
    /// Item outcomes by operation (grant, revoke, verify, reapply) and outcome
    pub static ref SHARE_ITEM_OUTCOMES_TOTAL: CounterVec = register_counter_vec!(
        "share_item_outcomes_total",
        "Total number of share item outcomes",
        &["operation", "outcome"]
    )
    .unwrap();

    /// Time between requesting and obtaining a dataset lock
    pub static ref DATASET_LOCK_WAIT_SECONDS: Histogram = register_histogram!(
        "dataset_lock_wait_seconds",
        "Time spent waiting for a dataset lock in seconds",
        vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 120.0, 300.0, 600.0]
    )
    .unwrap();

    /// Errors collected by the verifier and reapplier
    pub static ref SHARE_SWEEP_ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "share_sweep_errors_total",
        "Total number of errors collected by share sweeps",
        &["task"]
    )
    .unwrap();
}

pub fn record_item_outcome(operation: &str, outcome: &str) {
    SHARE_ITEM_OUTCOMES_TOTAL
        .with_label_values(&[operation, outcome])
        .inc();
}

pub fn record_lock_wait(waited: Duration) {
    DATASET_LOCK_WAIT_SECONDS.observe(waited.as_secs_f64());
}

pub fn record_sweep_errors(task: &str, count: usize) {
    SHARE_SWEEP_ERRORS_TOTAL
        .with_label_values(&[task])
        .inc_by(count as f64);
}

/// Render every registered metric in the text exposition format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    match encoder.encode(&prometheus::gather(), &mut buffer) {
        Ok(()) => String::from_utf8_lossy(&buffer).into_owned(),
        Err(e) => format!("# failed to encode metrics: {}\n", e),
    }
}
