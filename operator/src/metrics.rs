//! Controller metrics.
use std::{
    sync::atomic::{AtomicI64, Ordering},
    time::Duration,
};


use opentelemetry::{
    global,
    metrics::{Counter, Histogram, UpDownCounter},
    KeyValue,
};

use crate::loadtest::{LoadTestPhase, LoadTestType};

/// Result of one reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileResult {
    /// Reconcile completed.
    Ok,
    /// Reconcile was dropped without retry.
    Dropped,
    /// Reconcile failed and will be retried.
    Err,
}

impl ReconcileResult {
    fn as_str(&self) -> &'static str {
        match self {
            ReconcileResult::Ok => "ok",
            ReconcileResult::Dropped => "dropped",
            ReconcileResult::Err => "err",
        }
    }
}

/// Receives events worth measuring from the controller.
pub trait Reporter: Send + Sync {
    /// Number of load tests waiting for a retry after a failed reconcile.
    fn retries_pending(&self, pending: usize);
    /// A load test was reconciled.
    fn reconciled(&self, result: ReconcileResult, elapsed: Duration);
    /// Resources of a new load test were created.
    fn load_test_created(&self, load_test_type: LoadTestType);
    /// A load test reached a terminal phase.
    fn load_test_finished(&self, load_test_type: LoadTestType, phase: LoadTestPhase);
}

/// Reporter publishing to the global opentelemetry meter.
pub struct OtelReporter {
    pending: UpDownCounter<i64>,
    last_pending: AtomicI64,
    runs: Counter<u64>,
    latency: Histogram<f64>,
    created: Counter<u64>,
    finished: Counter<u64>,
}

impl Default for OtelReporter {
    fn default() -> Self {
        let meter = global::meter("kangal");
        Self {
            pending: meter
                .i64_up_down_counter("kangal_reconcile_retries_pending")
                .with_description("Number of load tests waiting for a retry")
                .init(),
            last_pending: AtomicI64::new(0),
            runs: meter
                .u64_counter("kangal_reconcile_count")
                .with_description("Number of load test reconciles")
                .init(),
            latency: meter
                .f64_histogram("kangal_reconcile_duration_seconds")
                .with_description("Duration of load test reconciles")
                .init(),
            created: meter
                .u64_counter("kangal_loadtest_created_count")
                .with_description("Number of load tests whose resources were created")
                .init(),
            finished: meter
                .u64_counter("kangal_loadtest_finished_count")
                .with_description("Number of load tests that reached a terminal phase")
                .init(),
        }
    }
}

impl Reporter for OtelReporter {
    fn retries_pending(&self, pending: usize) {
        let pending = pending as i64;
        let last = self.last_pending.swap(pending, Ordering::Relaxed);
        self.pending.add(pending - last, &[]);
    }

    fn reconciled(&self, result: ReconcileResult, elapsed: Duration) {
        let attrs = [KeyValue::new("result", result.as_str())];
        self.runs.add(1, &attrs);
        self.latency.record(elapsed.as_secs_f64(), &attrs);
    }

    fn load_test_created(&self, load_test_type: LoadTestType) {
        self.created
            .add(1, &[KeyValue::new("type", load_test_type.to_string())]);
    }

    fn load_test_finished(&self, load_test_type: LoadTestType, phase: LoadTestPhase) {
        self.finished.add(
            1,
            &[
                KeyValue::new("type", load_test_type.to_string()),
                KeyValue::new("phase", phase.to_string()),
            ],
        );
    }
}
