//! Metric instruments for dispatch-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Instruments are built once per dispatcher from the `"dispatch-rs"` meter;
//! with no provider installed they are no-ops.

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for dispatch-rs instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("dispatch-rs")
}

/// How a failed item was settled. Reported as the `outcome` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// No error handler configured; logged only.
    Unhandled,
    Recovered,
    Unrecovered,
}

impl FailureOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unhandled => "unhandled",
            Self::Recovered => "recovered",
            Self::Unrecovered => "unrecovered",
        }
    }
}

/// Instruments recorded by a dispatcher and its workers.
pub struct DispatchMetrics {
    enqueued: Counter<u64>,
    processed: Counter<u64>,
    failed: Counter<u64>,
    batch_size: Histogram<u64>,
    workers_started: Counter<u64>,
    workers_startup_failed: Counter<u64>,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        let meter = meter();
        Self {
            enqueued: meter
                .u64_counter("dispatch.items.enqueued")
                .with_description("Number of items enqueued")
                .build(),
            processed: meter
                .u64_counter("dispatch.items.processed")
                .with_description("Number of items handed to the consumer")
                .build(),
            failed: meter
                .u64_counter("dispatch.items.failed")
                .with_description("Number of items whose processing failed")
                .build(),
            batch_size: meter
                .u64_histogram("dispatch.batch.size")
                .with_description("Items per dequeued batch")
                .build(),
            workers_started: meter
                .u64_counter("dispatch.workers.started")
                .with_description("Workers that passed their start hook")
                .build(),
            workers_startup_failed: meter
                .u64_counter("dispatch.workers.startup_failed")
                .with_description("Workers whose start hook failed")
                .build(),
        }
    }

    pub fn record_enqueued(&self, n: usize) {
        self.enqueued.add(n as u64, &[]);
    }

    pub fn record_processed(&self) {
        self.processed.add(1, &[]);
    }

    /// Labels: `outcome` ("unhandled" | "recovered" | "unrecovered").
    pub fn record_failed(&self, outcome: FailureOutcome) {
        self.failed
            .add(1, &[KeyValue::new("outcome", outcome.as_str())]);
    }

    pub fn record_batch(&self, len: usize) {
        self.batch_size.record(len as u64, &[]);
    }

    pub fn record_worker_started(&self) {
        self.workers_started.add(1, &[]);
    }

    pub fn record_worker_startup_failed(&self) {
        self.workers_startup_failed.add(1, &[]);
    }
}

impl Default for DispatchMetrics {
    fn default() -> Self {
        Self::new()
    }
}
