//! Run and worker span helpers.
//!
//! Every `start` opens a `dispatch.run` span; each worker thread runs inside
//! a `dispatch.worker` child span so its log lines carry the run id.

use tracing::Span;
use uuid::Uuid;

use crate::dispatcher::Status;

/// Start a span covering one start → wait_for_completion cycle.
pub fn start_run_span(run_id: &Uuid, workers: usize, batch_size: usize) -> Span {
    tracing::info_span!(
        "dispatch.run",
        "dispatch.run_id" = %run_id,
        "dispatch.workers" = workers,
        "dispatch.batch_size" = batch_size,
    )
}

/// Start a worker span nested under the run span.
pub fn start_worker_span(run_span: &Span, index: usize) -> Span {
    tracing::debug_span!(parent: run_span, "dispatch.worker", "dispatch.worker.index" = index)
}

/// Record a status transition event on the given span.
pub fn record_status_transition(span: &Span, from: Status, to: Status) {
    span.in_scope(|| {
        tracing::info!(from = %from, to = %to, "status_transition");
    });
}
