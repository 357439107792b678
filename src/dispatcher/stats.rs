//! Run statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Lifetime counters, bumped by workers without taking the queue lock.
#[derive(Debug, Default)]
pub(crate) struct RunCounters {
    enqueued: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    unrecovered: AtomicU64,
}

impl RunCounters {
    pub(crate) fn record_enqueued(&self, n: usize) {
        self.enqueued.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self, unrecovered: bool) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        if unrecovered {
            self.unrecovered.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self, pending: usize, active_workers: i64) -> DispatchStats {
        DispatchStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            unrecovered: self.unrecovered.load(Ordering::Relaxed),
            pending,
            active_workers,
        }
    }
}

/// Point-in-time view of a dispatcher's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Items ever enqueued.
    pub enqueued: u64,
    /// Items handed to the consumer, successful or not.
    pub processed: u64,
    /// Items whose consumer call returned an error or panicked.
    pub failed: u64,
    /// Failed items an error handler did not recover.
    pub unrecovered: u64,
    pub pending: usize,
    pub active_workers: i64,
}

/// Outcome of one `start` … `wait_for_completion` cycle.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub workers: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Items enqueued while the run was active, seeds excluded.
    pub enqueued: u64,
    pub processed: u64,
    pub failed: u64,
    pub unrecovered: u64,
    pub succeeded: bool,
}

impl RunSummary {
    pub(crate) fn new(
        run_id: Uuid,
        workers: usize,
        started_at: DateTime<Utc>,
        baseline: &DispatchStats,
        totals: &DispatchStats,
        succeeded: bool,
    ) -> Self {
        Self {
            run_id,
            workers,
            started_at,
            finished_at: Utc::now(),
            enqueued: totals.enqueued - baseline.enqueued,
            processed: totals.processed - baseline.processed,
            failed: totals.failed - baseline.failed,
            unrecovered: totals.unrecovered - baseline.unrecovered,
            succeeded,
        }
    }

    /// Wall-clock duration of the run.
    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}
