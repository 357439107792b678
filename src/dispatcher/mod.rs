//! Self-feeding work dispatcher.
//!
//! A [`Dispatcher`] owns a FIFO queue of items and a pool of worker threads
//! that drain it in batches. The consumer function may enqueue new items while
//! it runs, so recursive workloads (tree or graph traversal) finish only when
//! the queue is empty *and* no worker is still holding a batch.
//!
//! ```text
//!   enqueue ──▶ [ pending items ] ──dequeue(batch)──▶ worker 0..N ──▶ consumer
//!                    ▲                                                  │
//!                    └──────────────── enqueue (from consumer) ◀────────┘
//! ```
//!
//! Lifecycle: `Ready → Started → Ending → Ready`. [`Dispatcher::start`] launches
//! the workers, [`Dispatcher::wait_for_completion`] blocks until the work runs
//! dry, tells the workers to stop, joins them and makes the dispatcher
//! reusable.

pub mod handlers;
pub mod stats;
mod worker;

pub use handlers::{ConsumerFn, ErrorHandlerFn, LifecycleEvent, LifecycleFn, WorkerState};
pub use stats::{DispatchStats, RunSummary};

use std::collections::VecDeque;
use std::fmt;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{Span, debug, error, info, warn};
use uuid::Uuid;

use crate::counter::Counter;
use crate::error::{Error, ItemError, Result};
use crate::telemetry::metrics::DispatchMetrics;
use crate::telemetry::run::{record_status_transition, start_run_span};
use stats::RunCounters;
use worker::{StartupReport, Worker};

/// Default idle re-check interval for workers.
pub const DEFAULT_IDLE_POLL: Duration = Duration::from_millis(50);
/// Default re-check interval for [`Dispatcher::wait_for_completion`].
pub const DEFAULT_COMPLETION_POLL: Duration = Duration::from_millis(100);
/// Default number of items a worker takes per dequeue.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Dispatcher lifecycle status. Only moves `Ready → Started → Ending → Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ready,
    Started,
    Ending,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => f.write_str("ready"),
            Self::Started => f.write_str("started"),
            Self::Ending => f.write_str("ending"),
        }
    }
}

/// Tuning knobs for a dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherOptions {
    /// Maximum items a single dequeue hands to a worker. Must be at least 1.
    pub batch_size: usize,
    /// Upper bound on how long an idle worker sleeps before re-checking the queue.
    pub idle_poll: Duration,
    /// Upper bound on how long `wait_for_completion` sleeps between checks.
    pub completion_poll: Duration,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            idle_poll: DEFAULT_IDLE_POLL,
            completion_poll: DEFAULT_COMPLETION_POLL,
        }
    }
}

/// Whether workers that finished their start hook may begin draining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaunchGate {
    Pending,
    Open,
    Aborted,
}

struct RunInfo {
    run_id: Uuid,
    workers: usize,
    started_at: DateTime<Utc>,
    baseline: DispatchStats,
    span: Span,
}

/// Everything guarded by the queue lock: the queue itself and the phase.
struct QueueState<T> {
    pending: VecDeque<T>,
    status: Status,
    failed: bool,
    gate: LaunchGate,
    run: Option<RunInfo>,
}

pub(crate) struct Shared<T> {
    state: Mutex<QueueState<T>>,
    wake: Condvar,
    active: Counter,
    options: DispatcherOptions,
    consumer: Arc<ConsumerFn<T>>,
    error_handler: RwLock<Option<Arc<ErrorHandlerFn<T>>>>,
    lifecycle: RwLock<Option<Arc<LifecycleFn<T>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: RunCounters,
    metrics: DispatchMetrics,
}

/// Handle to a dispatcher. Cloning is cheap and every clone drives the same
/// queue; the consumer receives one so it can enqueue follow-up work.
///
/// Workers keep a handle alive until they are joined, so every successful
/// [`start`](Self::start) must be paired with
/// [`wait_for_completion`](Self::wait_for_completion).
pub struct Dispatcher<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Dispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Dispatcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock_state();
        f.debug_struct("Dispatcher")
            .field("status", &state.status)
            .field("pending", &state.pending.len())
            .field("batch_size", &self.shared.options.batch_size)
            .finish_non_exhaustive()
    }
}

impl<T: fmt::Debug + Send + 'static> Dispatcher<T> {
    /// Create a dispatcher in `Ready` state with an empty queue.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidBatchSize`] if `batch_size` is 0.
    pub fn new<F>(consumer: F, batch_size: usize) -> Result<Self>
    where
        F: Fn(&Dispatcher<T>, usize, &T, &mut WorkerState) -> std::result::Result<(), ItemError>
            + Send
            + Sync
            + 'static,
    {
        Self::with_options(
            consumer,
            DispatcherOptions {
                batch_size,
                ..DispatcherOptions::default()
            },
        )
    }

    /// Create a dispatcher with explicit poll intervals.
    pub fn with_options<F>(consumer: F, options: DispatcherOptions) -> Result<Self>
    where
        F: Fn(&Dispatcher<T>, usize, &T, &mut WorkerState) -> std::result::Result<(), ItemError>
            + Send
            + Sync
            + 'static,
    {
        if options.batch_size == 0 {
            return Err(Error::InvalidBatchSize);
        }
        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    pending: VecDeque::with_capacity(options.batch_size),
                    status: Status::Ready,
                    failed: false,
                    gate: LaunchGate::Pending,
                    run: None,
                }),
                wake: Condvar::new(),
                active: Counter::new(),
                options,
                consumer: Arc::new(consumer),
                error_handler: RwLock::new(None),
                lifecycle: RwLock::new(None),
                workers: Mutex::new(Vec::new()),
                counters: RunCounters::default(),
                metrics: DispatchMetrics::new(),
            }),
        })
    }

    /// Install the handler that decides whether a failed item was recovered.
    ///
    /// Without a handler, item errors are logged and never mark the run failed.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&Dispatcher<T>, usize, &T, &ItemError, &mut WorkerState) -> bool
            + Send
            + Sync
            + 'static,
    {
        *self
            .shared
            .error_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Install the per-worker start/stop hook that owns worker-local state.
    pub fn set_lifecycle_handler<F>(&self, handler: F)
    where
        F: Fn(
                &Dispatcher<T>,
                usize,
                LifecycleEvent,
                WorkerState,
            ) -> std::result::Result<WorkerState, ItemError>
            + Send
            + Sync
            + 'static,
    {
        *self
            .shared
            .lifecycle
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Append items to the tail of the queue.
    ///
    /// Safe to call from any thread at any time, including from inside the
    /// consumer on a worker thread.
    pub fn enqueue<I>(&self, items: I)
    where
        I: IntoIterator<Item = T>,
    {
        let added = {
            let mut state = self.shared.lock_state();
            let before = state.pending.len();
            state.pending.extend(items);
            state.pending.len() - before
        };
        if added > 0 {
            self.shared.counters.record_enqueued(added);
            self.shared.metrics.record_enqueued(added);
            self.shared.wake.notify_all();
        }
    }

    /// Append a single item.
    pub fn push(&self, item: T) {
        self.enqueue(std::iter::once(item));
    }

    /// Launch `workers` worker threads with indices `0..workers`.
    ///
    /// Every worker runs the lifecycle `Started` hook on its own thread before
    /// touching the queue. If any hook fails the whole launch is rolled back:
    /// workers that did start run their `Stopped` hook, all threads are
    /// joined, the queue is left as it was and the dispatcher returns to
    /// `Ready`.
    ///
    /// # Errors
    ///
    /// - [`Error::StatusConflict`] if the dispatcher is not `Ready`; nothing changes.
    /// - [`Error::InvalidWorkerCount`] if `workers` is 0.
    /// - [`Error::WorkerStartup`] if a `Started` hook failed.
    /// - [`Error::Spawn`] if a worker thread could not be created.
    pub fn start(&self, workers: usize) -> Result<()> {
        let run_id = Uuid::new_v4();
        let span = start_run_span(&run_id, workers, self.shared.options.batch_size);
        {
            let mut state = self.shared.lock_state();
            if state.status != Status::Ready {
                return Err(Error::StatusConflict {
                    status: state.status,
                });
            }
            if workers == 0 {
                return Err(Error::InvalidWorkerCount);
            }
            let baseline = self.shared.snapshot(&state);
            state.status = Status::Started;
            state.failed = false;
            state.gate = LaunchGate::Pending;
            state.run = Some(RunInfo {
                run_id,
                workers,
                started_at: Utc::now(),
                baseline,
                span: span.clone(),
            });
        }
        record_status_transition(&span, Status::Ready, Status::Started);

        let (report_tx, report_rx) = mpsc::channel::<StartupReport>();
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let worker = Worker::new(self.clone(), index, &span);
            let report = report_tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("dispatch-worker-{index}"))
                .spawn(move || worker.run(report));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    error!(parent: &span, worker = index, error = %e, "failed to spawn worker thread");
                    drop(report_tx);
                    self.abort_launch(handles, &span);
                    return Err(Error::Spawn(e));
                }
            }
        }
        drop(report_tx);

        let mut failure: Option<Error> = None;
        for _ in 0..handles.len() {
            match report_rx.recv() {
                Ok(StartupReport { worker, outcome }) => match outcome {
                    Ok(()) => self.shared.metrics.record_worker_started(),
                    Err(source) => {
                        self.shared.metrics.record_worker_startup_failed();
                        if failure.is_none() {
                            failure = Some(Error::WorkerStartup { worker, source });
                        }
                    }
                },
                Err(_) => {
                    failure.get_or_insert_with(|| {
                        Error::Other("worker exited before reporting startup".to_string())
                    });
                    break;
                }
            }
        }

        if let Some(err) = failure {
            warn!(parent: &span, error = %err, "aborting launch");
            self.abort_launch(handles, &span);
            return Err(err);
        }

        *self
            .shared
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = handles;
        self.shared.lock_state().gate = LaunchGate::Open;
        self.shared.wake.notify_all();
        info!(parent: &span, workers, "dispatcher started");
        Ok(())
    }

    /// Block until the queue is empty and no worker holds a batch, then stop
    /// and join the workers and return to `Ready`.
    ///
    /// Returns `None` without blocking if the dispatcher was not started.
    /// Must not be called from inside a callback running on a worker.
    pub fn wait_for_completion(&self) -> Option<RunSummary> {
        let mut state = self.shared.lock_state();
        if state.status < Status::Started {
            return None;
        }
        while self.shared.is_working_locked(&state) {
            state = self.shared.wait(state, self.shared.options.completion_poll);
        }
        state.status = Status::Ending;
        let span = state.run.as_ref().map(|run| run.span.clone());
        drop(state);
        self.shared.wake.notify_all();
        if let Some(span) = &span {
            record_status_transition(span, Status::Started, Status::Ending);
        }

        let handles = std::mem::take(
            &mut *self
                .shared
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            if handle.join().is_err() {
                error!("worker thread panicked outside item processing");
            }
        }

        let mut state = self.shared.lock_state();
        state.status = Status::Ready;
        let succeeded = !state.failed;
        let run = state.run.take();
        let totals = self.shared.snapshot(&state);
        drop(state);

        let run = run?;
        record_status_transition(&run.span, Status::Ending, Status::Ready);
        let summary = RunSummary::new(
            run.run_id,
            run.workers,
            run.started_at,
            &run.baseline,
            &totals,
            succeeded,
        );
        info!(
            parent: &run.span,
            processed = summary.processed,
            failed = summary.failed,
            succeeded,
            "dispatcher completed"
        );
        Some(summary)
    }

    /// True while items are queued or any worker is in the middle of a batch.
    pub fn is_working(&self) -> bool {
        let state = self.shared.lock_state();
        self.shared.is_working_locked(&state)
    }

    /// False once any item error went unrecovered by the configured handler.
    ///
    /// Only meaningful after [`wait_for_completion`](Self::wait_for_completion).
    pub fn is_succeeded(&self) -> bool {
        !self.shared.lock_state().failed
    }

    pub fn status(&self) -> Status {
        self.shared.lock_state().status
    }

    pub fn batch_size(&self) -> usize {
        self.shared.options.batch_size
    }

    pub fn pending_len(&self) -> usize {
        self.shared.lock_state().pending.len()
    }

    /// Number of workers currently processing a batch.
    pub fn active_workers(&self) -> i64 {
        self.shared.active.value()
    }

    /// Lifetime counters for this dispatcher.
    pub fn stats(&self) -> DispatchStats {
        let state = self.shared.lock_state();
        self.shared.snapshot(&state)
    }

    /// Take up to `batch_size` items from the head of the queue.
    #[cfg(test)]
    pub(crate) fn dequeue(&self) -> Vec<T> {
        let mut state = self.shared.lock_state();
        dequeue(&mut state.pending, self.shared.options.batch_size)
    }

    fn abort_launch(&self, handles: Vec<JoinHandle<()>>, span: &Span) {
        {
            let mut state = self.shared.lock_state();
            state.gate = LaunchGate::Aborted;
            state.status = Status::Ending;
        }
        self.shared.wake.notify_all();
        record_status_transition(span, Status::Started, Status::Ending);
        for handle in handles {
            if handle.join().is_err() {
                error!(parent: span, "worker thread panicked during aborted launch");
            }
        }
        let mut state = self.shared.lock_state();
        state.status = Status::Ready;
        state.run = None;
        drop(state);
        record_status_transition(span, Status::Ending, Status::Ready);
        debug!(parent: span, "launch rolled back");
    }
}

impl<T> Shared<T> {
    fn lock_state(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(
        &self,
        guard: MutexGuard<'a, QueueState<T>>,
        timeout: Duration,
    ) -> MutexGuard<'a, QueueState<T>> {
        self.wake
            .wait_timeout(guard, timeout)
            .unwrap_or_else(PoisonError::into_inner)
            .0
    }

    /// Caller must hold the queue lock, which is what keeps the queue length
    /// and the active count consistent with each other.
    fn is_working_locked(&self, state: &QueueState<T>) -> bool {
        !state.pending.is_empty() || self.active.value() > 0
    }

    fn snapshot(&self, state: &QueueState<T>) -> DispatchStats {
        self.counters.snapshot(state.pending.len(), self.active.value())
    }

    /// Block until `start` decides whether this run goes ahead.
    fn await_launch(&self) -> bool {
        let mut state = self.lock_state();
        while state.gate == LaunchGate::Pending {
            state = self.wait(state, self.options.idle_poll);
        }
        state.gate == LaunchGate::Open
    }

    /// Hand the next batch to a worker, or `None` once it may exit.
    ///
    /// The dequeue and the active-count increment share one critical section,
    /// as does the exit check with `enqueue`, so a worker never leaves while a
    /// sibling can still feed the queue.
    fn next_batch(&self) -> Option<Vec<T>> {
        let mut state = self.lock_state();
        loop {
            let batch = dequeue(&mut state.pending, self.options.batch_size);
            if !batch.is_empty() {
                self.active.increase_by(1);
                return Some(batch);
            }
            if !self.is_working_locked(&state) && state.status >= Status::Ending {
                return None;
            }
            state = self.wait(state, self.options.idle_poll);
        }
    }

    fn finish_batch(&self) {
        {
            let _state = self.lock_state();
            self.active.increase_by(-1);
        }
        self.wake.notify_all();
    }

    fn mark_failed(&self) {
        self.lock_state().failed = true;
    }

    fn error_handler(&self) -> Option<Arc<ErrorHandlerFn<T>>> {
        self.error_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lifecycle(&self) -> Option<Arc<LifecycleFn<T>>> {
        self.lifecycle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// The only place the queue shrinks.
fn dequeue<T>(pending: &mut VecDeque<T>, batch_size: usize) -> Vec<T> {
    let take = pending.len().min(batch_size);
    pending.drain(..take).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Dispatcher<u32> {
        Dispatcher::new(|_, _, _, _| Ok(()), 3).unwrap()
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let result = Dispatcher::<u32>::new(|_, _, _, _| Ok(()), 0);
        assert!(matches!(result, Err(Error::InvalidBatchSize)));
    }

    #[test]
    fn dequeue_caps_at_batch_size_and_keeps_order() {
        let dispatcher = noop();
        dispatcher.enqueue(1..=7);

        assert_eq!(dispatcher.dequeue(), vec![1, 2, 3]);
        assert_eq!(dispatcher.dequeue(), vec![4, 5, 6]);
        assert_eq!(dispatcher.dequeue(), vec![7]);
        assert!(dispatcher.dequeue().is_empty());
    }

    #[test]
    fn is_working_tracks_queue_and_active_batches() {
        let dispatcher = noop();
        assert!(!dispatcher.is_working());

        dispatcher.push(1);
        assert!(dispatcher.is_working());

        let batch = dispatcher.shared.next_batch().unwrap();
        assert_eq!(batch, vec![1]);
        assert_eq!(dispatcher.active_workers(), 1);
        assert!(dispatcher.is_working());

        dispatcher.shared.finish_batch();
        assert!(!dispatcher.is_working());
    }

    #[test]
    fn wait_without_start_is_a_no_op() {
        let dispatcher = noop();
        dispatcher.push(1);
        assert!(dispatcher.wait_for_completion().is_none());
        assert_eq!(dispatcher.status(), Status::Ready);
        assert_eq!(dispatcher.pending_len(), 1);
    }

    #[test]
    fn status_orders_by_phase() {
        assert!(Status::Ready < Status::Started);
        assert!(Status::Started < Status::Ending);
        assert_eq!(Status::Ending.to_string(), "ending");
    }
}
