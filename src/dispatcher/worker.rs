//! The per-index worker task.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::Sender;

use anyhow::anyhow;
use tracing::{Span, debug, error, warn};

use crate::error::ItemError;
use crate::telemetry::metrics::FailureOutcome;
use crate::telemetry::run::start_worker_span;

use super::handlers::{LifecycleEvent, WorkerState};
use super::{Dispatcher, Shared};

/// Sent once by every worker after its `Started` hook.
pub(super) struct StartupReport {
    pub(super) worker: usize,
    pub(super) outcome: Result<(), ItemError>,
}

pub(super) struct Worker<T> {
    dispatcher: Dispatcher<T>,
    index: usize,
    local: WorkerState,
    span: Span,
}

/// Decrements the active count when a batch ends, even if unwinding.
struct ActiveBatch<'a, T> {
    shared: &'a Shared<T>,
}

impl<T> Drop for ActiveBatch<'_, T> {
    fn drop(&mut self) {
        self.shared.finish_batch();
    }
}

impl<T: fmt::Debug + Send + 'static> Worker<T> {
    pub(super) fn new(dispatcher: Dispatcher<T>, index: usize, run_span: &Span) -> Self {
        Self {
            dispatcher,
            index,
            local: WorkerState::empty(),
            span: start_worker_span(run_span, index),
        }
    }

    pub(super) fn run(mut self, report: Sender<StartupReport>) {
        let span = self.span.clone();
        let _enter = span.enter();

        let outcome = self.lifecycle(LifecycleEvent::Started);
        let started = outcome.is_ok();
        if let Err(e) = &outcome {
            error!(worker = self.index, error = %format!("{e:#}"), "worker startup hook failed");
        }
        // A closed channel means start() already gave up on this run.
        let _ = report.send(StartupReport {
            worker: self.index,
            outcome,
        });
        drop(report);
        if !started {
            return;
        }

        if self.dispatcher.shared.await_launch() {
            debug!(worker = self.index, "worker draining");
            self.drain();
        }

        if let Err(e) = self.lifecycle(LifecycleEvent::Stopped) {
            warn!(worker = self.index, error = %format!("{e:#}"), "worker shutdown hook failed");
        }
        debug!(worker = self.index, "worker stopped");
    }

    fn drain(&mut self) {
        let shared = std::sync::Arc::clone(&self.dispatcher.shared);
        while let Some(batch) = shared.next_batch() {
            let _active = ActiveBatch { shared: &shared };
            shared.metrics.record_batch(batch.len());
            for item in &batch {
                self.process(item);
            }
        }
    }

    fn process(&mut self, item: &T) {
        let shared = &self.dispatcher.shared;
        let consumer = &shared.consumer;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            consumer(&self.dispatcher, self.index, item, &mut self.local)
        }));
        let result = match outcome {
            Ok(result) => result,
            Err(payload) => Err(anyhow!("consumer panicked: {}", panic_message(payload.as_ref()))),
        };
        shared.counters.record_processed();
        shared.metrics.record_processed();

        if let Err(err) = result {
            self.on_item_error(item, err);
        }
    }

    /// Without a handler the error is only logged and never fails the run;
    /// a handler that returns `false` (or panics) marks the run failed.
    fn on_item_error(&mut self, item: &T, err: ItemError) {
        let shared = &self.dispatcher.shared;
        let Some(handler) = shared.error_handler() else {
            warn!(
                worker = self.index,
                item = ?item,
                error = %format!("{err:#}"),
                "item failed"
            );
            shared.counters.record_failed(false);
            shared.metrics.record_failed(FailureOutcome::Unhandled);
            return;
        };

        let recovered = panic::catch_unwind(AssertUnwindSafe(|| {
            handler(&self.dispatcher, self.index, item, &err, &mut self.local)
        }))
        .unwrap_or_else(|payload| {
            error!(
                worker = self.index,
                panic = %panic_message(payload.as_ref()),
                "error handler panicked"
            );
            false
        });

        shared.counters.record_failed(!recovered);
        shared.metrics.record_failed(if recovered {
            FailureOutcome::Recovered
        } else {
            FailureOutcome::Unrecovered
        });
        if !recovered {
            debug!(worker = self.index, item = ?item, "item not recovered, run marked failed");
            shared.mark_failed();
        }
    }

    /// Run the lifecycle hook if one is installed. The prior state moves into
    /// the hook and whatever it returns becomes the worker's state.
    fn lifecycle(&mut self, event: LifecycleEvent) -> Result<(), ItemError> {
        let Some(hook) = self.dispatcher.shared.lifecycle() else {
            return Ok(());
        };
        let prior = match event {
            LifecycleEvent::Started => WorkerState::empty(),
            LifecycleEvent::Stopped => std::mem::take(&mut self.local),
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            hook(&self.dispatcher, self.index, event, prior)
        }));
        match outcome {
            Ok(Ok(state)) => {
                self.local = state;
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(payload) => Err(anyhow!(
                "{event} hook panicked: {}",
                panic_message(payload.as_ref())
            )),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
