//! Caller-supplied callbacks and the per-worker state slot they share.

use std::any::Any;
use std::fmt;

use crate::error::ItemError;

use super::Dispatcher;

/// Processes one item. May call [`Dispatcher::enqueue`] to feed more work.
///
/// Arguments: dispatcher, worker index, item, the worker's local state.
pub type ConsumerFn<T> =
    dyn Fn(&Dispatcher<T>, usize, &T, &mut WorkerState) -> Result<(), ItemError> + Send + Sync;

/// Decides whether a failed item was recovered. Returning `false` marks the run failed.
///
/// Arguments: dispatcher, worker index, item, the consumer's error, the worker's local state.
pub type ErrorHandlerFn<T> =
    dyn Fn(&Dispatcher<T>, usize, &T, &ItemError, &mut WorkerState) -> bool + Send + Sync;

/// Builds worker-local state on start and tears it down on stop.
///
/// Receives the prior state (empty on [`LifecycleEvent::Started`]) and returns
/// the state the worker keeps from then on.
pub type LifecycleFn<T> = dyn Fn(&Dispatcher<T>, usize, LifecycleEvent, WorkerState) -> Result<WorkerState, ItemError>
    + Send
    + Sync;

/// Lifecycle events delivered once per worker per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Started,
    Stopped,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started => f.write_str("started"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

/// Opaque slot owned by exactly one worker between its start and stop events.
///
/// The shape of the state is up to the caller; it is stored type-erased and
/// recovered with [`WorkerState::get`] / [`WorkerState::get_mut`].
#[derive(Default)]
pub struct WorkerState(Option<Box<dyn Any + Send>>);

impl WorkerState {
    /// An empty slot.
    pub fn empty() -> Self {
        Self(None)
    }

    /// A slot holding `value`.
    pub fn new<S: Any + Send>(value: S) -> Self {
        Self(Some(Box::new(value)))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// Borrow the state if present and of type `S`.
    pub fn get<S: Any>(&self) -> Option<&S> {
        self.0.as_ref().and_then(|b| b.downcast_ref::<S>())
    }

    /// Mutably borrow the state if present and of type `S`.
    pub fn get_mut<S: Any>(&mut self) -> Option<&mut S> {
        self.0.as_mut().and_then(|b| b.downcast_mut::<S>())
    }

    /// Replace the contents of the slot.
    pub fn set<S: Any + Send>(&mut self, value: S) {
        self.0 = Some(Box::new(value));
    }

    /// Take the state out if it is of type `S`, leaving the slot empty.
    /// A value of another type is left in place.
    pub fn take<S: Any>(&mut self) -> Option<S> {
        match self.0.take() {
            Some(boxed) => match boxed.downcast::<S>() {
                Ok(value) => Some(*value),
                Err(other) => {
                    self.0 = Some(other);
                    None
                }
            },
            None => None,
        }
    }
}

impl fmt::Debug for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerState")
            .field("occupied", &self.0.is_some())
            .finish()
    }
}
