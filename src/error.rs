//! Error types for dispatch-rs.

use thiserror::Error;

use crate::dispatcher::Status;

/// Error produced by caller-supplied callbacks (consumer, lifecycle hook).
pub type ItemError = anyhow::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("dispatcher in status {status}")]
    StatusConflict { status: Status },

    #[error("batch size must be at least 1")]
    InvalidBatchSize,

    #[error("worker count must be at least 1")]
    InvalidWorkerCount,

    #[error("worker {worker} failed to start")]
    WorkerStartup {
        worker: usize,
        #[source]
        source: ItemError,
    },

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Follow the `source()` chain down to the innermost error.
pub fn root_cause<'a>(
    err: &'a (dyn std::error::Error + 'static),
) -> &'a (dyn std::error::Error + 'static) {
    let mut current = err;
    while let Some(next) = current.source() {
        current = next;
    }
    current
}
