//! # dispatch-rs
//!
//! Concurrent, self-feeding work dispatcher.
//!
//! A bounded pool of worker threads drains a shared queue in batches. The
//! processing function may enqueue more items while it runs, which makes the
//! dispatcher suitable for recursive workloads such as tree or graph
//! traversal: completion is detected only once the queue is empty and no
//! worker is still mid-batch.
//!
//! ```no_run
//! use dispatch_rs::dispatcher::Dispatcher;
//!
//! let dispatcher = Dispatcher::<u32>::new(
//!     |d, _worker, value, _state| {
//!         if *value < 1000 {
//!             d.push(value + 1);
//!         }
//!         Ok(())
//!     },
//!     10,
//! )?;
//! dispatcher.push(1);
//! dispatcher.start(4)?;
//! let summary = dispatcher.wait_for_completion();
//! assert!(dispatcher.is_succeeded());
//! assert_eq!(summary.map(|s| s.processed), Some(1000));
//! # Ok::<(), dispatch_rs::error::Error>(())
//! ```

pub mod config;
pub mod counter;
pub mod dispatcher;
pub mod error;
pub mod telemetry;

pub use dispatcher::{Dispatcher, LifecycleEvent, Status, WorkerState};
pub use error::{Error, Result};
