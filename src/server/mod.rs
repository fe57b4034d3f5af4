//! Listener, worker pool and supervision.
//!
//! One listener socket is shared by a fixed number of workers. Each worker
//! owns its module pipeline and serves the connections it accepts one at a
//! time. The supervisor replaces any worker that exits or panics.

pub mod access_log;
pub mod listener;
pub mod supervisor;
pub mod worker;

pub use worker::{Worker, WorkerHandle};
