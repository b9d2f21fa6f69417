//! Worker system: executes queued tasks.
//!
//! Core components:
//! - `pool`: polling slots: claim → execute → complete / requeue / fail
//! - `backoff`: retry delay by attempt number
//! - `reclaimer`: returns tasks held by dead workers to the queue

pub mod backoff;
pub mod pool;
pub mod reclaimer;

pub use backoff::RetryPolicy;
pub use pool::{Processed, TaskOutcome, WorkerPool};
pub use reclaimer::{reclaim_stale, spawn_reclaimer};
