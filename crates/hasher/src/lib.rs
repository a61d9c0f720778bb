//! Content fingerprinting off the async executor.
//!
//! A [`HashPool`] owns a fixed set of worker threads. Each worker streams
//! one file at a time through an incremental MD5 accumulator and reports
//! progress back to the pool, which routes it to the task bound to that
//! worker.

mod message;
mod pool;
mod worker;

pub use message::{WorkerCommand, WorkerEvent, WorkerMessage};
pub use pool::{HashPool, HashTask, ProgressSink};
pub use worker::hash_file;

/// Size of each slice fed to the hash accumulator: 2 MiB.
pub const HASH_SLICE_SIZE: usize = 2 * 1024 * 1024;

/// Returns the default pool size: available parallelism, or 4.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Errors produced while fingerprinting.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("failed to read source: {0}")]
    Io(#[from] std::io::Error),

    #[error("hashing aborted")]
    Aborted,

    #[error("hash pool terminated")]
    PoolTerminated,

    #[error("hash worker {0} is gone")]
    WorkerGone(usize),
}
