//! Chunked transfer data model with resume support and progress tracking.
//!
//! A [`Transfer`] owns a fixed partition of its source file into
//! [`Chunk`]s. Progress is always recomputed from the current chunk
//! states, so concurrent chunk updates cannot lose increments.

mod chunked;
mod progress;
mod resume;
mod types;

pub use chunked::{partition, read_chunk};
pub use progress::{SpeedCalculator, aggregate_percent};
pub use resume::{FileResumeStore, MemoryResumeStore, ResumeRecord, ResumeStore};
pub use types::{Chunk, ChunkStatus, Transfer, TransferStatus};

/// Default chunk size: 5 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("chunk {index} out of range ({count} chunks)")]
    ChunkOutOfRange { index: u32, count: usize },

    #[error("remote issued {destinations} destinations for {chunks} chunks")]
    TooManyDestinations { destinations: usize, chunks: usize },

    #[error("source changed size: expected {expected} bytes, found {actual}")]
    SourceChanged { expected: u64, actual: u64 },
}
