//! Upload error types.

use chunkferry_transfer::TransferStatus;

/// Errors produced while driving a transfer.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("hash failed: {0}")]
    Hash(#[from] chunkferry_hasher::HashError),

    #[error("existence check failed: {0}")]
    Check(String),

    #[error("upload init failed: {0}")]
    Init(String),

    #[error("chunk {index} failed: {message}")]
    ChunkTransfer { index: u32, message: String },

    #[error("merge failed: {0}")]
    Merge(String),

    #[error("cancelled")]
    Cancelled,

    #[error("transfer {0} not found")]
    NotFound(String),

    #[error("cannot {operation} transfer {id} while {status}")]
    InvalidState {
        id: String,
        status: TransferStatus,
        operation: &'static str,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] chunkferry_transfer::TransferError),
}

impl UploadError {
    /// Returns `true` for cooperative aborts, which are not failures.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Errors produced while loading or saving [`UploadConfig`](crate::UploadConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to encode config: {0}")]
    Encode(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("no config directory available")]
    NoConfigDir,
}
