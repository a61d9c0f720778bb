//! Remote service trait.
//!
//! [`RemoteService`] is the seam between the orchestrator and the HTTP
//! transport. Keeping it a trait lets the transfer flow run against a
//! scripted double in tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chunkferry_protocol::{InitUploadData, InitUploadRequest};
use tokio_util::sync::CancellationToken;

use crate::error::UploadError;

/// Boxed future returned by [`RemoteService`] methods.
pub type RemoteFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, UploadError>> + Send + 'a>>;

/// Receives `(bytes_sent, bytes_total)` while a chunk is being sent.
pub type SendProgress = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Result of an existence check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Content is already stored; `url` points at it.
    Hit { url: String },
    /// Content has to be uploaded.
    Miss,
}

/// Remote upload service.
pub trait RemoteService: Send + Sync {
    /// Asks whether content with `fingerprint` is already stored.
    fn check(&self, fingerprint: &str) -> RemoteFuture<'_, CheckOutcome>;

    /// Opens an upload session and returns the destinations still needed.
    fn init(&self, request: &InitUploadRequest) -> RemoteFuture<'_, InitUploadData>;

    /// Sends one chunk to a pre-authorized destination.
    ///
    /// Resolves to [`UploadError::Cancelled`] once `cancel` fires.
    fn put_chunk(
        &self,
        destination: &str,
        data: Vec<u8>,
        progress: SendProgress,
        cancel: CancellationToken,
    ) -> RemoteFuture<'_, ()>;

    /// Asks the remote to assemble the stored chunks. Returns the final URL.
    fn merge(&self, fingerprint: &str) -> RemoteFuture<'_, String>;
}
