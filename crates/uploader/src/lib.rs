//! Resumable, content-addressed chunked uploads.
//!
//! This crate holds the client-side upload flow. It is a library with no
//! UI dependencies: a caller registers files with a [`TransferRegistry`],
//! drives them by id and renders the [`TransferEvent`]s it receives.
//!
//! # Pipeline
//!
//! 1. **Hash**: fingerprint the whole file on the hash worker pool
//! 2. **Check**: ask the remote whether the content is already stored
//! 3. **Init**: open a session and reconcile it with the resume record
//! 4. **Upload**: send the remaining chunks with bounded concurrency
//! 5. **Merge**: have the remote assemble the chunks

pub mod config;
pub mod error;
pub mod http;
mod orchestrator;
pub mod registry;
pub mod remote;
pub mod types;

// Re-export primary types for convenience.
pub use config::{UploadConfig, default_config_path};
pub use error::{ConfigError, UploadError};
pub use http::HttpRemote;
pub use registry::TransferRegistry;
pub use remote::{CheckOutcome, RemoteFuture, RemoteService, SendProgress};
pub use types::{TransferEvent, TransferSnapshot, detect_content_type};
