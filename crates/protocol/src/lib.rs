//! Wire types for the remote upload service.
//!
//! The service speaks JSON over HTTP. Every response is wrapped in an
//! [`ApiResponse`] whose `code` field carries the outcome; see
//! [`constants`] for the distinguished values.

pub mod constants;
pub mod envelope;
pub mod messages;

// Re-export primary types for convenience.
pub use constants::{CODE_HIT, CODE_INIT_FAILED, OCTET_STREAM};
pub use envelope::ApiResponse;
pub use messages::{CheckData, InitUploadData, InitUploadRequest, MergeData};
