//! Events and helper types for the upload flow.

use std::path::Path;

use chunkferry_protocol::OCTET_STREAM;
use chunkferry_transfer::Transfer;

/// Immutable view of a transfer handed to observers.
pub type TransferSnapshot = Transfer;

/// Notification emitted while transfers run.
///
/// Every variant carries a snapshot taken right after the change.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Upload progress changed.
    Progress(TransferSnapshot),
    /// Fingerprint progress changed.
    HashProgress(TransferSnapshot),
    /// The transfer moved to another status.
    StatusChanged(TransferSnapshot),
    /// The file is stored remotely, by dedup hit or merge.
    Succeeded {
        transfer: TransferSnapshot,
        url: String,
    },
    /// The transfer stopped with an error.
    Failed {
        transfer: TransferSnapshot,
        error: String,
    },
}

impl TransferEvent {
    /// Returns the snapshot carried by the event.
    pub fn transfer(&self) -> &TransferSnapshot {
        match self {
            Self::Progress(t) | Self::HashProgress(t) | Self::StatusChanged(t) => t,
            Self::Succeeded { transfer, .. } | Self::Failed { transfer, .. } => transfer,
        }
    }

    /// Returns `true` for success and failure notifications.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded { .. } | Self::Failed { .. })
    }
}

/// Detects a MIME type from the file extension, falling back to
/// `application/octet-stream`.
pub fn detect_content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase());

    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mov") => "video/quicktime",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("gz" | "tgz") => "application/gzip",
        Some("json") => "application/json",
        Some("txt" | "log") => "text/plain",
        Some("csv") => "text/csv",
        Some("html" | "htm") => "text/html",
        _ => OCTET_STREAM,
    }
}
