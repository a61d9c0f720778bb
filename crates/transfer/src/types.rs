use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::TransferError;
use crate::chunked::partition;
use crate::progress::aggregate_percent;

/// State of a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Uploading,
    Success,
    Failed,
}

/// Lifecycle of a transfer.
///
/// `Success`, `Error` and `Cancelled` are terminal. `Paused` and `Error`
/// can be left again through an explicit resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Hashing,
    Checking,
    Uploading,
    Paused,
    Merging,
    Success,
    Error,
    Cancelled,
}

impl TransferStatus {
    /// Returns `true` for `Success`, `Error` and `Cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }

    /// Returns `true` when the orchestration was stopped on purpose
    /// (pause or cancel) rather than by a failure.
    pub fn is_interrupted(self) -> bool {
        matches!(self, Self::Paused | Self::Cancelled)
    }

    /// Returns `true` if an explicit resume may restart the transfer.
    pub fn is_resumable(self) -> bool {
        matches!(self, Self::Paused | Self::Error)
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Hashing => "hashing",
            Self::Checking => "checking",
            Self::Uploading => "uploading",
            Self::Paused => "paused",
            Self::Merging => "merging",
            Self::Success => "success",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A contiguous byte range of the source file.
///
/// The range is fixed when the transfer is created; only the upload
/// bookkeeping fields change afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub index: u32,
    /// First byte (inclusive).
    pub start: u64,
    /// Last byte (exclusive).
    pub end: u64,
    pub size: u64,
    pub status: ChunkStatus,
    pub retry_count: u32,
    /// Upload progress, 0-100.
    pub progress: u8,
    /// Pre-authorized destination issued by the remote session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

impl Chunk {
    pub(crate) fn new(index: u32, start: u64, end: u64) -> Self {
        Self {
            index,
            start,
            end,
            size: end - start,
            status: ChunkStatus::Pending,
            retry_count: 0,
            progress: 0,
            destination: None,
        }
    }

    fn mark_confirmed(&mut self) {
        self.status = ChunkStatus::Success;
        self.progress = 100;
    }
}

/// One file being sent to the remote store.
///
/// Snapshots handed to observers are plain clones of this record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    pub id: String,
    pub source: PathBuf,
    pub name: String,
    pub total_size: u64,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    pub status: TransferStatus,
    /// Aggregate upload progress, 0-100.
    pub progress: u8,
    /// Fingerprint computation progress, 0-100.
    pub hash_progress: u8,
    pub chunks: Vec<Chunk>,
    pub confirmed: BTreeSet<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    /// Bytes per second.
    pub throughput: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<f64>,
}

impl Transfer {
    /// Creates a pending transfer and partitions it into chunks.
    pub fn new(
        id: impl Into<String>,
        source: PathBuf,
        name: impl Into<String>,
        total_size: u64,
        mime_type: impl Into<String>,
        chunk_size: u64,
    ) -> Self {
        Self {
            id: id.into(),
            source,
            name: name.into(),
            total_size,
            mime_type: mime_type.into(),
            fingerprint: None,
            status: TransferStatus::Pending,
            progress: 0,
            hash_progress: 0,
            chunks: partition(total_size, chunk_size),
            confirmed: BTreeSet::new(),
            session_id: None,
            last_error: None,
            started_at: Utc::now(),
            throughput: 0.0,
            eta_secs: None,
        }
    }

    /// Returns the chunk at `index`.
    pub fn chunk(&self, index: u32) -> Result<&Chunk, TransferError> {
        let count = self.chunks.len();
        self.chunks
            .get(index as usize)
            .ok_or(TransferError::ChunkOutOfRange { index, count })
    }

    fn chunk_mut(&mut self, index: u32) -> Result<&mut Chunk, TransferError> {
        let count = self.chunks.len();
        self.chunks
            .get_mut(index as usize)
            .ok_or(TransferError::ChunkOutOfRange { index, count })
    }

    /// Updates the in-flight progress of one chunk and recomputes the
    /// aggregate.
    pub fn set_chunk_progress(&mut self, index: u32, percent: u8) -> Result<(), TransferError> {
        let chunk = self.chunk_mut(index)?;
        chunk.progress = percent.min(100);
        self.recompute_progress();
        Ok(())
    }

    /// Sets the status of one chunk.
    pub fn set_chunk_status(&mut self, index: u32, status: ChunkStatus) -> Result<(), TransferError> {
        self.chunk_mut(index)?.status = status;
        Ok(())
    }

    /// Increments and returns the retry counter of one chunk.
    pub fn bump_retry(&mut self, index: u32) -> Result<u32, TransferError> {
        let chunk = self.chunk_mut(index)?;
        chunk.retry_count += 1;
        Ok(chunk.retry_count)
    }

    /// Returns a chunk to `Pending` after an aborted attempt.
    pub fn requeue_chunk(&mut self, index: u32) -> Result<(), TransferError> {
        let chunk = self.chunk_mut(index)?;
        chunk.status = ChunkStatus::Pending;
        chunk.progress = 0;
        self.recompute_progress();
        Ok(())
    }

    /// Marks a chunk as stored remotely.
    pub fn confirm_chunk(&mut self, index: u32) -> Result<(), TransferError> {
        self.chunk_mut(index)?.mark_confirmed();
        self.confirmed.insert(index);
        self.recompute_progress();
        Ok(())
    }

    /// Recomputes the aggregate progress from the current chunk states.
    pub fn recompute_progress(&mut self) {
        self.progress = aggregate_percent(&self.chunks, self.total_size);
    }

    /// Bytes accounted for by chunk progress.
    pub fn uploaded_bytes(&self) -> u64 {
        self.chunks
            .iter()
            .map(|c| c.size * u64::from(c.progress) / 100)
            .sum()
    }

    /// Indices of chunks that still have to be sent, in index order.
    pub fn eligible_chunks(&self) -> Vec<u32> {
        self.chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Pending && !self.confirmed.contains(&c.index))
            .map(|c| c.index)
            .collect()
    }

    /// Applies the remote session answer.
    ///
    /// `destinations` covers the trailing chunks; every chunk before them
    /// is stored remotely already. Local confirmations for chunks that
    /// receive a destination are dropped, since the remote still wants
    /// them. Returns the number of chunks the remote reported as stored.
    pub fn apply_session(
        &mut self,
        session_id: impl Into<String>,
        destinations: Vec<String>,
    ) -> Result<usize, TransferError> {
        let count = self.chunks.len();
        if destinations.len() > count {
            return Err(TransferError::TooManyDestinations {
                destinations: destinations.len(),
                chunks: count,
            });
        }
        let stored = count - destinations.len();

        for chunk in &mut self.chunks[..stored] {
            chunk.mark_confirmed();
            chunk.destination = None;
            self.confirmed.insert(chunk.index);
        }
        for (chunk, destination) in self.chunks[stored..].iter_mut().zip(destinations) {
            self.confirmed.remove(&chunk.index);
            chunk.status = ChunkStatus::Pending;
            chunk.progress = 0;
            chunk.destination = Some(destination);
        }

        self.session_id = Some(session_id.into());
        self.recompute_progress();
        Ok(stored)
    }

    /// Returns every `Failed` chunk to `Pending` with a fresh retry budget.
    pub fn reset_failed_chunks(&mut self) -> usize {
        let mut reset = 0;
        for chunk in &mut self.chunks {
            if chunk.status == ChunkStatus::Failed {
                chunk.status = ChunkStatus::Pending;
                chunk.retry_count = 0;
                chunk.progress = 0;
                reset += 1;
            }
        }
        self.recompute_progress();
        reset
    }

    /// Refreshes throughput and ETA.
    pub fn set_rate(&mut self, bytes_per_sec: f64) {
        self.throughput = bytes_per_sec;
        let remaining = self.total_size.saturating_sub(self.uploaded_bytes());
        self.eta_secs = (bytes_per_sec > 0.0).then(|| remaining as f64 / bytes_per_sec);
    }

    /// Final bookkeeping for a stored file.
    pub fn finish(&mut self) {
        self.status = TransferStatus::Success;
        self.progress = 100;
        self.eta_secs = Some(0.0);
        self.confirmed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn sample(total: u64, chunk: u64) -> Transfer {
        Transfer::new(
            "t1",
            PathBuf::from("/tmp/movie.mkv"),
            "movie.mkv",
            total,
            "video/x-matroska",
            chunk,
        )
    }

    #[test]
    fn new_transfer_is_pending() {
        let t = sample(12 * MIB, 5 * MIB);
        assert_eq!(t.status, TransferStatus::Pending);
        assert_eq!(t.chunks.len(), 3);
        assert_eq!(t.progress, 0);
        assert!(t.confirmed.is_empty());
        assert_eq!(t.eligible_chunks(), vec![0, 1, 2]);
    }

    #[test]
    fn aggregate_progress_weights_by_size() {
        let mut t = sample(12 * MIB, 5 * MIB);
        t.set_chunk_progress(0, 100).unwrap();
        // 5 of 12 MiB.
        assert_eq!(t.progress, 42);
        t.set_chunk_progress(2, 50).unwrap();
        // 5 + 1 of 12 MiB.
        assert_eq!(t.progress, 50);
    }

    #[test]
    fn progress_recompute_is_idempotent() {
        let mut t = sample(12 * MIB, 5 * MIB);
        t.set_chunk_progress(1, 40).unwrap();
        let first = t.progress;
        t.recompute_progress();
        t.recompute_progress();
        assert_eq!(t.progress, first);
    }

    #[test]
    fn confirm_chunk_tracks_index() {
        let mut t = sample(12 * MIB, 5 * MIB);
        t.confirm_chunk(1).unwrap();
        assert!(t.confirmed.contains(&1));
        assert_eq!(t.chunks[1].status, ChunkStatus::Success);
        assert_eq!(t.eligible_chunks(), vec![0, 2]);
    }

    #[test]
    fn chunk_out_of_range() {
        let mut t = sample(12 * MIB, 5 * MIB);
        assert!(matches!(
            t.confirm_chunk(3),
            Err(TransferError::ChunkOutOfRange { index: 3, count: 3 })
        ));
    }

    #[test]
    fn apply_session_marks_remote_prefix() {
        let mut t = sample(12 * MIB, 5 * MIB);
        let stored = t.apply_session("s1", vec!["http://d/2".into()]).unwrap();
        assert_eq!(stored, 2);
        assert_eq!(t.session_id.as_deref(), Some("s1"));
        assert_eq!(t.chunks[0].status, ChunkStatus::Success);
        assert_eq!(t.chunks[1].status, ChunkStatus::Success);
        assert_eq!(t.chunks[2].destination.as_deref(), Some("http://d/2"));
        assert_eq!(t.eligible_chunks(), vec![2]);
        assert_eq!(t.confirmed.iter().copied().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn apply_session_remote_overrides_local_confirmation() {
        let mut t = sample(12 * MIB, 5 * MIB);
        t.confirm_chunk(2).unwrap();
        t.apply_session("s1", vec!["a".into(), "b".into(), "c".into()])
            .unwrap();
        assert!(t.confirmed.is_empty());
        assert_eq!(t.eligible_chunks(), vec![0, 1, 2]);
        assert_eq!(t.progress, 0);
    }

    #[test]
    fn apply_session_rejects_extra_destinations() {
        let mut t = sample(12 * MIB, 5 * MIB);
        let dests = vec!["a".into(), "b".into(), "c".into(), "d".into()];
        assert!(matches!(
            t.apply_session("s1", dests),
            Err(TransferError::TooManyDestinations {
                destinations: 4,
                chunks: 3
            })
        ));
        assert!(t.session_id.is_none());
    }

    #[test]
    fn reset_failed_chunks_clears_retries() {
        let mut t = sample(12 * MIB, 5 * MIB);
        t.set_chunk_status(1, ChunkStatus::Failed).unwrap();
        t.bump_retry(1).unwrap();
        t.bump_retry(1).unwrap();
        t.bump_retry(1).unwrap();
        assert!(t.eligible_chunks().iter().all(|&i| i != 1));

        assert_eq!(t.reset_failed_chunks(), 1);
        assert_eq!(t.chunks[1].status, ChunkStatus::Pending);
        assert_eq!(t.chunks[1].retry_count, 0);
        assert_eq!(t.eligible_chunks(), vec![0, 1, 2]);
    }

    #[test]
    fn finish_clears_confirmed() {
        let mut t = sample(12 * MIB, 5 * MIB);
        t.confirm_chunk(0).unwrap();
        t.finish();
        assert_eq!(t.status, TransferStatus::Success);
        assert_eq!(t.progress, 100);
        assert!(t.confirmed.is_empty());
    }

    #[test]
    fn eta_from_rate() {
        let mut t = sample(10 * MIB, 5 * MIB);
        t.confirm_chunk(0).unwrap();
        t.set_rate(MIB as f64);
        assert_eq!(t.eta_secs, Some(5.0));
        t.set_rate(0.0);
        assert!(t.eta_secs.is_none());
    }

    #[test]
    fn status_classification() {
        assert!(TransferStatus::Success.is_terminal());
        assert!(TransferStatus::Cancelled.is_terminal());
        assert!(!TransferStatus::Paused.is_terminal());
        assert!(TransferStatus::Paused.is_interrupted());
        assert!(!TransferStatus::Error.is_interrupted());
        assert!(TransferStatus::Error.is_resumable());
        assert!(!TransferStatus::Uploading.is_resumable());
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let t = sample(12 * MIB, 5 * MIB);
        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["totalSize"], 12 * MIB);
        assert_eq!(json["chunks"][2]["size"], 2 * MIB);
        assert!(json.get("fingerprint").is_none());
        assert!(json.get("started").is_none());
    }
}
