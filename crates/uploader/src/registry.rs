//! Transfer registry.
//!
//! The registry owns every active transfer and is the entry point a UI
//! layer drives: add files, then start, pause, resume, retry or cancel
//! them by id. Progress reaches the caller through the event receiver.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chunkferry_hasher::HashPool;
use chunkferry_transfer::{ResumeStore, Transfer};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::UploadConfig;
use crate::error::UploadError;
use crate::orchestrator::{Orchestrator, Stage, TransferHandle};
use crate::remote::RemoteService;
use crate::types::{TransferEvent, TransferSnapshot, detect_content_type};

struct Entry {
    seq: u64,
    handle: Arc<TransferHandle>,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Entries {
    next_seq: u64,
    map: HashMap<String, Entry>,
}

/// Set of active transfers keyed by id.
pub struct TransferRegistry {
    orchestrator: Arc<Orchestrator>,
    entries: Mutex<Entries>,
    events_rx: Option<mpsc::UnboundedReceiver<TransferEvent>>,
}

impl TransferRegistry {
    /// Creates a registry with its own hash worker pool.
    pub fn new(
        config: UploadConfig,
        remote: Arc<dyn RemoteService>,
        store: Arc<dyn ResumeStore>,
    ) -> Result<Self, UploadError> {
        let pool = Arc::new(HashPool::new(config.worker_count)?);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let orchestrator = Orchestrator::new(remote, pool, store, config, events_tx);

        Ok(Self {
            orchestrator: Arc::new(orchestrator),
            entries: Mutex::new(Entries::default()),
            events_rx: Some(events_rx),
        })
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransferEvent>> {
        self.events_rx.take()
    }

    /// Registers a file and partitions it into chunks.
    ///
    /// The MIME type is inferred from the extension. The transfer stays
    /// `Pending` until [`start`](Self::start).
    pub async fn add(&self, path: impl AsRef<Path>) -> Result<TransferSnapshot, UploadError> {
        let path = path.as_ref();
        let meta = tokio::fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(UploadError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            )));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let transfer = Transfer::new(
            uuid::Uuid::new_v4().to_string(),
            path.to_path_buf(),
            name,
            meta.len(),
            detect_content_type(path),
            self.orchestrator.config().chunk_size,
        );
        let snapshot = transfer.clone();

        let mut entries = self.entries.lock().unwrap();
        let seq = entries.next_seq;
        entries.next_seq += 1;
        entries.map.insert(
            snapshot.id.clone(),
            Entry {
                seq,
                handle: TransferHandle::new(transfer),
                task: None,
            },
        );

        info!(
            transfer = %snapshot.id,
            name = %snapshot.name,
            size = snapshot.total_size,
            chunks = snapshot.chunks.len(),
            "transfer added"
        );
        Ok(snapshot)
    }

    /// Registers several files, returning their snapshots in order.
    pub async fn add_many<P: AsRef<Path>>(
        &self,
        paths: impl IntoIterator<Item = P>,
    ) -> Result<Vec<TransferSnapshot>, UploadError> {
        let mut added = Vec::new();
        for path in paths {
            added.push(self.add(path).await?);
        }
        Ok(added)
    }

    /// Starts a pending transfer in the background.
    pub fn start(&self, id: &str) -> Result<(), UploadError> {
        let handle = self.handle(id)?;
        let stage = self.orchestrator.begin(&handle)?;
        self.spawn(id, handle, stage);
        Ok(())
    }

    /// Pauses an uploading transfer. In-flight chunks are aborted.
    pub fn pause(&self, id: &str) -> Result<(), UploadError> {
        let handle = self.handle(id)?;
        self.orchestrator.pause(&handle)
    }

    /// Resumes a paused or failed transfer without re-hashing or
    /// re-sending confirmed chunks.
    pub async fn resume(&self, id: &str) -> Result<(), UploadError> {
        self.reopen(id, "resume").await
    }

    /// Retries a failed or paused transfer. Same as [`resume`](Self::resume).
    pub async fn retry(&self, id: &str) -> Result<(), UploadError> {
        self.reopen(id, "retry").await
    }

    async fn reopen(&self, id: &str, operation: &'static str) -> Result<(), UploadError> {
        let handle = self.handle(id)?;
        if !handle.status().is_resumable() {
            let status = handle.status();
            return Err(UploadError::InvalidState {
                id: id.to_string(),
                status,
                operation,
            });
        }

        // Let the interrupted run finish requeueing its chunks first.
        let previous = {
            let mut entries = self.entries.lock().unwrap();
            entries.map.get_mut(id).and_then(|e| e.task.take())
        };
        if let Some(task) = previous {
            let _ = task.await;
        }

        let stage = self.orchestrator.reopen(&handle, operation)?;
        self.spawn(id, handle, stage);
        Ok(())
    }

    /// Cancels a transfer, drops its resume record and removes it.
    pub fn cancel(&self, id: &str) -> Result<(), UploadError> {
        let handle = self.handle(id)?;
        self.orchestrator.cancel(&handle)?;
        self.entries.lock().unwrap().map.remove(id);
        Ok(())
    }

    /// Returns a snapshot of one transfer.
    pub fn snapshot(&self, id: &str) -> Result<TransferSnapshot, UploadError> {
        Ok(self.handle(id)?.snapshot())
    }

    /// Returns snapshots of all transfers in the order they were added.
    pub fn list(&self) -> Vec<TransferSnapshot> {
        let entries = self.entries.lock().unwrap();
        let mut ordered: Vec<&Entry> = entries.map.values().collect();
        ordered.sort_by_key(|e| e.seq);
        ordered.iter().map(|e| e.handle.snapshot()).collect()
    }

    /// Number of registered transfers.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops the hash pool and abandons every transfer.
    ///
    /// In-flight work is aborted, not drained. Resume records are kept.
    pub fn destroy(&self) {
        self.orchestrator.pool().terminate();
        let drained: Vec<Entry> = {
            let mut entries = self.entries.lock().unwrap();
            entries.map.drain().map(|(_, e)| e).collect()
        };
        for entry in &drained {
            entry.handle.abort();
            if let Some(task) = &entry.task {
                task.abort();
            }
        }
        info!(transfers = drained.len(), "registry destroyed");
    }

    fn handle(&self, id: &str) -> Result<Arc<TransferHandle>, UploadError> {
        self.entries
            .lock()
            .unwrap()
            .map
            .get(id)
            .map(|e| Arc::clone(&e.handle))
            .ok_or_else(|| UploadError::NotFound(id.to_string()))
    }

    fn spawn(&self, id: &str, handle: Arc<TransferHandle>, stage: Stage) {
        debug!(transfer = %id, ?stage, "spawning transfer run");
        let task = tokio::spawn(Arc::clone(&self.orchestrator).run(handle, stage));
        if let Some(entry) = self.entries.lock().unwrap().map.get_mut(id) {
            entry.task = Some(task);
        }
    }
}

impl Drop for TransferRegistry {
    fn drop(&mut self) {
        self.destroy();
    }
}
