//! Per-transfer state machine.
//!
//! A transfer moves through `Hashing`, `Checking`, `Uploading` and
//! `Merging`. Each run starts at a [`Stage`] picked by the caller: a fresh
//! start hashes first, a resumed transfer skips whatever it already has.
//!
//! All mutable transfer state sits behind one lock per transfer. Observers
//! only ever see clones taken under that lock.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use chunkferry_hasher::{HashError, HashPool, HashTask};
use chunkferry_protocol::InitUploadRequest;
use chunkferry_transfer::{
    ChunkStatus, ResumeRecord, ResumeStore, SpeedCalculator, Transfer, TransferStatus, read_chunk,
};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::UploadConfig;
use crate::error::UploadError;
use crate::remote::{CheckOutcome, RemoteService, SendProgress};
use crate::types::{TransferEvent, TransferSnapshot};

/// Where a run enters the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Hash,
    Check,
    Upload,
}

/// Shared state of one transfer.
pub(crate) struct TransferHandle {
    state: Mutex<Transfer>,
    cancel: Mutex<CancellationToken>,
    /// Serializes resume-record writes with cancellation.
    persist: Mutex<()>,
    speed: SpeedCalculator,
}

impl TransferHandle {
    pub(crate) fn new(transfer: Transfer) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(transfer),
            cancel: Mutex::new(CancellationToken::new()),
            persist: Mutex::new(()),
            speed: SpeedCalculator::default(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Transfer> {
        self.state.lock().unwrap()
    }

    pub(crate) fn snapshot(&self) -> TransferSnapshot {
        self.lock().clone()
    }

    pub(crate) fn status(&self) -> TransferStatus {
        self.lock().status
    }

    fn token(&self) -> CancellationToken {
        self.cancel.lock().unwrap().clone()
    }

    fn renew_token(&self) -> CancellationToken {
        let mut cancel = self.cancel.lock().unwrap();
        *cancel = CancellationToken::new();
        cancel.clone()
    }

    pub(crate) fn abort(&self) {
        self.cancel.lock().unwrap().cancel();
    }

    /// Refreshes throughput and ETA. Called with the state lock held.
    fn update_rate(&self, transfer: &mut Transfer) {
        self.speed.add_sample(transfer.uploaded_bytes());
        transfer.set_rate(self.speed.bytes_per_second());
    }
}

/// Drives transfers against the remote service.
pub(crate) struct Orchestrator {
    remote: Arc<dyn RemoteService>,
    pool: Arc<HashPool>,
    store: Arc<dyn ResumeStore>,
    config: UploadConfig,
    events: mpsc::UnboundedSender<TransferEvent>,
}

impl Orchestrator {
    pub(crate) fn new(
        remote: Arc<dyn RemoteService>,
        pool: Arc<HashPool>,
        store: Arc<dyn ResumeStore>,
        config: UploadConfig,
        events: mpsc::UnboundedSender<TransferEvent>,
    ) -> Self {
        Self {
            remote,
            pool,
            store,
            config,
            events,
        }
    }

    pub(crate) fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub(crate) fn pool(&self) -> &HashPool {
        &self.pool
    }

    fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }

    // -----------------------------------------------------------------------
    // Caller-driven transitions
    // -----------------------------------------------------------------------

    /// Moves a pending transfer into `Hashing` and arms a fresh token.
    pub(crate) fn begin(&self, handle: &TransferHandle) -> Result<Stage, UploadError> {
        let snapshot = {
            let mut t = handle.lock();
            if t.status != TransferStatus::Pending {
                return Err(UploadError::InvalidState {
                    id: t.id.clone(),
                    status: t.status,
                    operation: "start",
                });
            }
            t.status = TransferStatus::Hashing;
            t.clone()
        };
        handle.renew_token();

        info!(transfer = %snapshot.id, name = %snapshot.name, size = snapshot.total_size, "transfer started");
        self.emit(TransferEvent::StatusChanged(snapshot));
        Ok(Stage::Hash)
    }

    /// Reopens a paused or failed transfer at the first stage it lacks.
    ///
    /// Without a fingerprint the transfer is hashed again; without a
    /// session it is checked again; otherwise failed chunks get a fresh
    /// retry budget and the upload continues.
    pub(crate) fn reopen(
        &self,
        handle: &TransferHandle,
        operation: &'static str,
    ) -> Result<Stage, UploadError> {
        let (stage, snapshot) = {
            let mut t = handle.lock();
            if !t.status.is_resumable() {
                return Err(UploadError::InvalidState {
                    id: t.id.clone(),
                    status: t.status,
                    operation,
                });
            }

            let stage = if t.fingerprint.is_none() {
                t.hash_progress = 0;
                t.status = TransferStatus::Hashing;
                Stage::Hash
            } else if t.session_id.is_none() {
                t.status = TransferStatus::Checking;
                Stage::Check
            } else {
                let reset = t.reset_failed_chunks();
                if reset > 0 {
                    debug!(transfer = %t.id, chunks = reset, "failed chunks reset");
                }
                handle.speed.reset();
                handle.speed.add_sample(t.uploaded_bytes());
                t.status = TransferStatus::Uploading;
                Stage::Upload
            };
            t.last_error = None;
            (stage, t.clone())
        };
        handle.renew_token();

        info!(transfer = %snapshot.id, ?stage, operation, "transfer reopened");
        self.emit(TransferEvent::StatusChanged(snapshot));
        Ok(stage)
    }

    /// Pauses an uploading transfer and aborts its in-flight chunks.
    pub(crate) fn pause(&self, handle: &TransferHandle) -> Result<(), UploadError> {
        let snapshot = {
            let mut t = handle.lock();
            if t.status != TransferStatus::Uploading {
                return Err(UploadError::InvalidState {
                    id: t.id.clone(),
                    status: t.status,
                    operation: "pause",
                });
            }
            t.status = TransferStatus::Paused;
            t.eta_secs = None;
            t.clone()
        };
        handle.abort();

        info!(transfer = %snapshot.id, progress = snapshot.progress, "transfer paused");
        self.emit(TransferEvent::StatusChanged(snapshot));
        Ok(())
    }

    /// Cancels a transfer that has not succeeded and drops its resume
    /// record. A failed transfer can be cancelled instead of retried.
    pub(crate) fn cancel(&self, handle: &TransferHandle) -> Result<(), UploadError> {
        let snapshot = {
            let _persist = handle.persist.lock().unwrap();
            let snapshot = {
                let mut t = handle.lock();
                if matches!(t.status, TransferStatus::Success | TransferStatus::Cancelled) {
                    return Err(UploadError::InvalidState {
                        id: t.id.clone(),
                        status: t.status,
                        operation: "cancel",
                    });
                }
                t.status = TransferStatus::Cancelled;
                t.confirmed.clear();
                t.eta_secs = None;
                t.clone()
            };
            if let Some(fp) = &snapshot.fingerprint {
                self.store.clear(fp)?;
            }
            snapshot
        };
        handle.abort();

        info!(transfer = %snapshot.id, "transfer cancelled");
        self.emit(TransferEvent::StatusChanged(snapshot));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Pipeline
    // -----------------------------------------------------------------------

    /// Runs the pipeline from `stage` and reports the outcome.
    pub(crate) async fn run(self: Arc<Self>, handle: Arc<TransferHandle>, stage: Stage) {
        let cancel = handle.token();
        match self.drive(&handle, stage, &cancel).await {
            Ok(url) => self.succeed(&handle, url),
            Err(e) => self.fail(&handle, e),
        }
    }

    async fn drive(
        self: &Arc<Self>,
        handle: &Arc<TransferHandle>,
        stage: Stage,
        cancel: &CancellationToken,
    ) -> Result<String, UploadError> {
        if stage == Stage::Hash {
            self.hash(handle, cancel).await?;
        }
        if matches!(stage, Stage::Hash | Stage::Check) {
            if let Some(url) = self.check(handle, cancel).await? {
                return Ok(url);
            }
            self.open_session(handle, cancel).await?;
        }
        self.upload(handle, cancel).await?;
        self.merge(handle, cancel).await
    }

    /// Sets `status` and emits a change notification.
    ///
    /// Refuses to leave `Paused` or `Cancelled`; those are only left
    /// through [`reopen`](Self::reopen).
    fn transition(&self, handle: &TransferHandle, status: TransferStatus) -> Result<(), UploadError> {
        let snapshot = {
            let mut t = handle.lock();
            if t.status.is_interrupted() {
                return Err(UploadError::Cancelled);
            }
            if t.status == status {
                return Ok(());
            }
            t.status = status;
            t.clone()
        };
        info!(transfer = %snapshot.id, %status, "status changed");
        self.emit(TransferEvent::StatusChanged(snapshot));
        Ok(())
    }

    async fn hash(
        &self,
        handle: &Arc<TransferHandle>,
        cancel: &CancellationToken,
    ) -> Result<(), UploadError> {
        self.transition(handle, TransferStatus::Hashing)?;

        let (id, source) = {
            let t = handle.lock();
            (t.id.clone(), t.source.clone())
        };
        let sink = {
            let handle = Arc::clone(handle);
            let events = self.events.clone();
            move |progress: u8| {
                let snapshot = {
                    let mut t = handle.lock();
                    if t.status != TransferStatus::Hashing {
                        return;
                    }
                    t.hash_progress = progress;
                    t.clone()
                };
                let _ = events.send(TransferEvent::HashProgress(snapshot));
            }
        };

        let task = HashTask::new(id.clone(), source).on_progress(sink);
        let fingerprint = until_cancelled(cancel, async {
            self.pool.submit(task).await.map_err(UploadError::from)
        })
        .await?;

        info!(transfer = %id, %fingerprint, "fingerprint computed");
        let mut t = handle.lock();
        t.hash_progress = 100;
        t.fingerprint = Some(fingerprint);
        Ok(())
    }

    /// Returns the stored URL on a dedup hit.
    async fn check(
        &self,
        handle: &TransferHandle,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, UploadError> {
        self.transition(handle, TransferStatus::Checking)?;
        let fingerprint = self.fingerprint(handle)?;

        match until_cancelled(cancel, self.remote.check(&fingerprint)).await? {
            CheckOutcome::Hit { url } => {
                info!(%fingerprint, %url, "content already stored");
                Ok(Some(url))
            }
            CheckOutcome::Miss => {
                debug!(%fingerprint, "content not stored yet");
                Ok(None)
            }
        }
    }

    /// Opens the remote session and reconciles it with the resume record.
    async fn open_session(
        &self,
        handle: &TransferHandle,
        cancel: &CancellationToken,
    ) -> Result<(), UploadError> {
        self.transition(handle, TransferStatus::Uploading)?;
        if handle.lock().session_id.is_some() {
            return Ok(());
        }

        let fingerprint = self.fingerprint(handle)?;
        let request = {
            let t = handle.lock();
            InitUploadRequest {
                original_name: t.name.clone(),
                fingerprint: fingerprint.clone(),
                chunk_size: self.config.chunk_size,
                chunk_count: t.chunks.len() as u32,
                content_type: t.mime_type.clone(),
            }
        };
        let session = until_cancelled(cancel, self.remote.init(&request)).await?;
        let local = self.store.load(&fingerprint)?;

        let snapshot = {
            let mut t = handle.lock();
            if t.status.is_interrupted() {
                return Err(UploadError::Cancelled);
            }
            if let Some(record) = &local {
                t.confirmed.extend(record.confirmed.iter().copied());
            }
            let stored = t
                .apply_session(session.session_id, session.destinations)
                .map_err(|e| UploadError::Init(e.to_string()))?;

            if let Some(record) = &local {
                let remote_prefix: BTreeSet<u32> = (0..stored as u32).collect();
                if record.confirmed != remote_prefix {
                    warn!(
                        transfer = %t.id,
                        local = record.confirmed.len(),
                        remote = stored,
                        "resume record disagrees with remote session, using remote"
                    );
                }
            }
            info!(
                transfer = %t.id,
                session = ?t.session_id,
                stored,
                remaining = t.chunks.len() - stored,
                "upload session opened"
            );
            handle.speed.reset();
            handle.speed.add_sample(t.uploaded_bytes());
            t.clone()
        };

        self.persist(handle)?;
        self.emit(TransferEvent::Progress(snapshot));
        Ok(())
    }

    /// Sends every eligible chunk with at most `max_concurrent` in flight.
    ///
    /// A chunk that exhausts its retries stops further dispatch. Chunks
    /// already in flight run to completion before the stage fails.
    async fn upload(
        self: &Arc<Self>,
        handle: &Arc<TransferHandle>,
        cancel: &CancellationToken,
    ) -> Result<(), UploadError> {
        self.transition(handle, TransferStatus::Uploading)?;

        let eligible = handle.lock().eligible_chunks();
        debug!(chunks = eligible.len(), "dispatching chunks");

        let slots = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let halt = CancellationToken::new();
        let mut tasks = JoinSet::new();

        for index in eligible {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = halt.cancelled() => break,
                permit = Arc::clone(&slots).acquire_owned() => {
                    permit.map_err(|_| UploadError::Cancelled)?
                }
            };

            let this = Arc::clone(self);
            let handle = Arc::clone(handle);
            let cancel = cancel.clone();
            let halt = halt.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let result = this.send_chunk(&handle, index, &cancel).await;
                if matches!(&result, Err(e) if !e.is_cancelled()) {
                    halt.cancel();
                }
                result
            });
        }

        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                Err(UploadError::ChunkTransfer {
                    index: u32::MAX,
                    message: format!("chunk task failed: {e}"),
                })
            });
            if let Err(e) = result
                && !e.is_cancelled()
                && failure.is_none()
            {
                failure = Some(e);
            }
        }

        if cancel.is_cancelled() || handle.status().is_interrupted() {
            return Err(UploadError::Cancelled);
        }
        if let Some(e) = failure {
            return Err(e);
        }

        let t = handle.lock();
        match t.chunks.iter().find(|c| c.status != ChunkStatus::Success) {
            Some(chunk) => Err(UploadError::ChunkTransfer {
                index: chunk.index,
                message: format!("chunk left {:?}", chunk.status),
            }),
            None => Ok(()),
        }
    }

    /// Sends one chunk, retrying with linear backoff.
    async fn send_chunk(
        &self,
        handle: &Arc<TransferHandle>,
        index: u32,
        cancel: &CancellationToken,
    ) -> Result<(), UploadError> {
        loop {
            if cancel.is_cancelled() {
                return self.requeue(handle, index);
            }

            let (chunk, source) = {
                let mut t = handle.lock();
                t.set_chunk_status(index, ChunkStatus::Uploading)?;
                t.set_chunk_progress(index, 0)?;
                (t.chunk(index)?.clone(), t.source.clone())
            };
            let Some(destination) = chunk.destination.clone() else {
                handle.lock().set_chunk_status(index, ChunkStatus::Failed)?;
                return Err(UploadError::ChunkTransfer {
                    index,
                    message: "no destination issued".into(),
                });
            };

            debug!(chunk = index, attempt = chunk.retry_count + 1, "sending chunk");
            let attempt = async {
                let data = read_chunk(&source, &chunk).await?;
                let progress = self.chunk_progress(handle, index);
                self.remote
                    .put_chunk(&destination, data, progress, cancel.clone())
                    .await
            }
            .await;

            let error = match attempt {
                Ok(()) => return self.confirm(handle, index),
                Err(e) if e.is_cancelled() || cancel.is_cancelled() => {
                    return self.requeue(handle, index);
                }
                Err(e) => e,
            };

            let retries = handle.lock().bump_retry(index)?;
            if retries >= self.config.max_retries {
                let snapshot = {
                    let mut t = handle.lock();
                    t.set_chunk_status(index, ChunkStatus::Failed)?;
                    t.set_chunk_progress(index, 0)?;
                    t.clone()
                };
                error!(chunk = index, attempts = retries, error = %error, "chunk failed");
                self.emit(TransferEvent::Progress(snapshot));
                return Err(UploadError::ChunkTransfer {
                    index,
                    message: error.to_string(),
                });
            }

            let delay = self.config.retry_delay() * retries;
            warn!(chunk = index, attempt = retries, ?delay, error = %error, "chunk attempt failed, retrying");
            handle.lock().requeue_chunk(index)?;

            tokio::select! {
                _ = cancel.cancelled() => return self.requeue(handle, index),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Progress callback for one chunk's PUT.
    fn chunk_progress(&self, handle: &Arc<TransferHandle>, index: u32) -> SendProgress {
        let handle = Arc::clone(handle);
        let events = self.events.clone();
        Arc::new(move |sent: u64, total: u64| {
            let percent = if total == 0 { 100 } else { sent.min(total) * 100 / total };
            let snapshot = {
                let mut t = handle.lock();
                let sending = t.status == TransferStatus::Uploading
                    && matches!(t.chunk(index), Ok(c) if c.status == ChunkStatus::Uploading);
                if !sending || t.set_chunk_progress(index, percent as u8).is_err() {
                    return;
                }
                handle.update_rate(&mut t);
                t.clone()
            };
            let _ = events.send(TransferEvent::Progress(snapshot));
        })
    }

    fn confirm(&self, handle: &TransferHandle, index: u32) -> Result<(), UploadError> {
        let snapshot = {
            let mut t = handle.lock();
            t.confirm_chunk(index)?;
            handle.update_rate(&mut t);
            t.clone()
        };
        debug!(transfer = %snapshot.id, chunk = index, progress = snapshot.progress, "chunk confirmed");

        self.persist(handle)?;
        if snapshot.status == TransferStatus::Uploading {
            self.emit(TransferEvent::Progress(snapshot));
        }
        Ok(())
    }

    fn requeue(&self, handle: &TransferHandle, index: u32) -> Result<(), UploadError> {
        handle.lock().requeue_chunk(index)?;
        debug!(chunk = index, "chunk aborted");
        Err(UploadError::Cancelled)
    }

    /// Writes the current confirmed set to the resume store.
    ///
    /// The record is read under the persist lock, so the last write always
    /// holds every confirmation made so far.
    fn persist(&self, handle: &TransferHandle) -> Result<(), UploadError> {
        let _persist = handle.persist.lock().unwrap();
        let (fingerprint, record) = {
            let t = handle.lock();
            if t.status == TransferStatus::Cancelled {
                return Ok(());
            }
            let Some(fp) = t.fingerprint.clone() else {
                return Ok(());
            };
            let record = ResumeRecord {
                confirmed: t.confirmed.clone(),
                session_id: t.session_id.clone(),
            };
            (fp, record)
        };
        self.store.save(&fingerprint, &record)?;
        Ok(())
    }

    async fn merge(
        &self,
        handle: &TransferHandle,
        cancel: &CancellationToken,
    ) -> Result<String, UploadError> {
        self.transition(handle, TransferStatus::Merging)?;
        let fingerprint = self.fingerprint(handle)?;
        let url = until_cancelled(cancel, self.remote.merge(&fingerprint)).await?;
        info!(%fingerprint, %url, "merge complete");
        Ok(url)
    }

    fn fingerprint(&self, handle: &TransferHandle) -> Result<String, UploadError> {
        let t = handle.lock();
        t.fingerprint
            .clone()
            .ok_or_else(|| UploadError::InvalidState {
                id: t.id.clone(),
                status: t.status,
                operation: "upload",
            })
    }

    // -----------------------------------------------------------------------
    // Outcomes
    // -----------------------------------------------------------------------

    fn succeed(&self, handle: &TransferHandle, url: String) {
        let snapshot = {
            let mut t = handle.lock();
            if t.status.is_interrupted() || t.status.is_terminal() {
                return;
            }
            t.finish();
            t.clone()
        };
        if let Some(fp) = &snapshot.fingerprint
            && let Err(e) = self.store.clear(fp)
        {
            warn!(transfer = %snapshot.id, error = %e, "failed to clear resume record");
        }

        info!(transfer = %snapshot.id, %url, "transfer succeeded");
        self.emit(TransferEvent::StatusChanged(snapshot.clone()));
        self.emit(TransferEvent::Succeeded {
            transfer: snapshot,
            url,
        });
    }

    /// Moves the transfer to `Error` unless it was paused, cancelled or
    /// torn down.
    fn fail(&self, handle: &TransferHandle, err: UploadError) {
        let torn_down =
            matches!(err, UploadError::Hash(HashError::PoolTerminated)) && self.pool.is_terminated();
        if err.is_cancelled() || torn_down {
            debug!(status = %handle.status(), "transfer run interrupted");
            return;
        }

        let message = err.to_string();
        let snapshot = {
            let mut t = handle.lock();
            if t.status.is_interrupted() || t.status.is_terminal() {
                debug!(transfer = %t.id, error = %message, "ignoring error after interruption");
                return;
            }
            t.status = TransferStatus::Error;
            t.last_error = Some(message.clone());
            t.eta_secs = None;
            t.clone()
        };

        error!(transfer = %snapshot.id, error = %message, "transfer failed");
        self.emit(TransferEvent::StatusChanged(snapshot.clone()));
        self.emit(TransferEvent::Failed {
            transfer: snapshot,
            error: message,
        });
    }
}

/// Resolves to [`UploadError::Cancelled`] as soon as `cancel` fires.
async fn until_cancelled<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, UploadError>>,
) -> Result<T, UploadError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(UploadError::Cancelled),
        result = fut => result,
    }
}
