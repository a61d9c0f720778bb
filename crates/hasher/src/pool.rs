use std::collections::{BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;

use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::HashError;
use crate::message::{WorkerCommand, WorkerEvent, WorkerMessage};
use crate::worker;

/// Callback receiving hash progress (0-100).
pub type ProgressSink = Arc<dyn Fn(u8) + Send + Sync>;

/// Work item submitted to the pool.
pub struct HashTask {
    pub transfer_id: String,
    pub source: PathBuf,
    pub progress: Option<ProgressSink>,
}

impl HashTask {
    /// Creates a task without a progress sink.
    pub fn new(transfer_id: impl Into<String>, source: PathBuf) -> Self {
        Self {
            transfer_id: transfer_id.into(),
            source,
            progress: None,
        }
    }

    /// Attaches a progress sink.
    pub fn on_progress(mut self, sink: impl Fn(u8) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(sink));
        self
    }
}

type Completion = oneshot::Sender<Result<String, HashError>>;

struct Pending {
    task: HashTask,
    done: Completion,
}

struct PoolState {
    workers: Vec<mpsc::Sender<WorkerCommand>>,
    idle: BTreeSet<usize>,
    queue: VecDeque<Pending>,
    bound: HashMap<usize, Pending>,
    terminated: bool,
}

impl PoolState {
    /// Binds queued tasks to idle workers, lowest worker id first.
    fn dispatch(&mut self) {
        while !self.queue.is_empty() {
            let Some(worker) = self.idle.pop_first() else {
                return;
            };
            let Some(pending) = self.queue.pop_front() else {
                self.idle.insert(worker);
                return;
            };

            let command = WorkerCommand::Calculate {
                task_id: pending.task.transfer_id.clone(),
                source: pending.task.source.clone(),
            };
            if self.workers[worker].send(command).is_err() {
                warn!(worker, "hash worker channel closed");
                let _ = pending.done.send(Err(HashError::WorkerGone(worker)));
                continue;
            }

            debug!(worker, task = %pending.task.transfer_id, "hash task dispatched");
            let previous = self.bound.insert(worker, pending);
            debug_assert!(previous.is_none(), "worker {worker} bound twice");
        }
    }

    /// Frees `worker` and hands it the queue head, if any.
    fn release(&mut self, worker: usize) -> Option<Pending> {
        let pending = self.bound.remove(&worker);
        self.idle.insert(worker);
        self.dispatch();
        pending
    }
}

/// Fixed-size pool of hash workers with a FIFO task queue.
///
/// Tasks beyond the pool size wait in submission order. A worker is
/// bound to at most one task, and only messages from the bound task are
/// forwarded. There is no per-task cancellation; [`terminate`](Self::terminate)
/// stops everything at once.
pub struct HashPool {
    state: Arc<Mutex<PoolState>>,
    stop: Arc<AtomicBool>,
}

impl HashPool {
    /// Starts `size` worker threads (at least one) and the routing thread.
    pub fn new(size: usize) -> Result<Self, HashError> {
        let size = size.max(1);
        let stop = Arc::new(AtomicBool::new(false));
        let (events_tx, events_rx) = mpsc::channel();

        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            let (cmd_tx, cmd_rx) = mpsc::channel();
            worker::spawn(id, cmd_rx, events_tx.clone(), Arc::clone(&stop))?;
            workers.push(cmd_tx);
        }
        // Workers hold the only event senders, so the router exits with them.
        drop(events_tx);

        let state = Arc::new(Mutex::new(PoolState {
            workers,
            idle: (0..size).collect(),
            queue: VecDeque::new(),
            bound: HashMap::new(),
            terminated: false,
        }));

        let router_state = Arc::clone(&state);
        thread::Builder::new()
            .name("hash-pool-router".into())
            .spawn(move || route_events(router_state, events_rx))?;

        info!(workers = size, "hash pool started");
        Ok(Self { state, stop })
    }

    /// Submits a task and returns a future resolving to its fingerprint.
    ///
    /// The task runs immediately if a worker is idle, otherwise it is
    /// queued. If the pool is torn down first, the future resolves to
    /// [`HashError::PoolTerminated`].
    pub fn submit(
        &self,
        task: HashTask,
    ) -> impl Future<Output = Result<String, HashError>> + Send + 'static {
        let (done, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().unwrap();
            if state.terminated {
                let _ = done.send(Err(HashError::PoolTerminated));
            } else {
                trace!(task = %task.transfer_id, queued = state.queue.len(), "hash task submitted");
                state.queue.push_back(Pending { task, done });
                state.dispatch();
            }
        }
        async move { rx.await.unwrap_or(Err(HashError::PoolTerminated)) }
    }

    /// Number of workers currently bound to a task.
    pub fn active_workers(&self) -> usize {
        self.state.lock().unwrap().bound.len()
    }

    /// Returns `true` once the pool has been torn down.
    pub fn is_terminated(&self) -> bool {
        self.state.lock().unwrap().terminated
    }

    /// Stops all workers and discards queued and in-flight tasks.
    ///
    /// Their futures resolve to [`HashError::PoolTerminated`].
    pub fn terminate(&self) {
        self.stop.store(true, Ordering::Relaxed);
        let (queued, bound) = {
            let mut state = self.state.lock().unwrap();
            if state.terminated {
                return;
            }
            state.terminated = true;
            state.workers.clear();
            state.idle.clear();
            let queued: Vec<Pending> = state.queue.drain(..).collect();
            let bound: Vec<Pending> = state.bound.drain().map(|(_, p)| p).collect();
            (queued, bound)
        };
        info!(
            queued = queued.len(),
            in_flight = bound.len(),
            "hash pool terminated"
        );
        // Dropping the completions resolves the callers' futures.
        drop(queued);
        drop(bound);
    }
}

impl Drop for HashPool {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Forwards worker messages to the task bound to the sending worker.
fn route_events(state: Arc<Mutex<PoolState>>, events: mpsc::Receiver<WorkerEvent>) {
    while let Ok(WorkerEvent { worker, message }) = events.recv() {
        let mut guard = state.lock().unwrap();
        let bound_here = guard
            .bound
            .get(&worker)
            .is_some_and(|p| p.task.transfer_id == message.task_id());
        if !bound_here {
            trace!(worker, task = %message.task_id(), "dropping message for unbound task");
            continue;
        }

        if !message.is_final() {
            let sink = match &message {
                WorkerMessage::Progress { progress, .. } => guard
                    .bound
                    .get(&worker)
                    .and_then(|p| p.task.progress.clone())
                    .map(|sink| (sink, *progress)),
                _ => None,
            };
            drop(guard);
            // Call out without holding the pool lock.
            if let Some((sink, progress)) = sink {
                sink(progress);
            }
            continue;
        }

        let released = guard.release(worker);
        drop(guard);

        let Some(pending) = released else {
            continue;
        };
        let result = match message {
            WorkerMessage::Complete { fingerprint, .. } => {
                debug!(worker, task = %pending.task.transfer_id, %fingerprint, "hash complete");
                Ok(fingerprint)
            }
            WorkerMessage::Error { error, .. } => {
                warn!(worker, task = %pending.task.transfer_id, %error, "hash failed");
                Err(error)
            }
            _ => unreachable!("non-final message handled above"),
        };
        let _ = pending.done.send(result);
    }
    debug!("hash pool router exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn write_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    #[tokio::test]
    async fn single_task_completes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "hello.txt", b"hello");
        let pool = HashPool::new(2).unwrap();

        let fp = pool.submit(HashTask::new("t1", path)).await.unwrap();
        assert_eq!(fp, "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(pool.active_workers(), 0);
    }

    #[tokio::test]
    async fn progress_is_routed_to_task() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![7u8; crate::HASH_SLICE_SIZE * 2];
        let path = write_file(dir.path(), "big.bin", &data);
        let pool = HashPool::new(1).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let task = HashTask::new("t1", path).on_progress(move |p| s.lock().unwrap().push(p));
        pool.submit(task).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![50, 100]);
    }

    #[tokio::test]
    async fn more_tasks_than_workers_all_complete() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(HashPool::new(2).unwrap());
        let max_active = Arc::new(AtomicUsize::new(0));

        let mut futures = Vec::new();
        for i in 0..6 {
            let content = format!("file number {i}").repeat(50_000);
            let path = write_file(dir.path(), &format!("f{i}.bin"), content.as_bytes());
            let p = Arc::clone(&pool);
            let m = Arc::clone(&max_active);
            let task = HashTask::new(format!("t{i}"), path).on_progress(move |_| {
                m.fetch_max(p.active_workers(), Ordering::SeqCst);
            });
            futures.push((content, pool.submit(task)));
        }

        for (content, fut) in futures {
            let fp = fut.await.unwrap();
            assert_eq!(fp, hex::encode(<md5::Md5 as md5::Digest>::digest(content.as_bytes())));
        }

        assert!(max_active.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.active_workers(), 0);
        assert!(pool.state.lock().unwrap().queue.is_empty());
    }

    #[tokio::test]
    async fn queued_tasks_dispatch_in_submission_order() {
        let dir = tempfile::tempdir().unwrap();
        let pool = HashPool::new(1).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut futures = Vec::new();
        for name in ["a", "b", "c"] {
            let path = write_file(dir.path(), &format!("{name}.bin"), name.repeat(64).as_bytes());
            let o = Arc::clone(&order);
            let task = HashTask::new(name, path).on_progress(move |_| {
                let mut seen = o.lock().unwrap();
                if seen.last() != Some(&name) {
                    seen.push(name);
                }
            });
            futures.push(pool.submit(task));
        }
        for fut in futures {
            fut.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn read_error_rejects_and_frees_worker() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_file(dir.path(), "ok.txt", b"hello");
        let pool = HashPool::new(1).unwrap();

        let bad = pool.submit(HashTask::new("bad", PathBuf::from("/nonexistent/x.bin")));
        let ok = pool.submit(HashTask::new("ok", good));

        assert!(matches!(bad.await, Err(HashError::Io(_))));
        assert_eq!(ok.await.unwrap(), "5d41402abc4b2a76b9719d911017c592");
    }

    #[tokio::test]
    async fn terminate_resolves_pending_futures() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![1u8; crate::HASH_SLICE_SIZE * 8];
        let pool = HashPool::new(1).unwrap();

        let mut futures = Vec::new();
        for i in 0..3 {
            let path = write_file(dir.path(), &format!("f{i}.bin"), &data);
            futures.push(pool.submit(HashTask::new(format!("t{i}"), path)));
        }
        pool.terminate();
        assert!(pool.is_terminated());

        for fut in futures {
            let result = tokio::time::timeout(Duration::from_secs(5), fut)
                .await
                .expect("future should resolve after terminate");
            // The first task may have finished before terminate ran.
            if let Err(e) = result {
                assert!(matches!(e, HashError::PoolTerminated));
            }
        }
    }

    #[tokio::test]
    async fn submit_after_terminate_fails_fast() {
        let pool = HashPool::new(1).unwrap();
        pool.terminate();
        let result = pool
            .submit(HashTask::new("late", PathBuf::from("/tmp/whatever")))
            .await;
        assert!(matches!(result, Err(HashError::PoolTerminated)));
    }

    #[test]
    fn zero_size_pool_has_one_worker() {
        let pool = HashPool::new(0).unwrap();
        assert_eq!(pool.state.lock().unwrap().workers.len(), 1);
    }
}
