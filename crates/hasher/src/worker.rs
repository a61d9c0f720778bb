use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use md5::{Digest, Md5};
use tracing::{debug, trace};

use crate::message::{WorkerCommand, WorkerEvent, WorkerMessage};
use crate::{HASH_SLICE_SIZE, HashError};

/// Computes the hex MD5 fingerprint of the file at `path`.
///
/// The file is read sequentially in [`HASH_SLICE_SIZE`] slices. After each
/// slice `on_progress` receives `round(slices_done / total_slices * 100)`.
/// `stop` is checked between slices; once set, hashing ends with
/// [`HashError::Aborted`]. No partial fingerprint is ever returned.
pub fn hash_file(
    path: &Path,
    stop: &AtomicBool,
    mut on_progress: impl FnMut(u8),
) -> Result<String, HashError> {
    let mut file = std::fs::File::open(path)?;
    let size = file.metadata()?.len();
    let slice = HASH_SLICE_SIZE as u64;
    let total_slices = size.div_ceil(slice);

    let mut hasher = Md5::new();
    let mut buf = vec![0u8; HASH_SLICE_SIZE];
    let mut done: u64 = 0;

    while done < total_slices {
        if stop.load(Ordering::Relaxed) {
            return Err(HashError::Aborted);
        }

        let want = (size - done * slice).min(slice) as usize;
        file.read_exact(&mut buf[..want])?;
        hasher.update(&buf[..want]);
        done += 1;

        let progress = (done * 200 + total_slices) / (total_slices * 2);
        on_progress(progress.min(100) as u8);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Starts a worker thread.
///
/// The worker handles one command at a time and exits when its command
/// channel closes or `stop` is raised.
pub(crate) fn spawn(
    id: usize,
    commands: mpsc::Receiver<WorkerCommand>,
    events: mpsc::Sender<WorkerEvent>,
    stop: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("hash-worker-{id}"))
        .spawn(move || {
            let emit = |message: WorkerMessage| {
                let _ = events.send(WorkerEvent {
                    worker: id,
                    message,
                });
            };

            while let Ok(command) = commands.recv() {
                let WorkerCommand::Calculate { task_id, source } = command;
                trace!(worker = id, task = %task_id, "hash task received");
                emit(WorkerMessage::Start {
                    task_id: task_id.clone(),
                });

                let result = hash_file(&source, &stop, |progress| {
                    emit(WorkerMessage::Progress {
                        task_id: task_id.clone(),
                        progress,
                    });
                });

                if stop.load(Ordering::Relaxed) {
                    break;
                }

                emit(match result {
                    Ok(fingerprint) => WorkerMessage::Complete {
                        task_id,
                        fingerprint,
                    },
                    Err(error) => WorkerMessage::Error { task_id, error },
                });
            }
            debug!(worker = id, "hash worker exiting");
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "hello.txt", b"hello");
        let stop = AtomicBool::new(false);
        let fp = hash_file(&path, &stop, |_| {}).unwrap();
        assert_eq!(fp, "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn empty_file_digest_without_progress() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "empty.bin", b"");
        let stop = AtomicBool::new(false);
        let mut events = Vec::new();
        let fp = hash_file(&path, &stop, |p| events.push(p)).unwrap();
        assert_eq!(fp, "d41d8cd98f00b204e9800998ecf8427e");
        assert!(events.is_empty());
    }

    #[test]
    fn multi_slice_matches_whole_file_digest() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..HASH_SLICE_SIZE * 2 + 17).map(|i| (i % 251) as u8).collect();
        let path = write_file(dir.path(), "big.bin", &data);
        let stop = AtomicBool::new(false);

        let mut events = Vec::new();
        let fp = hash_file(&path, &stop, |p| events.push(p)).unwrap();

        assert_eq!(fp, hex::encode(Md5::digest(&data)));
        assert_eq!(events, vec![33, 67, 100]);
    }

    #[test]
    fn missing_file_is_io_error() {
        let stop = AtomicBool::new(false);
        let err = hash_file(Path::new("/nonexistent/chunkferry.bin"), &stop, |_| {}).unwrap_err();
        assert!(matches!(err, HashError::Io(_)));
    }

    #[test]
    fn stop_flag_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "x.bin", b"data");
        let stop = AtomicBool::new(true);
        let err = hash_file(&path, &stop, |_| {}).unwrap_err();
        assert!(matches!(err, HashError::Aborted));
    }
}
