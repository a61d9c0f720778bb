use std::path::PathBuf;

use crate::HashError;

/// Instruction sent from the pool to one worker.
#[derive(Debug, Clone)]
pub enum WorkerCommand {
    /// Fingerprint `source` on behalf of `task_id`.
    Calculate { task_id: String, source: PathBuf },
}

/// Report sent from a worker back to the pool.
#[derive(Debug)]
pub enum WorkerMessage {
    Start { task_id: String },
    Progress { task_id: String, progress: u8 },
    Complete { task_id: String, fingerprint: String },
    Error { task_id: String, error: HashError },
}

impl WorkerMessage {
    /// Task the message belongs to.
    pub fn task_id(&self) -> &str {
        match self {
            Self::Start { task_id }
            | Self::Progress { task_id, .. }
            | Self::Complete { task_id, .. }
            | Self::Error { task_id, .. } => task_id,
        }
    }

    /// Returns `true` for messages that release the worker.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }
}

/// A [`WorkerMessage`] tagged with the worker that produced it.
#[derive(Debug)]
pub struct WorkerEvent {
    pub worker: usize,
    pub message: WorkerMessage,
}
