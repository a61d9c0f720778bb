//! Persisted resume records keyed by content fingerprint.
//!
//! A record lists the chunk indices the remote has confirmed and the
//! session they belong to. It is written after every confirmed chunk
//! and removed once the transfer succeeds or is cancelled.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::TransferError;

/// Progress saved for one fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRecord {
    #[serde(rename = "uploadedChunks", default)]
    pub confirmed: BTreeSet<u32>,
    #[serde(rename = "uploadId", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Durable store of resume records.
///
/// Writes are last-writer-wins per fingerprint.
pub trait ResumeStore: Send + Sync {
    /// Replaces the record for `fingerprint`.
    fn save(&self, fingerprint: &str, record: &ResumeRecord) -> Result<(), TransferError>;

    /// Returns the record for `fingerprint`, if any.
    fn load(&self, fingerprint: &str) -> Result<Option<ResumeRecord>, TransferError>;

    /// Removes the record for `fingerprint`. Missing records are not an error.
    fn clear(&self, fingerprint: &str) -> Result<(), TransferError>;
}

// ---------------------------------------------------------------------------
// FileResumeStore
// ---------------------------------------------------------------------------

/// Resume store backed by a single JSON file.
///
/// Records are cached in memory; every mutation rewrites the file through
/// a temporary sibling and a rename so a crash never leaves it half written.
pub struct FileResumeStore {
    path: PathBuf,
    records: RwLock<HashMap<String, ResumeRecord>>,
}

impl FileResumeStore {
    /// Opens the store, loading existing records from disk.
    ///
    /// A corrupt file is discarded with a warning.
    pub fn open(path: PathBuf) -> Result<Self, TransferError> {
        let records = match load_records(&path) {
            Ok(records) => records,
            Err(TransferError::Json(e)) => {
                warn!(path = %path.display(), error = %e, "discarding corrupt resume file");
                HashMap::new()
            }
            Err(e) => return Err(e),
        };
        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    /// Returns the backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns all fingerprints with a stored record.
    pub fn fingerprints(&self) -> Vec<String> {
        self.records.read().unwrap().keys().cloned().collect()
    }

    fn persist(&self, records: &HashMap<String, ResumeRecord>) -> Result<(), TransferError> {
        let json = serde_json::to_string_pretty(records)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!("persisted {} resume record(s) to {:?}", records.len(), self.path);
        Ok(())
    }
}

impl ResumeStore for FileResumeStore {
    fn save(&self, fingerprint: &str, record: &ResumeRecord) -> Result<(), TransferError> {
        // Held across the write so renames cannot interleave.
        let mut records = self.records.write().unwrap();
        records.insert(fingerprint.to_string(), record.clone());
        self.persist(&records)
    }

    fn load(&self, fingerprint: &str) -> Result<Option<ResumeRecord>, TransferError> {
        Ok(self.records.read().unwrap().get(fingerprint).cloned())
    }

    fn clear(&self, fingerprint: &str) -> Result<(), TransferError> {
        let mut records = self.records.write().unwrap();
        if records.remove(fingerprint).is_some() {
            self.persist(&records)?;
        }
        Ok(())
    }
}

/// Loads records from a JSON file on disk.
fn load_records(path: &Path) -> Result<HashMap<String, ResumeRecord>, TransferError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let data = std::fs::read_to_string(path)?;
    let records: HashMap<String, ResumeRecord> = serde_json::from_str(&data)?;
    debug!("loaded {} resume record(s) from {:?}", records.len(), path);
    Ok(records)
}

// ---------------------------------------------------------------------------
// MemoryResumeStore
// ---------------------------------------------------------------------------

/// Non-durable store for tests and throwaway sessions.
#[derive(Default)]
pub struct MemoryResumeStore {
    records: RwLock<HashMap<String, ResumeRecord>>,
}

impl MemoryResumeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResumeStore for MemoryResumeStore {
    fn save(&self, fingerprint: &str, record: &ResumeRecord) -> Result<(), TransferError> {
        self.records
            .write()
            .unwrap()
            .insert(fingerprint.to_string(), record.clone());
        Ok(())
    }

    fn load(&self, fingerprint: &str) -> Result<Option<ResumeRecord>, TransferError> {
        Ok(self.records.read().unwrap().get(fingerprint).cloned())
    }

    fn clear(&self, fingerprint: &str) -> Result<(), TransferError> {
        self.records.write().unwrap().remove(fingerprint);
        Ok(())
    }
}
