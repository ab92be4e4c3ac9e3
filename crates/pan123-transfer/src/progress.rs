//! Upload progress persistence.
//!
//! Progress lives in two places: a JSON file under the temp directory, keyed
//! by the MD5 of the preupload ID (cheap to rewrite after every part), and
//! the resume namespace of the KV store (authoritative, survives temp
//! cleanup). Loads prefer the temp file and fall back to the KV record;
//! stale entries older than a day are dropped on contact.

use std::{collections::HashMap, sync::Arc};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use pan123_cache::{ResumeRecord, ResumeStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{hash, Result};

const PROGRESS_DIR: &str = "rclone-123pan-progress";
const MAX_AGE_HOURS: i64 = 24;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadProgress {
    pub preupload_id: String,
    pub total_parts: i64,
    pub chunk_size: u64,
    pub file_size: u64,
    pub uploaded_parts: HashMap<i64, bool>,
    pub file_path: Option<String>,
    pub md5: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl UploadProgress {
    pub fn new(preupload_id: String, total_parts: i64, chunk_size: u64, file_size: u64) -> Self {
        UploadProgress {
            preupload_id,
            total_parts,
            chunk_size,
            file_size,
            uploaded_parts: HashMap::new(),
            file_path: None,
            md5: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_uploaded(&self, part: i64) -> bool {
        self.uploaded_parts.get(&part).copied().unwrap_or(false)
    }

    pub fn mark_uploaded(&mut self, part: i64) {
        self.uploaded_parts.insert(part, true);
    }

    pub fn remaining_parts(&self) -> Vec<i64> {
        (1..=self.total_parts)
            .filter(|part| !self.is_uploaded(*part))
            .collect()
    }

    /// A resumed session is only trusted when its geometry matches what this
    /// run derived; anything else restarts from scratch.
    pub fn matches(&self, total_parts: i64, chunk_size: u64, file_size: u64) -> bool {
        self.total_parts == total_parts
            && self.chunk_size == chunk_size
            && self.file_size == file_size
    }

    fn is_stale(&self) -> bool {
        (Utc::now() - self.created_at).num_hours() >= MAX_AGE_HOURS
    }
}

pub struct ProgressPersister {
    dir: Utf8PathBuf,
    resume: Arc<ResumeStore>,
}

impl ProgressPersister {
    pub fn new(resume: Arc<ResumeStore>) -> Result<Self> {
        let temp = std::env::temp_dir();
        let temp = Utf8Path::from_path(&temp).ok_or(crate::TransferError::NonUtf8TempDir)?;
        Self::with_dir(temp.join(PROGRESS_DIR), resume)
    }

    /// Progress directory override, used by tests and by callers that keep
    /// temp state somewhere other than the system default.
    pub fn with_dir(dir: Utf8PathBuf, resume: Arc<ResumeStore>) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(ProgressPersister { dir, resume })
    }

    fn file_path(&self, preupload_id: &str) -> Utf8PathBuf {
        self.dir
            .join(format!("{}.json", hash::md5_hex(preupload_id.as_bytes())))
    }

    /// Writes both persistence tiers. The KV write carries the per-chunk
    /// ETags; the temp file is the fast path for the next load.
    pub fn save(&self, progress: &UploadProgress, record: &ResumeRecord) -> Result<()> {
        let content = serde_json::to_string(progress)?;
        std::fs::write(self.file_path(&progress.preupload_id), content)?;
        self.resume.save(record)?;
        Ok(())
    }

    /// Loads progress for a session, preferring the temp file. A KV record
    /// with no temp file reconstructs the part map from its ETags.
    pub fn load(&self, preupload_id: &str) -> Result<Option<(UploadProgress, ResumeRecord)>> {
        let record = self.resume.load(preupload_id)?;
        let path = self.file_path(preupload_id);
        let progress = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<UploadProgress>(&content) {
                Ok(progress) if !progress.is_stale() => Some(progress),
                Ok(_) => {
                    debug!(preupload_id, "dropping stale progress file");
                    let _ = std::fs::remove_file(&path);
                    None
                }
                Err(err) => {
                    warn!(preupload_id, %err, "dropping unreadable progress file");
                    let _ = std::fs::remove_file(&path);
                    None
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };

        match (progress, record) {
            (Some(progress), Some(record)) => Ok(Some((progress, record))),
            (Some(progress), None) => {
                // Temp survived but the KV record is gone; rebuild it so the
                // authoritative tier exists again.
                let mut record = ResumeRecord::new(
                    progress.preupload_id.clone(),
                    String::new(),
                    progress.file_size,
                    progress.chunk_size,
                );
                for (&part, &done) in &progress.uploaded_parts {
                    if done {
                        record.uploaded_chunks.insert(part, String::new());
                    }
                }
                Ok(Some((progress, record)))
            }
            (None, Some(record)) => {
                let mut progress = UploadProgress::new(
                    record.preupload_id.clone(),
                    record.total_chunks(),
                    record.chunk_size,
                    record.file_size,
                );
                for &part in record.uploaded_chunks.keys() {
                    progress.mark_uploaded(part);
                }
                Ok(Some((progress, record)))
            }
            (None, None) => Ok(None),
        }
    }

    pub fn delete(&self, preupload_id: &str) -> Result<()> {
        let _ = std::fs::remove_file(self.file_path(preupload_id));
        self.resume.delete(preupload_id)?;
        Ok(())
    }

    /// Best-effort note that a failed upload left server-side debris. The
    /// server's own session GC removes the debris; the marker only feeds
    /// local housekeeping.
    pub fn mark_partial(&self, preupload_id: &str, file_name: &str) {
        let prefix = &hash::md5_hex(preupload_id.as_bytes())[..8];
        let marker = self.dir.join(format!("{file_name}.{prefix}.partial"));
        if let Err(err) = std::fs::write(&marker, []) {
            debug!(%marker, %err, "could not write partial-upload marker");
        }
    }

    /// Startup housekeeping: drops expired KV records, abandoned temp files
    /// and day-old partial markers.
    pub fn sweep(&self) -> Result<usize> {
        let mut swept = self.resume.sweep()?;
        for entry in self.dir.read_dir_utf8()? {
            let entry = entry?;
            if entry.path().as_str().ends_with(".partial") {
                let stale = entry
                    .metadata()
                    .and_then(|meta| meta.modified())
                    .map(|modified| {
                        modified
                            .elapsed()
                            .map(|age| age.as_secs() >= 24 * 60 * 60)
                            .unwrap_or(false)
                    })
                    .unwrap_or(true);
                if stale {
                    let _ = std::fs::remove_file(entry.path());
                    swept += 1;
                }
                continue;
            }
            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            match serde_json::from_str::<UploadProgress>(&content) {
                Ok(progress) if progress.is_stale() => {
                    let _ = std::fs::remove_file(entry.path());
                    swept += 1;
                }
                Ok(_) => {}
                Err(_) => {
                    let _ = std::fs::remove_file(entry.path());
                    swept += 1;
                }
            }
        }
        Ok(swept)
    }

    pub fn resume_store(&self) -> &Arc<ResumeStore> {
        &self.resume
    }
}
