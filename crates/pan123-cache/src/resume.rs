//! Upload resume records.
//!
//! A record is addressed by its preupload ID and carries per-chunk ETags. A
//! chunk counts as uploaded iff an ETag is recorded for it; the server's
//! list-parts endpoint is advisory, this store is what decides which parts
//! are re-sent. Records older than 24 hours are swept because the server
//! forgets the session by then anyway.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{store::Namespace, Result};

pub const RESUME_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResumeRecord {
    pub preupload_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u64,
    /// 1-based chunk index to the ETag the server acknowledged.
    pub uploaded_chunks: HashMap<i64, String>,
    pub uploaded_bytes: u64,
    pub last_updated: DateTime<Utc>,
}

impl ResumeRecord {
    pub fn new(preupload_id: String, file_name: String, file_size: u64, chunk_size: u64) -> Self {
        ResumeRecord {
            preupload_id,
            file_name,
            file_size,
            chunk_size,
            uploaded_chunks: HashMap::new(),
            uploaded_bytes: 0,
            last_updated: Utc::now(),
        }
    }

    pub fn total_chunks(&self) -> i64 {
        if self.chunk_size == 0 {
            return 0;
        }
        self.file_size.div_ceil(self.chunk_size) as i64
    }

    pub fn chunk_uploaded(&self, index: i64) -> bool {
        self.uploaded_chunks.contains_key(&index)
    }

    pub fn mark_uploaded(&mut self, index: i64, etag: String, bytes: u64) {
        if self.uploaded_chunks.insert(index, etag).is_none() {
            self.uploaded_bytes += bytes;
        }
        self.last_updated = Utc::now();
    }

    pub fn is_complete(&self) -> bool {
        let total = self.total_chunks();
        (1..=total).all(|index| self.chunk_uploaded(index))
    }
}

pub struct ResumeStore {
    ns: Arc<Namespace>,
}

impl ResumeStore {
    pub fn new(ns: Arc<Namespace>) -> Self {
        ResumeStore { ns }
    }

    pub fn load(&self, preupload_id: &str) -> Result<Option<ResumeRecord>> {
        let Some(record) = self.ns.get::<ResumeRecord>(preupload_id)? else {
            return Ok(None);
        };
        let age = Utc::now() - record.last_updated;
        if age.num_seconds() >= RESUME_TTL.as_secs() as i64 {
            self.ns.remove(preupload_id)?;
            return Ok(None);
        }
        Ok(Some(record))
    }

    pub fn save(&self, record: &ResumeRecord) -> Result<()> {
        self.ns.put(&record.preupload_id, record, Some(RESUME_TTL))
    }

    pub fn delete(&self, preupload_id: &str) -> Result<()> {
        self.ns.remove(preupload_id)?;
        Ok(())
    }

    /// Integrity check for one chunk: present iff an ETag is recorded.
    pub fn verify_chunk(&self, preupload_id: &str, index: i64) -> Result<bool> {
        Ok(self
            .load(preupload_id)?
            .map(|record| record.chunk_uploaded(index))
            .unwrap_or(false))
    }

    pub fn sweep(&self) -> Result<usize> {
        self.ns.sweep_expired()
    }
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use camino::Utf8PathBuf;

    use super::*;
    use crate::{namespaces, KvStore};

    fn store() -> Result<(tempfile::TempDir, ResumeStore)> {
        let dir = tempfile::tempdir()?;
        let kv = KvStore::open(Utf8PathBuf::try_from(dir.path().to_path_buf())?)?;
        Ok((dir, ResumeStore::new(kv.namespace(namespaces::RESUME)?)))
    }

    #[test]
    fn record_tracks_chunks_and_bytes() {
        let mut record = ResumeRecord::new("p1".to_string(), "big.bin".to_string(), 250, 100);
        assert_eq!(record.total_chunks(), 3);
        record.mark_uploaded(1, "e1".to_string(), 100);
        record.mark_uploaded(2, "e2".to_string(), 100);
        // Marking twice must not double-count bytes.
        record.mark_uploaded(2, "e2b".to_string(), 100);
        assert_eq!(record.uploaded_bytes, 200);
        assert!(!record.is_complete());
        record.mark_uploaded(3, "e3".to_string(), 50);
        assert!(record.is_complete());
    }

    #[test]
    fn verify_requires_recorded_etag() -> Result<()> {
        let (_dir, store) = store()?;
        let mut record = ResumeRecord::new("p2".to_string(), "x".to_string(), 200, 100);
        record.mark_uploaded(1, "etag-1".to_string(), 100);
        store.save(&record)?;

        assert!(store.verify_chunk("p2", 1)?);
        assert!(!store.verify_chunk("p2", 2)?);
        assert!(!store.verify_chunk("unknown", 1)?);
        Ok(())
    }

    #[test]
    fn stale_records_read_as_absent() -> Result<()> {
        let (_dir, store) = store()?;
        let mut record = ResumeRecord::new("p3".to_string(), "x".to_string(), 100, 100);
        record.last_updated = Utc::now() - chrono::Duration::hours(25);
        store.save(&record)?;
        assert!(store.load("p3")?.is_none());
        Ok(())
    }
}
