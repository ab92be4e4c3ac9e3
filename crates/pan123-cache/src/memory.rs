//! In-process buffer ledger.
//!
//! Transfers that buffer file content in memory register their buffers here
//! so the process-wide footprint stays bounded: 200 MiB total, 50 MiB per
//! file by default. Under pressure the least-recently-accessed buffer goes
//! first, ties broken by the lowest access count.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::Instant,
};

use bytes::Bytes;

pub const DEFAULT_MAX_TOTAL: u64 = 200 * 1024 * 1024;
pub const DEFAULT_MAX_FILE: u64 = 50 * 1024 * 1024;

#[derive(Debug)]
struct BufferEntry {
    data: Bytes,
    last_access: Instant,
    access_count: u64,
}

#[derive(Debug, Default)]
struct Ledger {
    used: u64,
    buffers: HashMap<String, BufferEntry>,
}

#[derive(Debug)]
pub struct MemoryManager {
    max_total: u64,
    max_file: u64,
    state: Mutex<Ledger>,
}

impl Default for MemoryManager {
    fn default() -> Self {
        MemoryManager::new(DEFAULT_MAX_TOTAL, DEFAULT_MAX_FILE)
    }
}

impl MemoryManager {
    pub fn new(max_total: u64, max_file: u64) -> Self {
        MemoryManager {
            max_total,
            max_file,
            state: Mutex::new(Ledger::default()),
        }
    }

    pub fn max_file(&self) -> u64 {
        self.max_file
    }

    /// Whether a buffer of `len` bytes may be held in memory at all.
    pub fn fits(&self, len: u64) -> bool {
        len <= self.max_file && len <= self.max_total
    }

    /// Stores a buffer, evicting colder ones if the ceiling would be crossed.
    /// Returns false when the buffer exceeds the per-file ceiling and must go
    /// to disk instead.
    pub fn insert(&self, key: &str, data: Bytes) -> bool {
        let len = data.len() as u64;
        if !self.fits(len) {
            return false;
        }
        let mut ledger = self.state.lock().unwrap();
        if let Some(old) = ledger.buffers.remove(key) {
            ledger.used -= old.data.len() as u64;
        }
        while ledger.used + len > self.max_total {
            let Some(victim) = Self::coldest(&ledger) else {
                break;
            };
            if let Some(entry) = ledger.buffers.remove(&victim) {
                ledger.used -= entry.data.len() as u64;
            }
        }
        ledger.used += len;
        ledger.buffers.insert(
            key.to_string(),
            BufferEntry {
                data,
                last_access: Instant::now(),
                access_count: 0,
            },
        );
        true
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        let mut ledger = self.state.lock().unwrap();
        let entry = ledger.buffers.get_mut(key)?;
        entry.last_access = Instant::now();
        entry.access_count += 1;
        Some(entry.data.clone())
    }

    pub fn remove(&self, key: &str) {
        let mut ledger = self.state.lock().unwrap();
        if let Some(entry) = ledger.buffers.remove(key) {
            ledger.used -= entry.data.len() as u64;
        }
    }

    pub fn used(&self) -> u64 {
        self.state.lock().unwrap().used
    }

    fn coldest(ledger: &Ledger) -> Option<String> {
        ledger
            .buffers
            .iter()
            .min_by(|(_, a), (_, b)| {
                a.last_access
                    .cmp(&b.last_access)
                    .then(a.access_count.cmp(&b.access_count))
            })
            .map(|(key, _)| key.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn per_file_ceiling_rejects_oversize_buffers() {
        let manager = MemoryManager::new(1000, 100);
        assert!(!manager.insert("big", Bytes::from(vec![0u8; 101])));
        assert!(manager.insert("ok", Bytes::from(vec![0u8; 100])));
        assert_eq!(manager.used(), 100);
    }

    #[test]
    fn total_ceiling_evicts_least_recently_accessed() {
        let manager = MemoryManager::new(250, 100);
        assert!(manager.insert("a", Bytes::from(vec![0u8; 100])));
        assert!(manager.insert("b", Bytes::from(vec![0u8; 100])));
        // Touch "a" so "b" is the eviction candidate.
        manager.get("a");
        assert!(manager.insert("c", Bytes::from(vec![0u8; 100])));

        assert!(manager.get("b").is_none());
        assert!(manager.get("a").is_some());
        assert!(manager.get("c").is_some());
        assert!(manager.used() <= 250);
    }

    #[test]
    fn reinsert_replaces_without_leaking_budget() {
        let manager = MemoryManager::new(300, 200);
        assert!(manager.insert("k", Bytes::from(vec![0u8; 200])));
        assert!(manager.insert("k", Bytes::from(vec![0u8; 50])));
        assert_eq!(manager.used(), 50);
    }
}
