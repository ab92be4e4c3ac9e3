//! Disk-backed typed KV with TTL.
//!
//! Each namespace is a directory; each entry is one JSON file named by the
//! MD5 of its key so arbitrary keys (paths, composite tokens) stay
//! filesystem-safe. Entries are immutable once written; a new put overwrites
//! the file. Reads drop expired entries on contact, and a sweep can walk a
//! whole namespace for housekeeping.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use crate::{CacheError, Result};

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    key: String,
    cached_at: DateTime<Utc>,
    /// Absent means the entry never expires on its own.
    ttl_secs: Option<u64>,
    value: serde_json::Value,
}

impl Envelope {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let Some(ttl_secs) = self.ttl_secs else {
            return false;
        };
        let age = now - self.cached_at;
        age.num_seconds() >= ttl_secs as i64
    }
}

/// One named partition of the store. Holds its own lock; writers and the
/// sweep serialize per namespace, not globally.
pub struct Namespace {
    name: String,
    dir: Utf8PathBuf,
    lock: Mutex<()>,
}

impl Namespace {
    fn entry_path(&self, key: &str) -> Utf8PathBuf {
        let digest = Md5::digest(key.as_bytes());
        self.dir.join(format!("{}.json", hex::encode(digest)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn put<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()> {
        let envelope = Envelope {
            key: key.to_string(),
            cached_at: Utc::now(),
            ttl_secs: ttl.map(|t| t.as_secs()),
            value: serde_json::to_value(value).map_err(|error| CacheError::InvalidEntry {
                namespace: self.name.clone(),
                error,
            })?,
        };
        let content =
            serde_json::to_string(&envelope).map_err(|error| CacheError::InvalidEntry {
                namespace: self.name.clone(),
                error,
            })?;
        let _guard = self.lock.lock().unwrap();
        std::fs::write(self.entry_path(key), content)?;
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let path = self.entry_path(key);
        let _guard = self.lock.lock().unwrap();
        let Some(envelope) = self.read_envelope(&path)? else {
            return Ok(None);
        };
        if envelope.is_expired(Utc::now()) {
            debug!(namespace = %self.name, key, "dropping expired entry");
            let _ = std::fs::remove_file(&path);
            return Ok(None);
        }
        match serde_json::from_value(envelope.value) {
            Ok(value) => Ok(Some(value)),
            Err(error) => {
                // A shape change between versions reads as a miss, not a
                // failure; the stale file is dropped.
                debug!(namespace = %self.name, key, %error, "dropping undecodable entry");
                let _ = std::fs::remove_file(&path);
                Ok(None)
            }
        }
    }

    pub fn remove(&self, key: &str) -> Result<bool> {
        let _guard = self.lock.lock().unwrap();
        match std::fs::remove_file(self.entry_path(key)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Scan primitive: every live key in the namespace.
    pub fn keys(&self) -> Result<Vec<String>> {
        let _guard = self.lock.lock().unwrap();
        let now = Utc::now();
        let mut keys = Vec::new();
        for entry in self.dir.read_dir_utf8()? {
            let entry = entry?;
            if let Some(envelope) = self.read_envelope(entry.path())? {
                if !envelope.is_expired(now) {
                    keys.push(envelope.key);
                }
            }
        }
        Ok(keys)
    }

    /// Removes every entry whose key starts with `prefix`. Returns how many
    /// were dropped.
    pub fn remove_prefix(&self, prefix: &str) -> Result<usize> {
        let _guard = self.lock.lock().unwrap();
        let mut removed = 0;
        for entry in self.dir.read_dir_utf8()? {
            let entry = entry?;
            if let Some(envelope) = self.read_envelope(entry.path())? {
                if envelope.key.starts_with(prefix) {
                    std::fs::remove_file(entry.path())?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Drops expired entries. Returns how many were swept.
    pub fn sweep_expired(&self) -> Result<usize> {
        let _guard = self.lock.lock().unwrap();
        let now = Utc::now();
        let mut swept = 0;
        for entry in self.dir.read_dir_utf8()? {
            let entry = entry?;
            if let Some(envelope) = self.read_envelope(entry.path())? {
                if envelope.is_expired(now) {
                    std::fs::remove_file(entry.path())?;
                    swept += 1;
                }
            }
        }
        Ok(swept)
    }

    pub fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().unwrap();
        for entry in self.dir.read_dir_utf8()? {
            let entry = entry?;
            std::fs::remove_file(entry.path())?;
        }
        Ok(())
    }

    fn read_envelope(&self, path: &Utf8Path) -> Result<Option<Envelope>> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_str(&content) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(error) => {
                debug!(namespace = %self.name, %path, %error, "dropping corrupt entry");
                let _ = std::fs::remove_file(path);
                Ok(None)
            }
        }
    }
}

/// The store root. Namespaces are created on first use and live for the
/// process; `Arc<Namespace>` handles are cheap to clone into caches.
pub struct KvStore {
    root: Utf8PathBuf,
    namespaces: Mutex<Vec<(String, Arc<Namespace>)>>,
}

impl KvStore {
    pub fn open(root: impl Into<Utf8PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(KvStore {
            root,
            namespaces: Mutex::new(Vec::new()),
        })
    }

    pub fn namespace(&self, name: &str) -> Result<Arc<Namespace>> {
        let mut namespaces = self.namespaces.lock().unwrap();
        if let Some((_, ns)) = namespaces.iter().find(|(n, _)| n == name) {
            return Ok(Arc::clone(ns));
        }
        let dir = self.root.join(name);
        std::fs::create_dir_all(&dir)?;
        let ns = Arc::new(Namespace {
            name: name.to_string(),
            dir,
            lock: Mutex::new(()),
        });
        namespaces.push((name.to_string(), Arc::clone(&ns)));
        Ok(ns)
    }

    /// Housekeeping across every open namespace. Called at startup and from
    /// shutdown.
    pub fn sweep_all(&self) -> Result<usize> {
        let namespaces: Vec<_> = {
            let guard = self.namespaces.lock().unwrap();
            guard.iter().map(|(_, ns)| Arc::clone(ns)).collect()
        };
        let mut swept = 0;
        for ns in namespaces {
            swept += ns.sweep_expired()?;
        }
        Ok(swept)
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }
}
