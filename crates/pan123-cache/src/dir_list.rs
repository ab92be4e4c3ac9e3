//! Directory-listing cache.
//!
//! A page is keyed by `(parent_id, continuation_token)` so partial listings of
//! huge directories cache independently. Any mutation under a parent clears
//! that parent's pages with a precise prefix scan instead of an all-clear.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use pan123_api::FileInfo;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{store::Namespace, Result};

const TTL: Duration = Duration::from_secs(3 * 60);
const PAGE_VERSION: u32 = 1;

/// Continuation token for the first page.
pub const START_TOKEN: &str = "start";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedDirPage {
    pub file_list: Vec<FileInfo>,
    pub next_token: i64,
    pub cached_at: DateTime<Utc>,
    pub version: u32,
    pub checksum: String,
}

impl CachedDirPage {
    fn checksum_of(file_list: &[FileInfo], next_token: i64) -> String {
        let mut hasher = Md5::new();
        for file in file_list {
            hasher.update(file.file_id.to_le_bytes());
            hasher.update(file.filename.as_bytes());
            hasher.update(file.etag.as_bytes());
        }
        hasher.update(next_token.to_le_bytes());
        hex::encode(hasher.finalize())
    }

    fn is_intact(&self) -> bool {
        self.version == PAGE_VERSION
            && self.checksum == Self::checksum_of(&self.file_list, self.next_token)
    }
}

pub struct DirListCache {
    ns: Arc<Namespace>,
}

impl DirListCache {
    pub fn new(ns: Arc<Namespace>) -> Self {
        DirListCache { ns }
    }

    fn key(parent_id: i64, token: &str) -> String {
        format!("{parent_id}:{token}")
    }

    pub fn get(&self, parent_id: i64, token: &str) -> Result<Option<CachedDirPage>> {
        let key = Self::key(parent_id, token);
        let Some(page) = self.ns.get::<CachedDirPage>(&key)? else {
            return Ok(None);
        };
        if !page.is_intact() {
            debug!(parent_id, token, "discarding dir page with stale version or checksum");
            self.ns.remove(&key)?;
            return Ok(None);
        }
        Ok(Some(page))
    }

    pub fn put(&self, parent_id: i64, token: &str, file_list: Vec<FileInfo>, next_token: i64) -> Result<()> {
        let checksum = CachedDirPage::checksum_of(&file_list, next_token);
        let page = CachedDirPage {
            file_list,
            next_token,
            cached_at: Utc::now(),
            version: PAGE_VERSION,
            checksum,
        };
        self.ns.put(&Self::key(parent_id, token), &page, Some(TTL))
    }

    /// Clears every cached page of one parent.
    pub fn invalidate(&self, parent_id: i64) -> Result<usize> {
        self.ns.remove_prefix(&format!("{parent_id}:"))
    }
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use camino::Utf8PathBuf;

    use super::*;
    use crate::{namespaces, KvStore};

    fn cache() -> Result<(tempfile::TempDir, DirListCache)> {
        let dir = tempfile::tempdir()?;
        let store = KvStore::open(Utf8PathBuf::try_from(dir.path().to_path_buf())?)?;
        let ns = store.namespace(namespaces::DIR_LIST)?;
        Ok((dir, DirListCache::new(ns)))
    }

    fn file(id: i64, name: &str) -> FileInfo {
        FileInfo {
            file_id: id,
            filename: name.to_string(),
            file_type: 0,
            size: 1,
            etag: "e".to_string(),
            status: 2,
            parent_file_id: 0,
            trashed: 0,
        }
    }

    #[test]
    fn pages_round_trip_with_checksum() -> Result<()> {
        let (_dir, cache) = cache()?;
        cache.put(0, START_TOKEN, vec![file(1, "a"), file(2, "b")], 2)?;
        let page = cache.get(0, START_TOKEN)?.unwrap();
        assert_eq!(page.file_list.len(), 2);
        assert_eq!(page.next_token, 2);
        Ok(())
    }

    #[test]
    fn invalidation_clears_only_that_parent() -> Result<()> {
        let (_dir, cache) = cache()?;
        cache.put(7, START_TOKEN, vec![file(1, "a")], -1)?;
        cache.put(7, "204", vec![file(2, "b")], -1)?;
        cache.put(70, START_TOKEN, vec![file(3, "c")], -1)?;

        assert_eq!(cache.invalidate(7)?, 2);
        assert!(cache.get(7, START_TOKEN)?.is_none());
        assert!(cache.get(70, START_TOKEN)?.is_some());
        Ok(())
    }
}
