//! Path resolution caches.
//!
//! `PathIdCache` maps normalised remote paths to node IDs; a mutation on a
//! path clears the path itself and everything under it, because children were
//! resolved through it. `ParentIdCache` remembers whether a node ID exists,
//! caching negatives too so repeated probes for a deleted parent stay cheap.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{store::Namespace, Result};

const PATH_TTL: Duration = Duration::from_secs(12 * 60);
const PARENT_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathIdEntry {
    pub id: i64,
    pub is_dir: bool,
    pub parent_id: i64,
}

pub struct PathIdCache {
    ns: Arc<Namespace>,
}

impl PathIdCache {
    pub fn new(ns: Arc<Namespace>) -> Self {
        PathIdCache { ns }
    }

    pub fn get(&self, path: &str) -> Result<Option<PathIdEntry>> {
        self.ns.get(path)
    }

    pub fn put(&self, path: &str, entry: &PathIdEntry) -> Result<()> {
        self.ns.put(path, entry, Some(PATH_TTL))
    }

    /// Clears the path and every descendant mapping.
    pub fn invalidate_subtree(&self, path: &str) -> Result<usize> {
        let mut removed = usize::from(self.ns.remove(path)?);
        let prefix = if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{path}/")
        };
        removed += self.ns.remove_prefix(&prefix)?;
        Ok(removed)
    }
}

pub struct ParentIdCache {
    ns: Arc<Namespace>,
}

impl ParentIdCache {
    pub fn new(ns: Arc<Namespace>) -> Self {
        ParentIdCache { ns }
    }

    pub fn get(&self, id: i64) -> Result<Option<bool>> {
        self.ns.get(&id.to_string())
    }

    pub fn put(&self, id: i64, exists: bool) -> Result<()> {
        self.ns.put(&id.to_string(), &exists, Some(PARENT_TTL))
    }

    pub fn invalidate(&self, id: i64) -> Result<()> {
        self.ns.remove(&id.to_string())?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use camino::Utf8PathBuf;

    use super::*;
    use crate::{namespaces, KvStore};

    fn caches() -> Result<(tempfile::TempDir, PathIdCache, ParentIdCache)> {
        let dir = tempfile::tempdir()?;
        let store = KvStore::open(Utf8PathBuf::try_from(dir.path().to_path_buf())?)?;
        let paths = PathIdCache::new(store.namespace(namespaces::PATH_TO_ID)?);
        let parents = ParentIdCache::new(store.namespace(namespaces::PARENT_IDS)?);
        Ok((dir, paths, parents))
    }

    #[test]
    fn subtree_invalidation_spares_siblings() -> Result<()> {
        let (_dir, paths, _) = caches()?;
        let entry = |id| PathIdEntry {
            id,
            is_dir: true,
            parent_id: 0,
        };
        paths.put("/a", &entry(1))?;
        paths.put("/a/b", &entry(2))?;
        paths.put("/a/b/c", &entry(3))?;
        paths.put("/ab", &entry(4))?;

        let removed = paths.invalidate_subtree("/a")?;
        assert_eq!(removed, 3);
        assert!(paths.get("/a")?.is_none());
        assert!(paths.get("/a/b/c")?.is_none());
        assert_eq!(paths.get("/ab")?.unwrap().id, 4);
        Ok(())
    }

    #[test]
    fn parent_cache_remembers_negatives() -> Result<()> {
        let (_dir, _, parents) = caches()?;
        parents.put(9, false)?;
        assert_eq!(parents.get(9)?, Some(false));
        parents.invalidate(9)?;
        assert_eq!(parents.get(9)?, None);
        Ok(())
    }
}
