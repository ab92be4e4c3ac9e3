//! Presigned download-URL cache with access-pattern tracking.
//!
//! URLs expire server-side; the cache TTL ends one minute before the signed
//! expiry so a handed-out URL is never already dead. A companion namespace
//! accumulates per-file access statistics used to score hot files for
//! optional prefetching.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{store::Namespace, Result};

/// Margin subtracted from the signed expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
    pub file_size: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessPattern {
    pub access_count: u64,
    pub last_access: Option<DateTime<Utc>>,
    pub priority: f64,
    pub file_size: i64,
}

impl AccessPattern {
    /// Recency-weighted score. Frequent recent readers float to the top.
    fn rescore(&mut self, now: DateTime<Utc>) {
        let recency = match self.last_access {
            Some(last) => {
                let idle_mins = (now - last).num_minutes().max(0) as f64;
                1.0 / (1.0 + idle_mins / 30.0)
            }
            None => 1.0,
        };
        self.priority = self.access_count as f64 * recency;
    }
}

pub struct DownloadUrlCache {
    urls: Arc<Namespace>,
    patterns: Arc<Namespace>,
}

impl DownloadUrlCache {
    pub fn new(urls: Arc<Namespace>, patterns: Arc<Namespace>) -> Self {
        DownloadUrlCache { urls, patterns }
    }

    pub fn get(&self, file_id: i64) -> Result<Option<CachedUrl>> {
        let Some(cached) = self.urls.get::<CachedUrl>(&file_id.to_string())? else {
            return Ok(None);
        };
        if cached.expires_at <= Utc::now() {
            self.urls.remove(&file_id.to_string())?;
            return Ok(None);
        }
        Ok(Some(cached))
    }

    pub fn put(&self, file_id: i64, url: String, expires_at: DateTime<Utc>, file_size: i64) -> Result<()> {
        let now = Utc::now();
        let lifetime = (expires_at - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .saturating_sub(EXPIRY_MARGIN);
        if lifetime.is_zero() {
            // Nearly expired URLs are not worth caching.
            return Ok(());
        }
        self.urls.put(
            &file_id.to_string(),
            &CachedUrl {
                url,
                expires_at,
                file_size,
            },
            Some(lifetime),
        )
    }

    pub fn invalidate(&self, file_id: i64) -> Result<()> {
        self.urls.remove(&file_id.to_string())?;
        Ok(())
    }

    /// Records one read of a file and refreshes its priority score.
    pub fn record_access(&self, file_id: i64, file_size: i64) -> Result<()> {
        let key = file_id.to_string();
        let mut pattern = self
            .patterns
            .get::<AccessPattern>(&key)?
            .unwrap_or_default();
        let now = Utc::now();
        pattern.access_count += 1;
        pattern.file_size = file_size;
        pattern.rescore(now);
        pattern.last_access = Some(now);
        self.patterns.put(&key, &pattern, None)
    }

    /// The highest-priority file IDs, for prefetch advice.
    pub fn hot_files(&self, limit: usize) -> Result<Vec<(i64, AccessPattern)>> {
        let mut scored = Vec::new();
        for key in self.patterns.keys()? {
            let Ok(file_id) = key.parse::<i64>() else {
                continue;
            };
            if let Some(pattern) = self.patterns.get::<AccessPattern>(&key)? {
                scored.push((file_id, pattern));
            }
        }
        scored.sort_by(|a, b| {
            b.1.priority
                .partial_cmp(&a.1.priority)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(limit);
        Ok(scored)
    }
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use camino::Utf8PathBuf;
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::{namespaces, KvStore};

    fn cache() -> Result<(tempfile::TempDir, DownloadUrlCache)> {
        let dir = tempfile::tempdir()?;
        let store = KvStore::open(Utf8PathBuf::try_from(dir.path().to_path_buf())?)?;
        let cache = DownloadUrlCache::new(
            store.namespace(namespaces::DOWNLOAD_URL)?,
            store.namespace(namespaces::DOWNLOAD_URL_ENHANCED)?,
        );
        Ok((dir, cache))
    }

    #[test]
    fn urls_survive_until_the_margin() -> Result<()> {
        let (_dir, cache) = cache()?;
        cache.put(
            1,
            "https://dl.example/one".to_string(),
            Utc::now() + ChronoDuration::minutes(10),
            100,
        )?;
        assert_eq!(cache.get(1)?.unwrap().url, "https://dl.example/one");
        Ok(())
    }

    #[test]
    fn nearly_expired_urls_are_not_cached() -> Result<()> {
        let (_dir, cache) = cache()?;
        cache.put(
            2,
            "https://dl.example/two".to_string(),
            Utc::now() + ChronoDuration::seconds(30),
            100,
        )?;
        assert!(cache.get(2)?.is_none());
        Ok(())
    }

    #[test]
    fn hot_files_rank_by_access() -> Result<()> {
        let (_dir, cache) = cache()?;
        for _ in 0..5 {
            cache.record_access(10, 1000)?;
        }
        cache.record_access(20, 1000)?;

        let hot = cache.hot_files(2)?;
        assert_eq!(hot.len(), 2);
        assert_eq!(hot[0].0, 10);
        assert!(hot[0].1.priority > hot[1].1.priority);
        Ok(())
    }
}
