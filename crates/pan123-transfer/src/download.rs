//! Download path.
//!
//! Opening a file fetches a presigned URL (cache hit preferred), takes a
//! download slot from the shared semaphore and issues the GET, optionally
//! with a byte range. Small whole-file reads of hot files are served from
//! the in-process buffer ledger when possible. The slot is held for the life
//! of the returned stream; closing it records metrics and releases the slot.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use pan123_api_client::Pan123ApiClient;
use pan123_cache::{DownloadUrlCache, MemoryManager};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::{
    metrics::{MetricsRing, OperationMetric},
    network::NetworkMonitor,
    Result, TransferError,
};

/// Fallback lifetime when the server does not report a URL expiry.
const DEFAULT_URL_LIFETIME_MINS: i64 = 30;

pub struct Downloader {
    client: Arc<Pan123ApiClient>,
    urls: Arc<DownloadUrlCache>,
    memory: Arc<MemoryManager>,
    network: Arc<NetworkMonitor>,
    metrics: Arc<MetricsRing>,
    slots: Arc<Semaphore>,
    timeout: Duration,
}

impl Downloader {
    pub fn new(
        client: Arc<Pan123ApiClient>,
        urls: Arc<DownloadUrlCache>,
        memory: Arc<MemoryManager>,
        network: Arc<NetworkMonitor>,
        metrics: Arc<MetricsRing>,
        max_concurrent_downloads: usize,
        timeout: Duration,
    ) -> Self {
        Downloader {
            client,
            urls,
            memory,
            network,
            metrics,
            slots: Arc::new(Semaphore::new(max_concurrent_downloads.max(1))),
            timeout,
        }
    }

    /// A presigned URL for the file, from cache when still live.
    pub async fn download_url(&self, file_id: i64, file_size: i64) -> Result<String> {
        self.download_url_with_ua(file_id, file_size, None).await
    }

    /// Same, but fetched with a caller-supplied User-Agent. UA-bound URLs
    /// bypass the cache both ways.
    pub async fn download_url_with_ua(
        &self,
        file_id: i64,
        file_size: i64,
        user_agent: Option<&str>,
    ) -> Result<String> {
        if user_agent.is_none() {
            if let Some(cached) = self.urls.get(file_id)? {
                debug!(file_id, "download URL cache hit");
                return Ok(cached.url);
            }
        }
        let info = self.client.download_info(file_id, user_agent).await?;
        if user_agent.is_none() {
            let expires_at = parse_expiry(info.expire_time.as_deref());
            self.urls
                .put(file_id, info.download_url.clone(), expires_at, file_size)?;
        }
        Ok(info.download_url)
    }

    /// Opens the file for reading. `range` is inclusive byte offsets.
    pub async fn open(
        &self,
        file_id: i64,
        file_size: u64,
        range: Option<(u64, u64)>,
    ) -> Result<DownloadStream> {
        let expected = match range {
            Some((start, end)) => end.saturating_sub(start) + 1,
            None => file_size,
        };
        self.urls.record_access(file_id, file_size as i64)?;

        // Whole-file reads of buffered hot files skip the network.
        let buffer_key = file_id.to_string();
        if range.is_none() {
            if let Some(cached) = self.memory.get(&buffer_key) {
                if cached.len() as u64 == file_size {
                    debug!(file_id, "serving download from memory");
                    return Ok(DownloadStream::from_memory(cached));
                }
            }
        }

        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ShuttingDown)?;
        let url = self.download_url(file_id, file_size as i64).await?;
        let response = self.client.download(&url, range, None, self.timeout).await?;

        Ok(DownloadStream {
            inner: Inner::Remote {
                body: response.bytes_stream().boxed(),
                permit,
                metrics: Arc::clone(&self.metrics),
                network: Arc::clone(&self.network),
                memory: (range.is_none() && self.memory.fits(file_size))
                    .then(|| (Arc::clone(&self.memory), buffer_key, Vec::new())),
                started: Instant::now(),
            },
            expected,
            transferred: 0,
        })
    }
}

fn parse_expiry(expire_time: Option<&str>) -> DateTime<Utc> {
    expire_time
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
        .unwrap_or_else(|| Utc::now() + chrono::Duration::minutes(DEFAULT_URL_LIFETIME_MINS))
}

type BodyStream =
    futures::stream::BoxStream<'static, std::result::Result<Bytes, reqwest::Error>>;

enum Inner {
    Remote {
        body: BodyStream,
        #[allow(dead_code)]
        permit: OwnedSemaphorePermit,
        metrics: Arc<MetricsRing>,
        network: Arc<NetworkMonitor>,
        /// When set, completed whole-file bodies are parked in the ledger.
        memory: Option<(Arc<MemoryManager>, String, Vec<u8>)>,
        started: Instant,
    },
    Memory(Option<Bytes>),
}

/// A readable download. The semaphore slot is released when the stream is
/// dropped; metrics are recorded at end of stream.
pub struct DownloadStream {
    inner: Inner,
    expected: u64,
    transferred: u64,
}

impl DownloadStream {
    fn from_memory(data: Bytes) -> Self {
        DownloadStream {
            expected: data.len() as u64,
            transferred: 0,
            inner: Inner::Memory(Some(data)),
        }
    }

    /// Next chunk of the body, or `None` at end of stream.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        match &mut self.inner {
            Inner::Memory(data) => {
                let Some(data) = data.take() else {
                    return Ok(None);
                };
                self.transferred += data.len() as u64;
                Ok(Some(data))
            }
            Inner::Remote {
                body,
                metrics,
                network,
                memory,
                started,
                ..
            } => match body.next().await {
                Some(Ok(chunk)) => {
                    self.transferred += chunk.len() as u64;
                    if let Some((_, _, buffer)) = memory.as_mut() {
                        buffer.extend_from_slice(&chunk);
                    }
                    Ok(Some(chunk))
                }
                Some(Err(err)) => {
                    network.record_error();
                    Err(pan123_api_client::Error::from(err).into())
                }
                None => {
                    let duration = started.elapsed();
                    let complete = self.transferred == self.expected;
                    metrics.record(OperationMetric {
                        operation: "download",
                        size: self.transferred,
                        duration,
                        error_count: u32::from(!complete),
                        retry_count: 0,
                        concurrency_used: 1,
                        chunk_size: 0,
                    });
                    network.record_success(duration, self.transferred, duration);
                    if complete {
                        if let Some((manager, key, buffer)) = memory.take() {
                            manager.insert(&key, Bytes::from(buffer));
                        }
                    } else {
                        warn!(
                            expected = self.expected,
                            transferred = self.transferred,
                            "download ended short of the declared size"
                        );
                    }
                    Ok(None)
                }
            },
        }
    }

    /// Drains the stream into one buffer. Fails when the transferred size
    /// does not match the expected size.
    pub async fn read_all(mut self) -> Result<Bytes> {
        let mut out = Vec::with_capacity(self.expected.min(64 * 1024 * 1024) as usize);
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        if out.len() as u64 != self.expected {
            return Err(TransferError::ShortDownload {
                expected: self.expected,
                transferred: out.len() as u64,
            });
        }
        Ok(Bytes::from(out))
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }
}
