#![deny(clippy::all)]

//! Transfer engine for the 123Pan driver.
//!
//! Uploads go through one entry point that sizes up the source, asks the
//! network monitor how the link is doing, picks a strategy and runs it:
//! a one-shot multipart form for small files with a known MD5, a two-pass
//! streaming upload for mid-size sources, or the chunked resumable protocol
//! (optionally concurrent) for everything large. Session creation always
//! carries the MD5, so the server's instant-upload dedup can short-circuit
//! any of them. Downloads take a slot, reuse cached presigned URLs and
//! report into the shared metrics ring.

mod chunked;
mod download;
pub mod hash;
pub mod metrics;
pub mod network;
pub mod progress;
mod session;
mod single_step;
pub mod source;
pub mod strategy;
mod streaming;
pub mod timeout;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use pan123_api_client::Pan123ApiClient;
use pan123_cache::MemoryManager;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::debug;

pub use download::{DownloadStream, Downloader};
pub use metrics::{MetricsRing, MetricsSummary, OperationMetric};
pub use network::NetworkMonitor;
pub use progress::{ProgressPersister, UploadProgress};
pub use source::{RandomAccessSource, UploadSource};
pub use strategy::Strategy;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Api(#[from] pan123_api_client::Error),
    #[error(transparent)]
    Cache(#[from] pan123_cache::CacheError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid progress state: {0}")]
    InvalidProgress(#[from] serde_json::Error),
    #[error("temp directory is not a UTF-8 path")]
    NonUtf8TempDir,
    #[error("file of {size} bytes is over the single-step limit")]
    SingleStepTooLarge { size: u64 },
    #[error("buffer of {size} bytes exceeds the {cap} byte cap")]
    OversizeBuffer { size: u64, cap: u64 },
    #[error("single-step upload did not complete")]
    SingleStepIncomplete,
    #[error("upload session {preupload_id} has missing parts after transfer")]
    UploadIncomplete { preupload_id: String },
    #[error("server did not finish assembling session {preupload_id} in time")]
    AsyncCompletionTimeout { preupload_id: String },
    #[error("declared size {declared} does not match source size {actual}")]
    SizeMismatch { declared: u64, actual: u64 },
    #[error("upload needs {parts} parts, over the {cap} part ceiling")]
    TooManyParts { parts: i64, cap: i64 },
    #[error("source changed during upload: declared MD5 {declared}, observed {observed}")]
    SourceChanged { declared: String, observed: String },
    #[error("download ended after {transferred} of {expected} bytes")]
    ShortDownload { expected: u64, transferred: u64 },
    #[error("transfer engine is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, TransferError>;

#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Base request timeout before adaptive scaling.
    pub base_timeout: Duration,
    pub max_upload_parts: i64,
    pub max_concurrent_uploads: usize,
    pub max_concurrent_downloads: usize,
    pub download_timeout: Duration,
    /// Sizes at or above this never take the one-shot form.
    pub upload_cutoff: Option<u64>,
    /// Fixed chunk size instead of the derived one; the server minimum and
    /// the accepted range still apply.
    pub chunk_size_override: Option<u64>,
    /// Periodic transfer-progress logging.
    pub progress_display: bool,
    pub progress_interval: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            base_timeout: Duration::from_secs(5 * 60),
            max_upload_parts: strategy::MAX_UPLOAD_PARTS,
            max_concurrent_uploads: 4,
            max_concurrent_downloads: 8,
            download_timeout: Duration::from_secs(10 * 60),
            upload_cutoff: None,
            chunk_size_override: None,
            progress_display: false,
            progress_interval: Duration::from_secs(5),
        }
    }
}

pub struct UploadRequest {
    pub parent_id: i64,
    pub file_name: String,
    /// Size the caller declared, checked against the source when present.
    pub declared_size: Option<u64>,
    pub known_md5: Option<String>,
    pub source: UploadSource,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadOutcome {
    pub file_id: i64,
    pub size: u64,
    pub etag: String,
    pub strategy: &'static str,
    /// True when the server already held the content and no bytes moved.
    pub reused: bool,
}

pub struct UploadEngine {
    client: Arc<Pan123ApiClient>,
    persister: Arc<ProgressPersister>,
    memory: Arc<MemoryManager>,
    network: Arc<NetworkMonitor>,
    metrics: Arc<MetricsRing>,
    config: TransferConfig,
    upload_slots: Arc<Semaphore>,
}

impl UploadEngine {
    pub fn new(
        client: Arc<Pan123ApiClient>,
        persister: Arc<ProgressPersister>,
        memory: Arc<MemoryManager>,
        network: Arc<NetworkMonitor>,
        metrics: Arc<MetricsRing>,
        config: TransferConfig,
    ) -> Self {
        let upload_slots = Arc::new(Semaphore::new(config.max_concurrent_uploads.max(1)));
        UploadEngine {
            client,
            persister,
            memory,
            network,
            metrics,
            config,
            upload_slots,
        }
    }

    /// Uploads one file and returns the resulting remote node's identity.
    /// The chosen strategy is in the outcome for observability.
    #[tracing::instrument(skip_all, fields(file_name = %request.file_name))]
    pub async fn upload(&self, request: UploadRequest) -> Result<UploadOutcome> {
        let _slot = self
            .upload_slots
            .acquire()
            .await
            .map_err(|_| TransferError::ShuttingDown)?;
        let started = Instant::now();

        let source = Arc::new(RandomAccessSource::open(request.source).await?);
        let size = source.len();
        if let Some(declared) = request.declared_size {
            if declared != size {
                return Err(TransferError::SizeMismatch {
                    declared,
                    actual: size,
                });
            }
        }
        let known_md5 = match request.known_md5 {
            Some(md5) => Some(md5.to_lowercase()),
            None => source.cached_md5().await,
        };

        let quality = self.network.quality();
        let mut chosen = strategy::select(
            size,
            known_md5.is_some(),
            quality,
            self.config.max_concurrent_uploads,
        );
        if let (Strategy::SingleStep, Some(cutoff)) = (chosen, self.config.upload_cutoff) {
            if size >= cutoff {
                chosen = Strategy::Chunked {
                    concurrent: size > 100 * strategy::MIB
                        && self.config.max_concurrent_uploads.min(strategy::MAX_CONCURRENCY) >= 2,
                };
            }
        }
        debug!(size, quality, strategy = chosen.name(), "upload strategy selected");

        let result = self
            .dispatch(chosen, &request.file_name, request.parent_id, &source, known_md5, quality)
            .await;

        let duration = started.elapsed();
        self.metrics.record(OperationMetric {
            operation: "upload",
            size,
            duration,
            error_count: u32::from(result.is_err()),
            retry_count: 0,
            concurrency_used: match chosen {
                Strategy::Chunked { concurrent: true } => self.config.max_concurrent_uploads,
                _ => 1,
            },
            chunk_size: 0,
        });
        result
    }

    async fn dispatch(
        &self,
        chosen: Strategy,
        file_name: &str,
        parent_id: i64,
        source: &Arc<RandomAccessSource>,
        known_md5: Option<String>,
        quality: f64,
    ) -> Result<UploadOutcome> {
        match (chosen, known_md5) {
            (Strategy::SingleStep, Some(md5)) => {
                match single_step::run(self, parent_id, file_name, source, &md5, quality).await {
                    Ok(outcome) => Ok(outcome),
                    Err(err) if single_step_falls_back(&err) => {
                        debug!(?err, "single-step failed, falling back to chunked");
                        let concurrent = source.len() > 100 * strategy::MIB
                            && self.config.max_concurrent_uploads.min(strategy::MAX_CONCURRENCY)
                                >= 2;
                        chunked::run(
                            self,
                            parent_id,
                            file_name,
                            Arc::clone(source),
                            Some(md5),
                            quality,
                            concurrent,
                        )
                        .await
                    }
                    Err(err) => Err(err),
                }
            }
            // A single-step pick without an MD5 cannot happen by the rules,
            // but the streaming path handles it correctly anyway.
            (Strategy::SingleStep, None) => {
                streaming::run(self, parent_id, file_name, source, None, quality).await
            }
            (Strategy::Streaming, known_md5) => {
                streaming::run(self, parent_id, file_name, source, known_md5, quality).await
            }
            (Strategy::Chunked { concurrent }, known_md5) => {
                chunked::run(
                    self,
                    parent_id,
                    file_name,
                    Arc::clone(source),
                    known_md5,
                    quality,
                    concurrent,
                )
                .await
            }
        }
    }

    /// Startup and shutdown housekeeping over progress state.
    pub fn sweep_progress(&self) -> Result<usize> {
        self.persister.sweep()
    }

    pub(crate) fn client(&self) -> &Pan123ApiClient {
        &self.client
    }

    pub(crate) fn client_arc(&self) -> &Arc<Pan123ApiClient> {
        &self.client
    }

    pub(crate) fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    pub(crate) fn network_arc(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    pub(crate) fn persister(&self) -> &ProgressPersister {
        &self.persister
    }

    pub(crate) fn base_timeout(&self) -> Duration {
        self.config.base_timeout
    }

    pub(crate) fn max_upload_parts(&self) -> i64 {
        self.config.max_upload_parts.clamp(1, strategy::MAX_UPLOAD_PARTS)
    }

    pub(crate) fn max_concurrent_uploads(&self) -> usize {
        self.config.max_concurrent_uploads
    }

    pub(crate) fn chunk_size_override(&self) -> Option<u64> {
        self.config.chunk_size_override
    }

    pub(crate) fn progress_display(&self) -> Option<Duration> {
        self.config.progress_display.then_some(self.config.progress_interval)
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn metrics(&self) -> &Arc<MetricsRing> {
        &self.metrics
    }
}

fn single_step_falls_back(err: &TransferError) -> bool {
    match err {
        TransferError::SingleStepIncomplete
        | TransferError::SingleStepTooLarge { .. }
        | TransferError::OversizeBuffer { .. } => true,
        TransferError::Api(api) => !api.is_terminal(),
        _ => false,
    }
}
