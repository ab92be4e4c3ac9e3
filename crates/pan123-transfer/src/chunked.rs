//! Chunked resumable upload, the workhorse for large files.
//!
//! The session protocol: create (which doubles as the instant-upload probe),
//! load and validate any prior progress for the preupload ID, drop claimed
//! parts that fail the integrity check, move the missing parts, then
//! complete and poll the async assembly. Progress is persisted after every
//! part so a crash resumes instead of restarting.
//!
//! The concurrent variant runs a fixed worker pool over a shared job queue;
//! results flow back over a bounded channel and a fatal error cancels the
//! remaining workers, persists progress and returns.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use pan123_api_client::{retry, Pan123ApiClient};
use pan123_cache::ResumeRecord;
use tokio::{sync::mpsc, task::JoinHandle, time::sleep};
use tracing::{debug, warn};

use crate::{
    hash::{self, Md5Accumulator},
    network::NetworkMonitor,
    progress::UploadProgress,
    session,
    source::RandomAccessSource,
    strategy::{Strategy, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE},
    timeout::adaptive_timeout,
    Result, TransferError, UploadEngine, UploadOutcome,
};

struct ChunkOutcome {
    index: i64,
    etag: String,
    size: u64,
    duration: Duration,
    error: Option<TransferError>,
}

/// Optional periodic progress line, rate-limited to the configured interval.
struct ProgressDisplay {
    interval: Option<(Duration, Instant)>,
}

impl ProgressDisplay {
    fn new(interval: Option<Duration>) -> Self {
        ProgressDisplay {
            interval: interval.map(|i| (i, Instant::now())),
        }
    }

    fn tick(&mut self, file_name: &str, progress: &UploadProgress) {
        let Some((interval, last)) = &mut self.interval else {
            return;
        };
        if last.elapsed() < *interval {
            return;
        }
        *last = Instant::now();
        let done = progress.total_parts - progress.remaining_parts().len() as i64;
        tracing::info!(file_name, done, total = progress.total_parts, "upload progress");
    }
}

/// Worker handles aborted on drop, so cancelling the upload future reaps the
/// pool.
struct WorkerPool(Vec<JoinHandle<()>>);

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

pub(crate) async fn run(
    engine: &UploadEngine,
    parent_id: i64,
    file_name: &str,
    source: Arc<RandomAccessSource>,
    known_md5: Option<String>,
    quality: f64,
    concurrent: bool,
) -> Result<UploadOutcome> {
    let size = source.len();
    let mbps = engine.network().estimated_mbps();
    let strategy = Strategy::Chunked { concurrent };

    // The create call needs the etag up front; a source that does not know
    // its MD5 pays one sequential pass here. The accumulator still produces
    // the transfer-time digest for verification.
    let md5_hex = match known_md5 {
        Some(md5) => md5,
        None => source.md5_hex().await?,
    };

    let created = session::create(engine.client(), parent_id, file_name, size, &md5_hex).await?;
    if created.reuse {
        return Ok(UploadOutcome {
            file_id: created.file_id,
            size,
            etag: md5_hex,
            strategy: strategy.name(),
            reused: true,
        });
    }
    let preupload_id = created.preupload_id.clone();

    // The larger of the client-derived and server-offered slice wins, then
    // the accepted range and the part ceiling apply. A configured chunk size
    // replaces the derived one, not the server's minimum.
    let derived = engine
        .chunk_size_override()
        .unwrap_or_else(|| crate::strategy::derive_chunk_size(size, mbps));
    let mut chunk_size = derived
        .max(created.slice_size.max(0) as u64)
        .clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
    let max_parts = engine.max_upload_parts();
    if size.div_ceil(chunk_size) > max_parts as u64 {
        chunk_size = size.div_ceil(max_parts as u64).clamp(chunk_size, MAX_CHUNK_SIZE);
    }
    let total_parts = size.div_ceil(chunk_size).max(1) as i64;
    if total_parts > max_parts {
        return Err(TransferError::TooManyParts {
            parts: total_parts,
            cap: max_parts,
        });
    }

    // Prior progress for this session, discarded when the geometry differs.
    let (mut progress, mut record) = match engine.persister().load(&preupload_id)? {
        Some((progress, record)) if progress.matches(total_parts, chunk_size, size) => {
            debug!(
                preupload_id,
                uploaded = progress.uploaded_parts.len(),
                "resuming upload session"
            );
            (progress, record)
        }
        Some(_) => {
            debug!(preupload_id, "discarding progress with mismatched geometry");
            engine.persister().delete(&preupload_id)?;
            (
                UploadProgress::new(preupload_id.clone(), total_parts, chunk_size, size),
                ResumeRecord::new(preupload_id.clone(), file_name.to_string(), size, chunk_size),
            )
        }
        None => (
            UploadProgress::new(preupload_id.clone(), total_parts, chunk_size, size),
            ResumeRecord::new(preupload_id.clone(), file_name.to_string(), size, chunk_size),
        ),
    };
    progress.md5 = Some(md5_hex.clone());

    // Integrity pass: a part only counts as uploaded if its ETag made it to
    // the resume record.
    for part in 1..=total_parts {
        if progress.is_uploaded(part) && !record.chunk_uploaded(part) {
            warn!(preupload_id, part, "dropping part with no recorded etag");
            progress.uploaded_parts.remove(&part);
        }
    }

    let remaining = progress.remaining_parts();
    debug!(
        file_name,
        size,
        chunk_size,
        total_parts,
        remaining = remaining.len(),
        concurrent,
        "chunked upload"
    );

    let accumulator = Arc::new(Mutex::new(Md5Accumulator::new(hash::DEFAULT_PENDING_BUDGET)));
    let chunk_timeout = adaptive_timeout(engine.base_timeout(), chunk_size, strategy, quality);
    let mut display = ProgressDisplay::new(engine.progress_display());

    if remaining.is_empty() {
        // Crash happened between the last part and completion.
    } else if concurrent && remaining.len() > 1 {
        run_workers(
            engine,
            &source,
            &preupload_id,
            &remaining,
            chunk_size,
            chunk_timeout,
            Arc::clone(&accumulator),
            &mut progress,
            &mut record,
            &mut display,
        )
        .await?;
    } else {
        for part in remaining {
            let offset = (part as u64 - 1) * chunk_size;
            let data = source.read_range(offset, chunk_size as usize).await?;
            let slice_md5 = hash::md5_hex(&data);
            let len = data.len() as u64;
            let started = Instant::now();
            engine
                .client()
                .upload_slice(&preupload_id, part, &slice_md5, data.clone(), chunk_timeout)
                .await?;
            accumulator.lock().unwrap().add_chunk(part, data);
            engine
                .network()
                .record_success(started.elapsed(), len, started.elapsed());
            progress.mark_uploaded(part);
            record.mark_uploaded(part, slice_md5, len);
            engine.persister().save(&progress, &record)?;
            display.tick(file_name, &progress);
        }
    }

    // The transfer-time digest. A resumed session never folded the earlier
    // parts and a buffer-starved fold dropped one, so both re-read the
    // source instead.
    let transfer_md5 = accumulator.lock().unwrap().digest_if_complete(total_parts);
    let final_md5 = match transfer_md5 {
        Some(md5) => md5,
        None => source.md5_hex().await?,
    };
    if !final_md5.eq_ignore_ascii_case(&md5_hex) {
        // The source changed underneath the upload; the session content no
        // longer matches what create announced.
        engine.persister().save(&progress, &record)?;
        return Err(TransferError::SourceChanged {
            declared: md5_hex,
            observed: final_md5,
        });
    }

    let (file_id, server_etag) = match session::finish(engine.client(), &preupload_id).await {
        Ok(done) => done,
        Err(err) => {
            engine.persister().save(&progress, &record)?;
            engine.persister().mark_partial(&preupload_id, file_name);
            return Err(err);
        }
    };
    session::verify_md5(engine.client_arc(), &preupload_id, &final_md5, server_etag).await;
    engine.persister().delete(&preupload_id)?;

    Ok(UploadOutcome {
        file_id,
        size,
        etag: final_md5,
        strategy: strategy.name(),
        reused: false,
    })
}

/// Fixed worker pool over a shared job queue. Results flow through a bounded
/// channel; the first fatal error cancels the pool, persists progress and
/// surfaces.
#[allow(clippy::too_many_arguments)]
async fn run_workers(
    engine: &UploadEngine,
    source: &Arc<RandomAccessSource>,
    preupload_id: &str,
    remaining: &[i64],
    chunk_size: u64,
    chunk_timeout: Duration,
    accumulator: Arc<Mutex<Md5Accumulator>>,
    progress: &mut UploadProgress,
    record: &mut ResumeRecord,
    display: &mut ProgressDisplay,
) -> Result<()> {
    let concurrency = crate::strategy::derive_concurrency(
        source.len(),
        engine.network().estimated_mbps(),
        engine.max_concurrent_uploads(),
    );
    let jobs: Arc<Mutex<VecDeque<i64>>> = Arc::new(Mutex::new(remaining.iter().copied().collect()));
    let (result_tx, mut result_rx) = mpsc::channel::<ChunkOutcome>(concurrency);
    let cancel = Arc::new(AtomicBool::new(false));
    let bytes_done = Arc::new(AtomicU64::new(record.uploaded_bytes));

    let mut pool = WorkerPool(Vec::with_capacity(concurrency));
    for _ in 0..concurrency {
        let worker = Worker {
            client: Arc::clone(engine.client_arc()),
            network: Arc::clone(engine.network_arc()),
            source: Arc::clone(source),
            accumulator: Arc::clone(&accumulator),
            jobs: Arc::clone(&jobs),
            results: result_tx.clone(),
            cancel: Arc::clone(&cancel),
            bytes_done: Arc::clone(&bytes_done),
            preupload_id: preupload_id.to_string(),
            chunk_size,
            chunk_timeout,
        };
        pool.0.push(tokio::spawn(worker.run()));
    }
    // Workers hold the only live senders once this clone is gone.
    drop(result_tx);

    let mut expected = remaining.len();
    while expected > 0 {
        let Some(outcome) = result_rx.recv().await else {
            break;
        };
        expected -= 1;
        match outcome.error {
            None => {
                progress.mark_uploaded(outcome.index);
                record.mark_uploaded(outcome.index, outcome.etag, outcome.size);
                engine.persister().save(progress, record)?;
                engine
                    .network()
                    .record_success(outcome.duration, outcome.size, outcome.duration);
                display.tick(&record.file_name, progress);
            }
            Some(error) => {
                cancel.store(true, Ordering::SeqCst);
                // Let in-flight successes land before reporting.
                while let Some(extra) = result_rx.recv().await {
                    if extra.error.is_none() {
                        progress.mark_uploaded(extra.index);
                        record.mark_uploaded(extra.index, extra.etag, extra.size);
                    }
                }
                engine.persister().save(progress, record)?;
                engine.persister().mark_partial(preupload_id, &record.file_name);
                return Err(error);
            }
        }
    }

    if progress.remaining_parts().is_empty() {
        Ok(())
    } else {
        engine.persister().save(progress, record)?;
        Err(TransferError::UploadIncomplete {
            preupload_id: preupload_id.to_string(),
        })
    }
}

struct Worker {
    client: Arc<Pan123ApiClient>,
    network: Arc<NetworkMonitor>,
    source: Arc<RandomAccessSource>,
    accumulator: Arc<Mutex<Md5Accumulator>>,
    jobs: Arc<Mutex<VecDeque<i64>>>,
    results: mpsc::Sender<ChunkOutcome>,
    cancel: Arc<AtomicBool>,
    bytes_done: Arc<AtomicU64>,
    preupload_id: String,
    chunk_size: u64,
    chunk_timeout: Duration,
}

impl Worker {
    async fn run(self) {
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                return;
            }
            let part = {
                let mut jobs = self.jobs.lock().unwrap();
                jobs.pop_front()
            };
            let Some(part) = part else {
                return;
            };
            let outcome = self.upload_part(part).await;
            let failed = outcome.error.is_some();
            if self.results.send(outcome).await.is_err() {
                return;
            }
            if failed {
                return;
            }
        }
    }

    async fn upload_part(&self, part: i64) -> ChunkOutcome {
        let started = Instant::now();
        let offset = (part as u64 - 1) * self.chunk_size;
        let data = match self.source.read_range(offset, self.chunk_size as usize).await {
            Ok(data) => data,
            Err(error) => {
                return ChunkOutcome {
                    index: part,
                    etag: String::new(),
                    size: 0,
                    duration: started.elapsed(),
                    error: Some(error),
                }
            }
        };
        let slice_md5 = hash::md5_hex(&data);
        let len = data.len() as u64;

        let budget = retry::transfer_attempt_budget(self.bytes_done.load(Ordering::SeqCst));
        let mut attempt = 0u32;
        loop {
            match self.send_part(part, data.clone()).await {
                Ok(()) => {
                    self.bytes_done.fetch_add(len, Ordering::SeqCst);
                    self.accumulator.lock().unwrap().add_chunk(part, data);
                    return ChunkOutcome {
                        index: part,
                        etag: slice_md5,
                        size: len,
                        duration: started.elapsed(),
                        error: None,
                    };
                }
                Err(error) => {
                    attempt += 1;
                    let terminal = error.is_terminal();
                    if terminal || attempt >= budget || self.cancel.load(Ordering::SeqCst) {
                        self.network.record_error();
                        return ChunkOutcome {
                            index: part,
                            etag: String::new(),
                            size: 0,
                            duration: started.elapsed(),
                            error: Some(error.into()),
                        };
                    }
                    self.network.record_retry(started.elapsed());
                    debug!(part, attempt, "slice upload failed, backing off");
                    sleep(retry::backoff_delay(attempt)).await;
                }
            }
        }
    }

    /// One attempt at one part: fresh presigned URL, then the raw PUT.
    async fn send_part(&self, part: i64, data: Bytes) -> pan123_api_client::Result<()> {
        let presigned = self.client.upload_url(&self.preupload_id, part).await?;
        self.client
            .put_presigned(&presigned.presigned_url, data, self.chunk_timeout)
            .await
    }
}
