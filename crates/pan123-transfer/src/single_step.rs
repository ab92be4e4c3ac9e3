//! One-shot multipart upload for small files with a known MD5.
//!
//! The whole payload rides in one POST together with its etag, which lets
//! the server dedup without a session. A response without `completed` is not
//! retried here; the engine falls back to the chunked path instead.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::{
    source::RandomAccessSource,
    strategy::{Strategy, BUFFER_CAP, SINGLE_STEP_LIMIT},
    timeout::adaptive_timeout,
    Result, TransferError, UploadEngine, UploadOutcome,
};

const ATTEMPTS: u32 = 3;

pub(crate) async fn run(
    engine: &UploadEngine,
    parent_id: i64,
    file_name: &str,
    source: &RandomAccessSource,
    md5_hex: &str,
    quality: f64,
) -> Result<UploadOutcome> {
    let size = source.len();
    if size >= SINGLE_STEP_LIMIT {
        return Err(TransferError::SingleStepTooLarge { size });
    }
    if size > BUFFER_CAP {
        return Err(TransferError::OversizeBuffer {
            size,
            cap: BUFFER_CAP,
        });
    }

    let data = source.read_range(0, size as usize).await?;
    let timeout = adaptive_timeout(engine.base_timeout(), size, Strategy::SingleStep, quality);

    let mut last_error = None;
    for attempt in 1..=ATTEMPTS {
        match engine
            .client()
            .single_create(parent_id, file_name, md5_hex, data.clone(), timeout)
            .await
        {
            Ok(response) => {
                if !response.completed || response.file_id == 0 {
                    // The server accepted the form but did not finish the
                    // file; the chunked path takes over.
                    warn!(file_name, "single-step response not completed");
                    return Err(TransferError::SingleStepIncomplete);
                }
                debug!(file_name, file_id = response.file_id, "single-step upload done");
                return Ok(UploadOutcome {
                    file_id: response.file_id,
                    size,
                    etag: md5_hex.to_string(),
                    strategy: Strategy::SingleStep.name(),
                    reused: false,
                });
            }
            Err(err) if err.is_terminal() => return Err(err.into()),
            Err(err) => {
                debug!(attempt, ?err, "single-step attempt failed");
                engine.network().record_error();
                last_error = Some(err);
                if attempt < ATTEMPTS {
                    sleep(Duration::from_secs((attempt * attempt) as u64)).await;
                }
            }
        }
    }
    Err(last_error
        .map(TransferError::from)
        .unwrap_or(TransferError::SingleStepIncomplete))
}
