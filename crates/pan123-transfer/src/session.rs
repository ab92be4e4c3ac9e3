//! Shared upload-session plumbing: creation with the instant-upload
//! short-circuit, completion with bounded async polling, and post-complete
//! MD5 verification.

use std::{sync::Arc, time::Duration};

use pan123_api::{UploadCreateData, UploadCreateRequest};
use pan123_api_client::Pan123ApiClient;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::{Result, TransferError};

/// Keep-both duplicate handling; the server appends a suffix on conflict.
const DUPLICATE_KEEP_BOTH: i64 = 1;

/// Bounded schedule for `upload_async_result` polling: roughly five minutes
/// across thirty attempts.
const ASYNC_POLL_ATTEMPTS: u32 = 30;

/// Post-complete etag verification budget.
const VERIFY_ATTEMPTS: u32 = 10;

pub(crate) fn async_poll_delay(attempt: u32) -> Duration {
    let secs = match attempt {
        0..=5 => attempt.max(1) as u64,
        6..=10 => 5,
        later => (10 + (later as u64 - 11)).min(15),
    };
    Duration::from_secs(secs)
}

/// Opens an upload session. `reuse == true` means the server already holds
/// content with this `(size, md5)` and the returned file ID is final.
pub(crate) async fn create(
    client: &Pan123ApiClient,
    parent_id: i64,
    file_name: &str,
    size: u64,
    md5_hex: &str,
) -> Result<UploadCreateData> {
    let created = client
        .upload_create(&UploadCreateRequest {
            parent_file_id: parent_id,
            filename: file_name.to_string(),
            etag: md5_hex.to_string(),
            size: size as i64,
            duplicate: DUPLICATE_KEEP_BOTH,
        })
        .await?;
    if created.reuse {
        debug!(file_name, file_id = created.file_id, "instant upload hit");
    }
    Ok(created)
}

/// Finishes a session. A synchronous completion returns at once; an async one
/// is polled on the bounded schedule until the server reports the assembled
/// file. Returns the file ID and the server-side etag when reported.
pub(crate) async fn finish(
    client: &Pan123ApiClient,
    preupload_id: &str,
) -> Result<(i64, Option<String>)> {
    let completed = client.upload_complete(preupload_id).await?;
    if completed.completed && completed.file_id != 0 {
        return Ok((completed.file_id, None));
    }
    if !completed.is_async {
        return Err(TransferError::UploadIncomplete {
            preupload_id: preupload_id.to_string(),
        });
    }

    for attempt in 1..=ASYNC_POLL_ATTEMPTS {
        sleep(async_poll_delay(attempt)).await;
        let result = client.upload_async_result(preupload_id).await?;
        if result.completed {
            return Ok((result.file_id, result.etag));
        }
        debug!(preupload_id, attempt, "assembly still pending");
    }
    Err(TransferError::AsyncCompletionTimeout {
        preupload_id: preupload_id.to_string(),
    })
}

/// Compares the caller's MD5 with the server's etag. The server's bytes are
/// authoritative, so a mismatch is surfaced as a warning, never a failure.
pub(crate) async fn verify_md5(
    client: &Arc<Pan123ApiClient>,
    preupload_id: &str,
    expected_md5: &str,
    mut server_etag: Option<String>,
) {
    for attempt in 1..=VERIFY_ATTEMPTS {
        if let Some(etag) = server_etag.as_deref() {
            if etag.eq_ignore_ascii_case(expected_md5) {
                debug!(preupload_id, "server etag matches local MD5");
            } else {
                warn!(
                    preupload_id,
                    expected_md5, server_etag = etag,
                    "server etag differs from local MD5; remote bytes are authoritative"
                );
            }
            return;
        }
        sleep(Duration::from_secs(attempt as u64)).await;
        match client.upload_async_result(preupload_id).await {
            Ok(result) => server_etag = result.etag,
            Err(err) => {
                debug!(preupload_id, ?err, "etag verification poll failed");
                return;
            }
        }
    }
    debug!(preupload_id, "server never reported an etag to verify against");
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn poll_schedule_ramps_then_flattens() {
        assert_eq!(async_poll_delay(1), Duration::from_secs(1));
        assert_eq!(async_poll_delay(5), Duration::from_secs(5));
        assert_eq!(async_poll_delay(6), Duration::from_secs(5));
        assert_eq!(async_poll_delay(10), Duration::from_secs(5));
        assert_eq!(async_poll_delay(11), Duration::from_secs(10));
        assert_eq!(async_poll_delay(14), Duration::from_secs(13));
        assert_eq!(async_poll_delay(30), Duration::from_secs(15));
    }

    #[test]
    fn poll_schedule_is_bounded_near_five_minutes() {
        let total: Duration = (1..=ASYNC_POLL_ATTEMPTS).map(async_poll_delay).sum();
        assert!(total <= Duration::from_secs(6 * 60));
        assert!(total >= Duration::from_secs(4 * 60));
    }
}
