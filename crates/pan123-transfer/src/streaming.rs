//! Two-pass streaming upload for mid-size sources.
//!
//! Pass one computes the MD5 (free for spooled streams); session creation
//! with that MD5 gives the instant-upload short-circuit a chance. Pass two
//! moves the bytes through the multipart slice endpoint, one slice at a
//! time; a file within one slice size is a single POST. Nothing is buffered
//! beyond the slice in flight and no resume state is kept; a failed
//! streaming upload restarts.

use tracing::debug;

use crate::{
    hash,
    session,
    source::RandomAccessSource,
    strategy::{Strategy, MIN_CHUNK_SIZE},
    timeout::adaptive_timeout,
    Result, UploadEngine, UploadOutcome,
};

pub(crate) async fn run(
    engine: &UploadEngine,
    parent_id: i64,
    file_name: &str,
    source: &RandomAccessSource,
    known_md5: Option<String>,
    quality: f64,
) -> Result<UploadOutcome> {
    let size = source.len();
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
            strategy: Strategy::Streaming.name(),
            reused: true,
        });
    }

    let slice_size = if created.slice_size > 0 {
        created.slice_size as u64
    } else {
        MIN_CHUNK_SIZE
    };
    let total_parts = size.div_ceil(slice_size).max(1) as i64;
    let timeout = adaptive_timeout(engine.base_timeout(), size, Strategy::Streaming, quality);
    debug!(file_name, size, slice_size, total_parts, "streaming upload");

    for part in 1..=total_parts {
        let offset = (part as u64 - 1) * slice_size;
        let data = source.read_range(offset, slice_size as usize).await?;
        let slice_md5 = hash::md5_hex(&data);
        let started = std::time::Instant::now();
        let len = data.len() as u64;
        engine
            .client()
            .upload_slice(&created.preupload_id, part, &slice_md5, data, timeout)
            .await?;
        engine
            .network()
            .record_success(started.elapsed(), len, started.elapsed());
    }

    let (file_id, server_etag) = session::finish(engine.client(), &created.preupload_id).await?;
    session::verify_md5(
        engine.client_arc(),
        &created.preupload_id,
        &md5_hex,
        server_etag,
    )
    .await;

    Ok(UploadOutcome {
        file_id,
        size,
        etag: md5_hex,
        strategy: Strategy::Streaming.name(),
        reused: false,
    })
}
