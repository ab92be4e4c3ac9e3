//! Upload strategy selection and multipart parameter derivation.

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

/// Server-side ceiling for the one-shot multipart form.
pub const SINGLE_STEP_LIMIT: u64 = 500 * MIB;
/// In-memory buffer cap for the single-step and concurrent paths.
pub const BUFFER_CAP: u64 = 512 * MIB;

pub const MIN_CHUNK_SIZE: u64 = 50 * MIB;
pub const MAX_CHUNK_SIZE: u64 = 500 * MIB;
const BASE_CHUNK_SIZE: u64 = 100 * MIB;

pub const MAX_UPLOAD_PARTS: i64 = 10_000;
pub const MAX_CONCURRENCY: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    SingleStep,
    Streaming,
    Chunked { concurrent: bool },
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::SingleStep => "single_step",
            Strategy::Streaming => "streaming",
            Strategy::Chunked { concurrent: true } => "chunked_concurrent",
            Strategy::Chunked { concurrent: false } => "chunked",
        }
    }
}

/// First matching rule wins: small files with a known MD5 take the one-shot
/// form (which also triggers server-side dedup), large or poor-network
/// uploads must be resumable, everything else streams.
pub fn select(size: u64, md5_known: bool, quality: f64, user_limit: usize) -> Strategy {
    let concurrent = size > 100 * MIB && user_limit.min(MAX_CONCURRENCY) >= 2;
    if size > 0 && size < SINGLE_STEP_LIMIT && md5_known {
        return Strategy::SingleStep;
    }
    if size > 100 * MIB {
        return Strategy::Chunked { concurrent };
    }
    if size > 50 * MIB && quality < 0.5 {
        return Strategy::Chunked { concurrent };
    }
    Strategy::Streaming
}

/// Chunk size scaled by link speed and file size, clamped to the server's
/// accepted range and to the part-count ceiling.
pub fn derive_chunk_size(size: u64, estimated_mbps: f64) -> u64 {
    let bandwidth_factor = if estimated_mbps < 20.0 {
        0.5
    } else if estimated_mbps < 100.0 {
        1.0
    } else if estimated_mbps < 200.0 {
        2.0
    } else {
        3.0
    };
    let size_factor = if size < 500 * MIB {
        0.5
    } else if size > 50 * GIB {
        1.5
    } else {
        1.0
    };
    let scaled = (BASE_CHUNK_SIZE as f64 * bandwidth_factor * size_factor) as u64;
    let mut chunk = scaled.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
    // A part count over the ceiling forces bigger chunks.
    if size.div_ceil(chunk) > MAX_UPLOAD_PARTS as u64 {
        chunk = size.div_ceil(MAX_UPLOAD_PARTS as u64).clamp(chunk, MAX_CHUNK_SIZE);
    }
    chunk
}

/// Worker count from file size and link speed, clamped to
/// `[1, min(12, user_limit)]`. Two workers minimum for anything over
/// 100 MiB when the user limit permits.
pub fn derive_concurrency(size: u64, estimated_mbps: f64, user_limit: usize) -> usize {
    let ceiling = user_limit.clamp(1, MAX_CONCURRENCY);
    let mut workers = if size > 10 * GIB {
        8
    } else if size > GIB {
        4
    } else if size > 100 * MIB {
        2
    } else {
        1
    };
    if estimated_mbps > 100.0 {
        workers += 2;
    }
    if size > 100 * MIB && ceiling >= 2 {
        workers = workers.max(2);
    }
    workers.clamp(1, ceiling)
}

#[cfg(test)]
mod test {
    use test_case::test_case;

    use super::*;

    #[test_case(MIB, true, 0.9, 4, Strategy::SingleStep ; "small known md5")]
    #[test_case(499 * MIB, true, 0.9, 4, Strategy::SingleStep ; "just under the one shot limit")]
    #[test_case(500 * MIB, true, 0.9, 4, Strategy::Chunked { concurrent: true } ; "at the limit goes chunked")]
    #[test_case(2 * GIB, false, 0.9, 4, Strategy::Chunked { concurrent: true } ; "large unknown md5")]
    #[test_case(2 * GIB, false, 0.9, 1, Strategy::Chunked { concurrent: false } ; "large but single worker")]
    #[test_case(60 * MIB, false, 0.3, 4, Strategy::Chunked { concurrent: false } ; "mid size poor network")]
    #[test_case(60 * MIB, false, 0.9, 4, Strategy::Streaming ; "mid size good network")]
    #[test_case(0, true, 0.9, 4, Strategy::Streaming ; "zero byte file streams")]
    fn selection_table(size: u64, md5: bool, quality: f64, limit: usize, expected: Strategy) {
        assert_eq!(select(size, md5, quality, limit), expected);
    }

    #[test]
    fn chunk_size_scales_with_bandwidth() {
        // Slow link, small file: base halved twice, floored at the minimum.
        assert_eq!(derive_chunk_size(200 * MIB, 5.0), MIN_CHUNK_SIZE);
        // Fast link, huge file: tripled and halved by nothing, capped.
        assert_eq!(derive_chunk_size(60 * GIB, 300.0), 450 * MIB);
        // Mid everything: base size.
        assert_eq!(derive_chunk_size(GIB, 50.0), BASE_CHUNK_SIZE);
    }

    #[test]
    fn chunk_size_respects_part_ceiling() {
        // A petabyte at the minimum chunk would need millions of parts.
        let size = 1024 * 1024 * GIB;
        let chunk = derive_chunk_size(size, 5.0);
        assert!(size.div_ceil(chunk) <= MAX_UPLOAD_PARTS as u64 || chunk == MAX_CHUNK_SIZE);
    }

    #[test_case(50 * MIB, 10.0, 4, 1 ; "small file single worker")]
    #[test_case(200 * MIB, 10.0, 4, 2 ; "forced pair over 100 mib")]
    #[test_case(200 * MIB, 10.0, 1, 1 ; "user limit wins")]
    #[test_case(2 * GIB, 10.0, 8, 4 ; "size scales workers")]
    #[test_case(20 * GIB, 200.0, 100, 10 ; "fast link adds workers")]
    #[test_case(20 * GIB, 200.0, 16, 10 ; "user limit above twelve is capped")]
    fn concurrency_table(size: u64, mbps: f64, limit: usize, expected: usize) {
        assert_eq!(derive_concurrency(size, mbps, limit), expected);
    }
}
