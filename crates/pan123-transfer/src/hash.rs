//! Streaming MD5 accumulation for out-of-order chunk uploads.
//!
//! MD5 folds bytes in order, but the concurrent uploader finishes chunks in
//! whatever order the network allows. Completed chunks whose turn has not
//! come are parked; whenever the contiguous prefix grows, the parked buffers
//! are folded and released. If parked bytes would exceed the budget the
//! farthest-ahead buffer is dropped and the final digest is recomputed later
//! by re-reading the source.

use std::collections::BTreeMap;

use bytes::Bytes;
use md5::{Digest, Md5};

/// Default ceiling for parked out-of-order buffers.
pub const DEFAULT_PENDING_BUDGET: u64 = 128 * 1024 * 1024;

pub struct Md5Accumulator {
    hasher: Md5,
    /// Next 1-based chunk index the rolling hash is waiting for.
    next_index: i64,
    pending: BTreeMap<i64, Bytes>,
    pending_bytes: u64,
    pending_budget: u64,
    /// Set once any buffer was dropped; the rolling digest is then unusable.
    lost: bool,
}

/// MD5 of one buffer as lowercase hex.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

impl Md5Accumulator {
    pub fn new(pending_budget: u64) -> Self {
        Md5Accumulator {
            hasher: Md5::new(),
            next_index: 1,
            pending: BTreeMap::new(),
            pending_bytes: 0,
            pending_budget,
            lost: false,
        }
    }

    /// Hands over a completed chunk. Folds it immediately when it extends the
    /// prefix, parks it otherwise.
    pub fn add_chunk(&mut self, index: i64, data: Bytes) {
        if self.lost {
            return;
        }
        if index == self.next_index {
            self.hasher.update(&data);
            self.next_index += 1;
            self.drain_prefix();
            return;
        }
        if index < self.next_index {
            // Re-upload of an already folded chunk; the digest saw it.
            return;
        }
        self.pending_bytes += data.len() as u64;
        self.pending.insert(index, data);
        while self.pending_bytes > self.pending_budget {
            // Dropping the farthest-ahead buffer loses the least ordering
            // progress, but any drop breaks the rolling digest.
            let Some((&last, _)) = self.pending.iter().next_back() else {
                break;
            };
            if let Some(dropped) = self.pending.remove(&last) {
                self.pending_bytes -= dropped.len() as u64;
            }
            self.lost = true;
        }
        if self.lost {
            self.pending.clear();
            self.pending_bytes = 0;
        }
    }

    fn drain_prefix(&mut self) {
        while let Some(data) = self.pending.remove(&self.next_index) {
            self.pending_bytes -= data.len() as u64;
            self.hasher.update(&data);
            self.next_index += 1;
        }
    }

    /// Chunks folded so far form the prefix `1..next_index`.
    pub fn folded_through(&self) -> i64 {
        self.next_index - 1
    }

    /// The file digest, if every chunk up to `total` was folded in order.
    /// `None` means a second pass over the source is required.
    pub fn digest_if_complete(&self, total: i64) -> Option<String> {
        if self.lost || self.folded_through() != total {
            return None;
        }
        Some(hex::encode(self.hasher.clone().finalize()))
    }
}
