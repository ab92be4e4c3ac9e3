#![deny(clippy::all)]

//! Persistent caches for the 123Pan driver.
//!
//! One typed key-value store with TTL backs several namespaces, each with its
//! own lifecycle: directory listings, path to ID mappings, parent-ID
//! existence checks, presigned download URLs and upload resume records. A
//! separate in-process memory manager bounds the bytes held in transient
//! buffers.

/// Directory-listing pages keyed by parent and continuation token.
pub mod dir_list;
/// Presigned download URLs plus the access-pattern table scoring hot files.
pub mod download_url;
/// Bounded in-process buffer ledger with least-recently-accessed eviction.
pub mod memory;
/// Path to node-ID mappings and parent-ID existence checks.
pub mod path_map;
/// Multipart upload resume records.
pub mod resume;
/// The typed KV store with TTL that backs every namespace.
pub mod store;

use thiserror::Error;

pub use dir_list::DirListCache;
pub use download_url::DownloadUrlCache;
pub use memory::MemoryManager;
pub use path_map::{ParentIdCache, PathIdCache};
pub use resume::{ResumeRecord, ResumeStore};
pub use store::{KvStore, Namespace};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid cache entry in namespace {namespace}: {error}")]
    InvalidEntry {
        namespace: String,
        #[source]
        error: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Namespace names are part of the on-disk layout; changing one orphans its
/// entries.
pub mod namespaces {
    pub const PARENT_IDS: &str = "parent_ids";
    pub const DIR_LIST: &str = "dir_list";
    pub const DOWNLOAD_URL: &str = "download_url";
    pub const DOWNLOAD_URL_ENHANCED: &str = "download_url_enhanced";
    pub const PATH_TO_ID: &str = "path_to_id";
    pub const RESUME: &str = "resume";
}
