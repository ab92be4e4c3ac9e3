//! Per-endpoint version preference with failure-driven fallback.
//!
//! A handful of endpoints exist in both a v2 and a v1 shape. The newer shape
//! is preferred; when it fails with a retry-worthy error the older one is
//! tried, and whichever shape succeeds becomes the preference for the rest of
//! the process lifetime.

use std::{collections::HashMap, sync::Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Primary,
    Fallback,
}

impl Slot {
    pub fn other(self) -> Slot {
        match self {
            Slot::Primary => Slot::Fallback,
            Slot::Fallback => Slot::Primary,
        }
    }
}

/// Logical operations with two wire shapes, keyed by a stable name.
#[derive(Debug, Clone, Copy)]
pub struct DualEndpoint {
    pub op: &'static str,
    pub primary: &'static str,
    pub fallback: &'static str,
}

pub const FILE_LIST: DualEndpoint = DualEndpoint {
    op: "file_list",
    primary: "/api/v2/file/list",
    fallback: "/api/v1/file/list",
};

pub const FILE_DETAIL: DualEndpoint = DualEndpoint {
    op: "file_detail",
    primary: "/api/v1/file/detail",
    fallback: "/api/v1/file/info",
};

pub const UPLOAD_CREATE: DualEndpoint = DualEndpoint {
    op: "upload_create",
    primary: "/upload/v2/file/create",
    fallback: "/upload/v1/file/create",
};

pub const UPLOAD_URL: DualEndpoint = DualEndpoint {
    op: "upload_url",
    primary: "/upload/v2/file/get_upload_url",
    fallback: "/upload/v1/file/get_upload_url",
};

#[derive(Debug, Default)]
pub struct VersionTable {
    prefs: Mutex<HashMap<&'static str, Slot>>,
}

impl VersionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The currently preferred path for an operation.
    pub fn preferred(&self, endpoint: &DualEndpoint) -> (Slot, &'static str) {
        let prefs = self.prefs.lock().unwrap();
        let slot = prefs.get(endpoint.op).copied().unwrap_or(Slot::Primary);
        (slot, Self::path(endpoint, slot))
    }

    /// Records that `slot` failed for this operation and returns the
    /// alternate to try.
    pub fn mark_failed(&self, endpoint: &DualEndpoint, slot: Slot) -> (Slot, &'static str) {
        let other = slot.other();
        tracing::debug!(
            op = endpoint.op,
            failed = Self::path(endpoint, slot),
            trying = Self::path(endpoint, other),
            "endpoint shape failed, falling back"
        );
        (other, Self::path(endpoint, other))
    }

    /// Pins the shape that succeeded so later calls go straight to it.
    pub fn confirm(&self, endpoint: &DualEndpoint, slot: Slot) {
        let mut prefs = self.prefs.lock().unwrap();
        prefs.insert(endpoint.op, slot);
    }

    fn path(endpoint: &DualEndpoint, slot: Slot) -> &'static str {
        match slot {
            Slot::Primary => endpoint.primary,
            Slot::Fallback => endpoint.fallback,
        }
    }
}
