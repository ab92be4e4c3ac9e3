//! Recognised backend options.
//!
//! Everything the enclosing framework can set on this backend, with the
//! defaults and clamps applied in one place so the rest of the driver can
//! trust the values.

use std::time::Duration;

use camino::Utf8PathBuf;
use serde::Deserialize;

use crate::{BackendError, Result};

pub const DEFAULT_LIST_CHUNK: u32 = 100;
pub const MAX_LIST_CHUNK: u32 = 10_000;
pub const MAX_CHUNK_SIZE_OPTION: u64 = 5 * 1024 * 1024 * 1024;
pub const MAX_PARALLELISM: usize = 100;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct Options {
    /// Required credentials.
    pub client_id: String,
    pub client_secret: String,
    /// Remote name this backend instance was configured as; tokens persist
    /// under its original (unaliased) form.
    pub remote_name: String,
    /// Config file tokens are persisted to. Empty disables persistence.
    pub token_file: Option<Utf8PathBuf>,
    /// Management API base URL override, for tests and proxies.
    pub base_url: Option<String>,
    /// Directory for the persistent cache namespaces.
    pub cache_dir: Option<Utf8PathBuf>,
    pub user_agent: Option<String>,
    pub root_folder_id: i64,
    pub list_chunk: u32,
    pub pacer_min_sleep_ms: Option<u64>,
    pub list_pacer_min_sleep_ms: Option<u64>,
    pub strict_pacer_min_sleep_ms: Option<u64>,
    pub upload_pacer_min_sleep_ms: Option<u64>,
    pub download_pacer_min_sleep_ms: Option<u64>,
    pub conn_timeout_secs: u64,
    pub timeout_secs: u64,
    pub chunk_size: Option<u64>,
    pub upload_cutoff: Option<u64>,
    pub max_upload_parts: i64,
    pub max_concurrent_uploads: usize,
    pub max_concurrent_downloads: usize,
    pub progress_update_interval_secs: u64,
    pub enable_progress_display: bool,
    pub debug_level: u8,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            client_id: String::new(),
            client_secret: String::new(),
            remote_name: "123pan".to_string(),
            token_file: None,
            base_url: None,
            cache_dir: None,
            user_agent: None,
            root_folder_id: 0,
            list_chunk: DEFAULT_LIST_CHUNK,
            pacer_min_sleep_ms: None,
            list_pacer_min_sleep_ms: None,
            strict_pacer_min_sleep_ms: None,
            upload_pacer_min_sleep_ms: None,
            download_pacer_min_sleep_ms: None,
            conn_timeout_secs: 10,
            timeout_secs: 60,
            chunk_size: None,
            upload_cutoff: None,
            max_upload_parts: 10_000,
            max_concurrent_uploads: 4,
            max_concurrent_downloads: 8,
            progress_update_interval_secs: 5,
            enable_progress_display: false,
            debug_level: 0,
        }
    }
}

impl Options {
    /// Applies clamps and rejects combinations the driver cannot run with.
    pub fn validated(mut self) -> Result<Self> {
        if self.client_id.is_empty() || self.client_secret.is_empty() {
            return Err(BackendError::MissingCredentials);
        }
        self.list_chunk = self.list_chunk.clamp(1, MAX_LIST_CHUNK);
        self.max_upload_parts = self.max_upload_parts.clamp(1, 10_000);
        self.max_concurrent_uploads = self.max_concurrent_uploads.clamp(1, MAX_PARALLELISM);
        self.max_concurrent_downloads = self.max_concurrent_downloads.clamp(1, MAX_PARALLELISM);
        self.debug_level = self.debug_level.min(4);
        if let Some(chunk) = self.chunk_size {
            if chunk > MAX_CHUNK_SIZE_OPTION {
                return Err(BackendError::InvalidOption {
                    option: "chunk_size",
                    reason: format!("{chunk} exceeds the 5 GiB ceiling"),
                });
            }
        }
        Ok(self)
    }

    /// The base pacer sleep applies to any class without its own override.
    pub fn pacer_config(&self) -> pan123_api_client::PacerConfig {
        let defaults = pan123_api_client::PacerConfig::default();
        let base = self.pacer_min_sleep_ms.map(Duration::from_millis);
        let pick = |specific: Option<u64>, fallback: Duration| {
            specific
                .map(Duration::from_millis)
                .or(base)
                .unwrap_or(fallback)
        };
        pan123_api_client::PacerConfig {
            list_min_sleep: pick(self.list_pacer_min_sleep_ms, defaults.list_min_sleep),
            strict_min_sleep: pick(self.strict_pacer_min_sleep_ms, defaults.strict_min_sleep),
            upload_min_sleep: pick(self.upload_pacer_min_sleep_ms, defaults.upload_min_sleep),
            download_min_sleep: pick(self.download_pacer_min_sleep_ms, defaults.download_min_sleep),
        }
    }

    pub fn conn_timeout(&self) -> Duration {
        Duration::from_secs(self.conn_timeout_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn with_credentials() -> Options {
        Options {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            ..Options::default()
        }
    }

    #[test]
    fn credentials_are_required() {
        assert!(matches!(
            Options::default().validated(),
            Err(BackendError::MissingCredentials)
        ));
        assert!(with_credentials().validated().is_ok());
    }

    #[test]
    fn clamps_apply() {
        let options = Options {
            list_chunk: 999_999,
            max_concurrent_uploads: 0,
            max_concurrent_downloads: 500,
            debug_level: 9,
            ..with_credentials()
        }
        .validated()
        .unwrap();
        assert_eq!(options.list_chunk, MAX_LIST_CHUNK);
        assert_eq!(options.max_concurrent_uploads, 1);
        assert_eq!(options.max_concurrent_downloads, MAX_PARALLELISM);
        assert_eq!(options.debug_level, 4);
    }

    #[test]
    fn oversize_chunk_option_is_rejected() {
        let result = Options {
            chunk_size: Some(MAX_CHUNK_SIZE_OPTION + 1),
            ..with_credentials()
        }
        .validated();
        assert!(matches!(result, Err(BackendError::InvalidOption { .. })));
    }

    #[test]
    fn pacer_overrides_cascade() {
        let options = Options {
            pacer_min_sleep_ms: Some(40),
            upload_pacer_min_sleep_ms: Some(300),
            ..with_credentials()
        };
        let pacers = options.pacer_config();
        // Class-specific override wins, base covers the rest.
        assert_eq!(pacers.upload_min_sleep, Duration::from_millis(300));
        assert_eq!(pacers.list_min_sleep, Duration::from_millis(40));
        assert_eq!(pacers.strict_min_sleep, Duration::from_millis(40));
    }
}
