use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    SerdeError(#[from] serde_json::Error),
    #[error(transparent)]
    ApiError(#[from] pan123_api_client::Error),
    #[error("token expiry '{value}' is not a valid RFC 3339 timestamp")]
    InvalidExpiry { value: String },
    #[error("failed to write token file {path}: {error}")]
    FailedToWriteTokenFile {
        path: camino::Utf8PathBuf,
        #[source]
        error: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
