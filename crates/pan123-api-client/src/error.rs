use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Error making HTTP request: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("skipping HTTP Request, too many failures have occurred.\nLast error: {0}")]
    TooManyFailures(#[source] Box<Error>),
    #[error("Unable to set up TLS.")]
    TlsError(#[source] reqwest::Error),
    #[error("Error parsing URL: {url}: {err}")]
    InvalidUrl {
        url: String,
        #[source]
        err: url::ParseError,
    },
    #[error("unable to parse '{text}' as JSON: {err}")]
    InvalidJson {
        #[source]
        err: serde_json::Error,
        text: String,
    },
    #[error("invalid client credentials")]
    InvalidCredentials,
    #[error("unauthorized: token rejected after refresh")]
    Unauthorized,
    #[error("permission denied: {message}")]
    PermissionDenied { message: String },
    #[error("storage quota exceeded")]
    QuotaExceeded,
    #[error("not found: {message}")]
    NotFound { message: String },
    #[error("bad request: {message}")]
    BadRequest { message: String },
    #[error("{method} {endpoint} failed with code {code}: {message}{}", trace_suffix(.trace_id))]
    ApiError {
        method: String,
        endpoint: String,
        code: i64,
        message: String,
        trace_id: Option<String>,
    },
    #[error("response envelope is missing its data field: {endpoint}")]
    MissingData { endpoint: String },
    #[error("no token source configured for authenticated call to {endpoint}")]
    NoTokenSource { endpoint: String },
    #[error("upload host list is empty")]
    NoUploadDomain,
}

fn trace_suffix(trace_id: &Option<String>) -> String {
    match trace_id {
        Some(id) => format!(" (trace {id})"),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Terminal errors are surfaced immediately; everything else may be
    /// retried by the dispatch loop.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::InvalidCredentials
                | Error::Unauthorized
                | Error::PermissionDenied { .. }
                | Error::QuotaExceeded
                | Error::NotFound { .. }
                | Error::BadRequest { .. }
        )
    }
}
