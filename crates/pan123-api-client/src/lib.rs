#![deny(clippy::all)]

//! Authenticated JSON client for the 123Pan open platform.
//!
//! Every call goes through one dispatch loop that acquires the pacer for the
//! endpoint's class, attaches the bearer token, retries transient failures
//! with exponential backoff, forces a single token refresh on 401, and parses
//! the `{code, message, data}` envelope. Endpoints with two wire shapes fall
//! back from the newer shape to the older one on failure.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{
    multipart::{Form, Part},
    Method, StatusCode,
};
use serde::de::DeserializeOwned;
use tokio::time::sleep;
use tracing::{debug, warn};

use pan123_api::{
    codes, ApiEnvelope, DeleteRequest, DownloadInfoData, FileDetailData, FileInfosData,
    FileInfosRequest, FileListData, ListUploadPartsData, ListUploadPartsRequest, MkdirData,
    MkdirRequest, MoveRequest, RenameRequest, SingleUploadData, TokenData, TokenRequest,
    TrashRequest, UploadAsyncResultData, UploadAsyncResultRequest, UploadCompleteData,
    UploadCompleteRequest, UploadCreateData, UploadCreateRequest, UploadUrlData, UploadUrlRequest,
    UserInfoData,
};

mod error;
pub mod pacer;
pub mod retry;
pub mod version;

pub use error::{Error, Result};
pub use pacer::{PacerConfig, PacerKind, PacerSet};
pub use reqwest::Response;

pub const OPEN_API_BASE: &str = "https://open-api.123pan.com";

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                                  (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Where bearer tokens come from. The auth crate implements this; tests use
/// in-memory fakes.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// A token valid at the time of the call.
    async fn current_token(&self) -> Result<String>;
    /// Discard the cached token and obtain a fresh one. Called at most once
    /// per dispatch when the server answers 401.
    async fn refresh_token(&self) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub base_url: String,
    pub user_agent: String,
    pub connect_timeout: Duration,
    pub timeout: Duration,
    pub pacers: PacerConfig,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            base_url: OPEN_API_BASE.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            connect_timeout: Duration::from_secs(10),
            timeout: Duration::from_secs(60),
            pacers: PacerConfig::default(),
        }
    }
}

pub struct Pan123ApiClient {
    client: reqwest::Client,
    base_url: String,
    user_agent: String,
    timeout: Duration,
    pacers: PacerSet,
    versions: version::VersionTable,
    token_source: std::sync::RwLock<Option<Arc<dyn TokenSource>>>,
    upload_domain: tokio::sync::RwLock<Option<String>>,
}

enum Payload {
    None,
    Json(serde_json::Value),
}

/// Request bodies are plain derived structs; converting them to a Value
/// cannot fail.
fn json<T: serde::Serialize>(value: &T) -> Payload {
    Payload::Json(serde_json::to_value(value).expect("request types serialize to JSON"))
}

impl Pan123ApiClient {
    pub fn new(options: ClientOptions) -> Result<Self> {
        url::Url::parse(&options.base_url).map_err(|err| Error::InvalidUrl {
            url: options.base_url.clone(),
            err,
        })?;
        let client = reqwest::Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(Error::TlsError)?;

        Ok(Pan123ApiClient {
            client,
            base_url: options.base_url,
            user_agent: options.user_agent,
            timeout: options.timeout,
            pacers: PacerSet::new(options.pacers),
            versions: version::VersionTable::new(),
            token_source: std::sync::RwLock::new(None),
            upload_domain: tokio::sync::RwLock::new(None),
        })
    }

    pub fn set_token_source(&self, source: Arc<dyn TokenSource>) {
        *self.token_source.write().unwrap() = Some(source);
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn token_source(&self, endpoint: &str) -> Result<Arc<dyn TokenSource>> {
        self.token_source
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::NoTokenSource {
                endpoint: endpoint.to_string(),
            })
    }

    /// One paced, retried, envelope-parsed call. `base` lets upload endpoints
    /// target the dynamically discovered upload host.
    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        base: &str,
        path: &str,
        query: &[(&str, String)],
        payload: &Payload,
        authenticated: bool,
        timeout: Option<Duration>,
    ) -> Result<Option<T>> {
        let pacer = self.pacers.for_path(path);
        let url = format!("{base}{path}");
        let timeout = timeout.unwrap_or(self.timeout);
        let mut refreshed = false;
        let mut attempt = 0u32;

        loop {
            pacer.acquire().await;

            let mut request = self
                .client
                .request(method.clone(), &url)
                .timeout(timeout)
                .header("User-Agent", self.user_agent.clone())
                .header("Platform", "open_platform");
            if !query.is_empty() {
                request = request.query(query);
            }
            if authenticated {
                let token = self.token_source(path)?.current_token().await?;
                request = request.header("Authorization", format!("Bearer {token}"));
            }
            if let Payload::Json(body) = payload {
                // Bodies are buffered JSON so a retry or a version fallback
                // can resend them without a rewindable stream.
                request = request
                    .header("Content-Type", "application/json")
                    .body(serde_json::to_string(body).expect("serializable body"));
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    if retry::should_retry_transport(&err) && attempt + 1 < retry::RETRY_MAX {
                        let delay = retry::backoff_delay(attempt);
                        debug!(?err, ?delay, attempt, "transport failure, backing off");
                        sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(if attempt > 0 {
                        Error::TooManyFailures(Box::new(err.into()))
                    } else {
                        err.into()
                    });
                }
            };

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED {
                if authenticated && !refreshed {
                    debug!(path, "HTTP 401, forcing token refresh");
                    self.token_source(path)?.refresh_token().await?;
                    refreshed = true;
                    continue;
                }
                return Err(Error::Unauthorized);
            }
            if status == StatusCode::TOO_MANY_REQUESTS {
                warn!(path, "HTTP 429, backing off via pacer");
                pacer.on_throttle().await;
                attempt += 1;
                if attempt >= retry::RETRY_MAX {
                    return Err(Error::ApiError {
                        method: method.to_string(),
                        endpoint: path.to_string(),
                        code: codes::THROTTLED,
                        message: "rate limited".to_string(),
                        trace_id: None,
                    });
                }
                continue;
            }
            if retry::should_retry_status(status) {
                attempt += 1;
                if attempt >= retry::RETRY_MAX {
                    return Err(Error::ApiError {
                        method: method.to_string(),
                        endpoint: path.to_string(),
                        code: status.as_u16() as i64,
                        message: "server error".to_string(),
                        trace_id: None,
                    });
                }
                let delay = retry::backoff_delay(attempt);
                debug!(%status, ?delay, "server fault, backing off");
                sleep(delay).await;
                continue;
            }
            if status == StatusCode::FORBIDDEN {
                return Err(Error::PermissionDenied {
                    message: response.text().await.unwrap_or_default(),
                });
            }
            if status == StatusCode::NOT_FOUND {
                return Err(Error::NotFound {
                    message: url.clone(),
                });
            }
            if status == StatusCode::BAD_REQUEST {
                return Err(Error::BadRequest {
                    message: response.text().await.unwrap_or_default(),
                });
            }

            let text = response.text().await?;
            let envelope: ApiEnvelope<T> =
                serde_json::from_str(&text).map_err(|err| Error::InvalidJson { err, text })?;

            match envelope.code {
                codes::OK => {
                    pacer.on_success().await;
                    return Ok(envelope.data);
                }
                codes::UNAUTHORIZED => {
                    if authenticated && !refreshed {
                        debug!(path, "envelope code 401, forcing token refresh");
                        self.token_source(path)?.refresh_token().await?;
                        refreshed = true;
                        continue;
                    }
                    return Err(Error::Unauthorized);
                }
                code if Self::is_throttle(code, &envelope.message) => {
                    warn!(path, code, "throttle code, backing off via pacer");
                    pacer.on_throttle().await;
                    attempt += 1;
                    if attempt >= retry::RETRY_MAX {
                        return Err(Error::ApiError {
                            method: method.to_string(),
                            endpoint: path.to_string(),
                            code,
                            message: envelope.message,
                            trace_id: envelope.trace_id,
                        });
                    }
                    continue;
                }
                codes::FILE_NOT_FOUND => {
                    return Err(Error::NotFound {
                        message: envelope.message,
                    });
                }
                _ if Self::is_quota_exhausted(&envelope.message) => {
                    return Err(Error::QuotaExceeded);
                }
                code => {
                    return Err(Error::ApiError {
                        method: method.to_string(),
                        endpoint: path.to_string(),
                        code,
                        message: envelope.message,
                        trace_id: envelope.trace_id,
                    });
                }
            }
        }
    }

    fn is_throttle(code: i64, message: &str) -> bool {
        code == codes::THROTTLED || code == codes::THROTTLED_UPLOAD || message.contains("频率")
    }

    /// The service reports quota exhaustion through its message text, not a
    /// stable code.
    fn is_quota_exhausted(message: &str) -> bool {
        message.contains("容量不足") || message.contains("空间不足") || message.contains("quota")
    }

    async fn call_required<T: DeserializeOwned>(
        &self,
        method: Method,
        base: &str,
        path: &str,
        query: &[(&str, String)],
        payload: &Payload,
        timeout: Option<Duration>,
    ) -> Result<T> {
        self.call(method, base, path, query, payload, true, timeout)
            .await?
            .ok_or_else(|| Error::MissingData {
                endpoint: path.to_string(),
            })
    }

    /// Runs a dual-shape operation against the preferred shape, falling back
    /// to the alternate on non-terminal failure and pinning whichever shape
    /// succeeded.
    async fn call_dual<T: DeserializeOwned>(
        &self,
        endpoint: &version::DualEndpoint,
        method: Method,
        base: &str,
        query: &[(&str, String)],
        payload: &Payload,
    ) -> Result<T> {
        let (slot, path) = self.versions.preferred(endpoint);
        match self
            .call_required::<T>(method.clone(), base, path, query, payload, None)
            .await
        {
            Ok(data) => {
                self.versions.confirm(endpoint, slot);
                Ok(data)
            }
            Err(err) if err.is_terminal() => Err(err),
            Err(err) => {
                let (other, other_path) = self.versions.mark_failed(endpoint, slot);
                debug!(op = endpoint.op, ?err, "primary shape failed");
                let data = self
                    .call_required::<T>(method, base, other_path, query, payload, None)
                    .await?;
                self.versions.confirm(endpoint, other);
                Ok(data)
            }
        }
    }

    // Credential exchange. Unauthenticated, paced with the auxiliary class.
    pub async fn exchange_credentials(
        &self,
        client_id: &str,
        client_secret: &str,
    ) -> Result<TokenData> {
        let body = json(&TokenRequest {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        });
        let data = self
            .call::<TokenData>(
                Method::POST,
                &self.base_url,
                "/api/v1/access_token",
                &[],
                &body,
                false,
                None,
            )
            .await
            .map_err(|err| match err {
                Error::Unauthorized | Error::PermissionDenied { .. } => Error::InvalidCredentials,
                other => other,
            })?;
        data.ok_or_else(|| Error::MissingData {
            endpoint: "/api/v1/access_token".to_string(),
        })
    }

    /// One page of a directory listing. The continuation token is the last
    /// file ID of the previous page; `-1` from the server terminates paging.
    pub async fn file_list_page(
        &self,
        parent_id: i64,
        limit: u32,
        last_file_id: Option<i64>,
    ) -> Result<FileListData> {
        let mut query = vec![
            ("parentFileId", parent_id.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(id) = last_file_id {
            query.push(("lastFileId", id.to_string()));
        }
        self.call_dual(
            &version::FILE_LIST,
            Method::GET,
            &self.base_url,
            &query,
            &Payload::None,
        )
        .await
    }

    pub async fn file_detail(&self, file_id: i64) -> Result<FileDetailData> {
        let query = vec![("fileID", file_id.to_string())];
        self.call_dual(
            &version::FILE_DETAIL,
            Method::GET,
            &self.base_url,
            &query,
            &Payload::None,
        )
        .await
    }

    pub async fn file_infos(&self, file_ids: Vec<i64>) -> Result<FileInfosData> {
        let body = json(&FileInfosRequest { file_ids });
        self.call_required(
            Method::POST,
            &self.base_url,
            "/api/v1/file/infos",
            &[],
            &body,
            None,
        )
        .await
    }

    pub async fn user_info(&self) -> Result<UserInfoData> {
        self.call_required(
            Method::GET,
            &self.base_url,
            "/api/v1/user/info",
            &[],
            &Payload::None,
            None,
        )
        .await
    }

    pub async fn mkdir(&self, parent_id: i64, name: &str) -> Result<MkdirData> {
        let body = json(&MkdirRequest {
            name: name.to_string(),
            parent_id,
        });
        self.call_required(
            Method::POST,
            &self.base_url,
            "/upload/v1/file/mkdir",
            &[],
            &body,
            None,
        )
        .await
    }

    pub async fn move_files(&self, file_ids: Vec<i64>, to_parent: i64) -> Result<()> {
        let body = json(&MoveRequest {
            file_ids,
            to_parent_file_id: to_parent,
        });
        self.call::<serde_json::Value>(
            Method::POST,
            &self.base_url,
            "/api/v1/file/move",
            &[],
            &body,
            true,
            None,
        )
        .await?;
        Ok(())
    }

    pub async fn rename(&self, file_id: i64, file_name: &str) -> Result<()> {
        let body = json(&RenameRequest {
            file_id,
            file_name: file_name.to_string(),
        });
        self.call::<serde_json::Value>(
            Method::PUT,
            &self.base_url,
            "/api/v1/file/name",
            &[],
            &body,
            true,
            None,
        )
        .await?;
        Ok(())
    }

    pub async fn trash(&self, file_ids: Vec<i64>) -> Result<()> {
        let body = json(&TrashRequest { file_ids });
        self.call::<serde_json::Value>(
            Method::POST,
            &self.base_url,
            "/api/v1/file/trash",
            &[],
            &body,
            true,
            None,
        )
        .await?;
        Ok(())
    }

    /// Permanent delete. The server only accepts this for files already in
    /// the trash.
    pub async fn delete_permanently(&self, file_ids: Vec<i64>) -> Result<()> {
        let body = json(&DeleteRequest { file_ids });
        self.call::<serde_json::Value>(
            Method::POST,
            &self.base_url,
            "/api/v1/file/delete",
            &[],
            &body,
            true,
            None,
        )
        .await?;
        Ok(())
    }

    /// Presigned download URL for a file. `user_agent_override` lets a caller
    /// fetch a URL bound to a different UA.
    pub async fn download_info(
        &self,
        file_id: i64,
        user_agent_override: Option<&str>,
    ) -> Result<DownloadInfoData> {
        let path = "/api/v1/file/download_info";
        let query = vec![("fileId", file_id.to_string())];
        match user_agent_override {
            None => {
                self.call_required(
                    Method::GET,
                    &self.base_url,
                    path,
                    &query,
                    &Payload::None,
                    None,
                )
                .await
            }
            Some(ua) => {
                // A one-off client call with the caller's UA; pacing and
                // envelope handling still apply.
                let pacer = self.pacers.for_path(path);
                pacer.acquire().await;
                let token = self.token_source(path)?.current_token().await?;
                let response = self
                    .client
                    .get(format!("{}{path}", self.base_url))
                    .timeout(self.timeout)
                    .query(&query)
                    .header("User-Agent", ua)
                    .header("Platform", "open_platform")
                    .header("Authorization", format!("Bearer {token}"))
                    .send()
                    .await?;
                let text = response.text().await?;
                let envelope: ApiEnvelope<DownloadInfoData> = serde_json::from_str(&text)
                    .map_err(|err| Error::InvalidJson { err, text })?;
                if !envelope.is_success() {
                    return Err(Error::ApiError {
                        method: "GET".to_string(),
                        endpoint: path.to_string(),
                        code: envelope.code,
                        message: envelope.message,
                        trace_id: envelope.trace_id,
                    });
                }
                pacer.on_success().await;
                envelope.data.ok_or_else(|| Error::MissingData {
                    endpoint: path.to_string(),
                })
            }
        }
    }

    /// The dynamically discovered upload host, cached per client.
    pub async fn upload_domain(&self) -> Result<String> {
        {
            let cached = self.upload_domain.read().await;
            if let Some(domain) = cached.as_ref() {
                return Ok(domain.clone());
            }
        }
        let domains: Vec<String> = self
            .call_required(
                Method::GET,
                &self.base_url,
                "/upload/v2/file/domain",
                &[],
                &Payload::None,
                None,
            )
            .await?;
        let domain = domains.into_iter().next().ok_or(Error::NoUploadDomain)?;
        debug!(domain, "discovered upload host");
        *self.upload_domain.write().await = Some(domain.clone());
        Ok(domain)
    }

    /// Opens an upload session. A `reuse == true` response means the server
    /// already holds the content and the returned file ID is final.
    pub async fn upload_create(&self, request: &UploadCreateRequest) -> Result<UploadCreateData> {
        let body = json(request);
        let domain = self.upload_domain().await?;
        self.call_dual(
            &version::UPLOAD_CREATE,
            Method::POST,
            &domain,
            &[],
            &body,
        )
        .await
    }

    /// Presigned URL for one slice. Part numbers are 1-based.
    pub async fn upload_url(&self, preupload_id: &str, slice_no: i64) -> Result<UploadUrlData> {
        let body = json(&UploadUrlRequest {
            preupload_id: preupload_id.to_string(),
            slice_no,
        });
        let domain = self.upload_domain().await?;
        self.call_dual(
            &version::UPLOAD_URL,
            Method::POST,
            &domain,
            &[],
            &body,
        )
        .await
    }

    /// Uploads one slice through the multipart endpoint. The slice MD5 lets
    /// the server verify the part on receipt.
    pub async fn upload_slice(
        &self,
        preupload_id: &str,
        slice_no: i64,
        slice_md5: &str,
        data: Bytes,
        timeout: Duration,
    ) -> Result<()> {
        let path = "/upload/v2/file/slice";
        let domain = self.upload_domain().await?;
        let pacer = self.pacers.for_path(path);
        pacer.acquire().await;

        let token = self.token_source(path)?.current_token().await?;
        let form = Form::new()
            .text("preuploadID", preupload_id.to_string())
            .text("sliceNo", slice_no.to_string())
            .text("sliceMD5", slice_md5.to_string())
            .part("slice", Part::stream(data));

        let response = self
            .client
            .post(format!("{domain}{path}"))
            .timeout(timeout)
            .header("User-Agent", self.user_agent.clone())
            .header("Platform", "open_platform")
            .header("Authorization", format!("Bearer {token}"))
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            pacer.on_throttle().await;
            return Err(Error::ApiError {
                method: "POST".to_string(),
                endpoint: path.to_string(),
                code: codes::THROTTLED,
                message: "rate limited".to_string(),
                trace_id: None,
            });
        }
        let text = response.text().await?;
        let envelope: ApiEnvelope<serde_json::Value> =
            serde_json::from_str(&text).map_err(|err| Error::InvalidJson { err, text })?;
        if !envelope.is_success() {
            if Self::is_throttle(envelope.code, &envelope.message) {
                pacer.on_throttle().await;
            }
            return Err(Error::ApiError {
                method: "POST".to_string(),
                endpoint: path.to_string(),
                code: envelope.code,
                message: envelope.message,
                trace_id: envelope.trace_id,
            });
        }
        pacer.on_success().await;
        Ok(())
    }

    /// Raw PUT of one slice to a presigned URL. Presigned hosts do not take
    /// the bearer token; 200 and 201 both mean stored.
    pub async fn put_presigned(&self, url: &str, data: Bytes, timeout: Duration) -> Result<()> {
        let pacer = self.pacers.get(PacerKind::Upload);
        pacer.acquire().await;
        let response = self
            .client
            .put(url)
            .timeout(timeout)
            .header("Content-Type", "application/octet-stream")
            .body(data)
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::OK || status == StatusCode::CREATED {
            pacer.on_success().await;
            return Ok(());
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            pacer.on_throttle().await;
        }
        Err(Error::ApiError {
            method: "PUT".to_string(),
            endpoint: url.to_string(),
            code: status.as_u16() as i64,
            message: "presigned upload rejected".to_string(),
            trace_id: None,
        })
    }

    pub async fn list_upload_parts(&self, preupload_id: &str) -> Result<ListUploadPartsData> {
        let body = json(&ListUploadPartsRequest {
            preupload_id: preupload_id.to_string(),
        });
        let domain = self.upload_domain().await?;
        self.call_required(
            Method::POST,
            &domain,
            "/upload/v1/file/list_upload_parts",
            &[],
            &body,
            None,
        )
        .await
    }

    pub async fn upload_complete(&self, preupload_id: &str) -> Result<UploadCompleteData> {
        let body = json(&UploadCompleteRequest {
            preupload_id: preupload_id.to_string(),
        });
        let domain = self.upload_domain().await?;
        self.call_required(
            Method::POST,
            &domain,
            "/upload/v1/file/upload_complete",
            &[],
            &body,
            None,
        )
        .await
    }

    pub async fn upload_async_result(&self, preupload_id: &str) -> Result<UploadAsyncResultData> {
        let body = json(&UploadAsyncResultRequest {
            preupload_id: preupload_id.to_string(),
        });
        let domain = self.upload_domain().await?;
        self.call_required(
            Method::POST,
            &domain,
            "/upload/v1/file/upload_async_result",
            &[],
            &body,
            None,
        )
        .await
    }

    /// Single-step upload: one multipart POST carrying the whole file. The
    /// `duplicate` flag asks the server to keep both names on conflict.
    pub async fn single_create(
        &self,
        parent_id: i64,
        filename: &str,
        etag: &str,
        data: Bytes,
        timeout: Duration,
    ) -> Result<SingleUploadData> {
        let path = "/upload/v2/file/single/create";
        let domain = self.upload_domain().await?;
        let pacer = self.pacers.for_path(path);
        pacer.acquire().await;

        let token = self.token_source(path)?.current_token().await?;
        let size = data.len();
        let form = Form::new()
            .text("parentFileID", parent_id.to_string())
            .text("filename", filename.to_string())
            .text("etag", etag.to_string())
            .text("size", size.to_string())
            .text("duplicate", "1")
            .part("file", Part::stream(data).file_name(filename.to_string()));

        let response = self
            .client
            .post(format!("{domain}{path}"))
            .timeout(timeout)
            .header("User-Agent", self.user_agent.clone())
            .header("Platform", "open_platform")
            .header("Authorization", format!("Bearer {token}"))
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if retry::should_retry_status(status) {
            if status == StatusCode::TOO_MANY_REQUESTS {
                pacer.on_throttle().await;
            }
            return Err(Error::ApiError {
                method: "POST".to_string(),
                endpoint: path.to_string(),
                code: status.as_u16() as i64,
                message: text,
                trace_id: None,
            });
        }
        let envelope: ApiEnvelope<SingleUploadData> =
            serde_json::from_str(&text).map_err(|err| Error::InvalidJson { err, text })?;
        if !envelope.is_success() {
            if Self::is_throttle(envelope.code, &envelope.message) {
                pacer.on_throttle().await;
            }
            return Err(Error::ApiError {
                method: "POST".to_string(),
                endpoint: path.to_string(),
                code: envelope.code,
                message: envelope.message,
                trace_id: envelope.trace_id,
            });
        }
        pacer.on_success().await;
        envelope.data.ok_or_else(|| Error::MissingData {
            endpoint: path.to_string(),
        })
    }

    /// Plain GET on a presigned download URL. No envelope, no bearer token;
    /// the optional range is passed straight through.
    pub async fn download(
        &self,
        url: &str,
        range: Option<(u64, u64)>,
        user_agent_override: Option<&str>,
        timeout: Duration,
    ) -> Result<Response> {
        let mut request = self
            .client
            .get(url)
            .timeout(timeout)
            .header(
                "User-Agent",
                user_agent_override.unwrap_or(&self.user_agent).to_string(),
            );
        if let Some((start, end)) = range {
            request = request.header("Range", format!("bytes={start}-{end}"));
        }
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::PARTIAL_CONTENT {
            Ok(response)
        } else {
            Err(Error::ApiError {
                method: "GET".to_string(),
                endpoint: url.to_string(),
                code: status.as_u16() as i64,
                message: "download request rejected".to_string(),
                trace_id: None,
            })
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU32, Ordering};

    use anyhow::Result;
    use httpmock::MockServer;

    use super::*;

    struct StaticTokens {
        refreshes: AtomicU32,
    }

    #[async_trait]
    impl TokenSource for StaticTokens {
        async fn current_token(&self) -> crate::Result<String> {
            if self.refreshes.load(Ordering::SeqCst) > 0 {
                Ok("fresh-token".to_string())
            } else {
                Ok("stale-token".to_string())
            }
        }

        async fn refresh_token(&self) -> crate::Result<String> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok("fresh-token".to_string())
        }
    }

    fn test_client(base_url: String) -> Pan123ApiClient {
        let client = Pan123ApiClient::new(ClientOptions {
            base_url,
            pacers: PacerConfig {
                list_min_sleep: Duration::from_millis(1),
                strict_min_sleep: Duration::from_millis(1),
                upload_min_sleep: Duration::from_millis(1),
                download_min_sleep: Duration::from_millis(1),
            },
            ..ClientOptions::default()
        })
        .unwrap();
        client.set_token_source(Arc::new(StaticTokens {
            refreshes: AtomicU32::new(0),
        }));
        client
    }

    #[tokio::test]
    async fn list_page_parses_envelope() -> Result<()> {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET)
                    .path("/api/v2/file/list")
                    .query_param("parentFileId", "0")
                    .header("Platform", "open_platform");
                then.status(200).json_body(serde_json::json!({
                    "code": 0, "message": "ok",
                    "data": {"lastFileId": -1, "fileList": [
                        {"fileId": 5, "filename": "x.bin", "type": 0, "size": 3,
                         "etag": "abc", "status": 2, "parentFileId": 0, "trashed": 0}
                    ]}
                }));
            })
            .await;

        let client = test_client(server.base_url());
        let page = client.file_list_page(0, 100, None).await?;
        assert_eq!(page.last_file_id, -1);
        assert_eq!(page.file_list.len(), 1);
        assert_eq!(page.file_list[0].filename, "x.bin");
        Ok(())
    }

    #[tokio::test]
    async fn envelope_401_forces_one_refresh_and_retries() -> Result<()> {
        let server = MockServer::start_async().await;
        let rejected = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET)
                    .path("/api/v1/user/info")
                    .header("Authorization", "Bearer stale-token");
                then.status(200)
                    .json_body(serde_json::json!({"code": 401, "message": "token expired"}));
            })
            .await;
        let accepted = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET)
                    .path("/api/v1/user/info")
                    .header("Authorization", "Bearer fresh-token");
                then.status(200).json_body(serde_json::json!({
                    "code": 0, "message": "ok",
                    "data": {"spacePermanent": 100, "spaceUsed": 25}
                }));
            })
            .await;

        let client = test_client(server.base_url());
        let info = client.user_info().await?;
        assert_eq!(info.space_permanent, 100);
        rejected.assert_hits_async(1).await;
        accepted.assert_hits_async(1).await;
        Ok(())
    }

    #[tokio::test]
    async fn version_fallback_switches_and_sticks() -> Result<()> {
        let server = MockServer::start_async().await;
        let v2 = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET).path("/api/v2/file/list");
                then.status(200)
                    .json_body(serde_json::json!({"code": 7, "message": "v2 gone"}));
            })
            .await;
        let v1 = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET).path("/api/v1/file/list");
                then.status(200).json_body(serde_json::json!({
                    "code": 0, "message": "ok",
                    "data": {"lastFileId": -1, "fileList": []}
                }));
            })
            .await;

        let client = test_client(server.base_url());
        client.file_list_page(0, 100, None).await?;
        // Second call goes straight to the pinned v1 shape.
        client.file_list_page(0, 100, None).await?;
        v2.assert_hits_async(1).await;
        v1.assert_hits_async(2).await;
        Ok(())
    }

    #[tokio::test]
    async fn not_found_code_is_terminal() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET)
                    .path("/api/v1/file/download_info");
                then.status(200)
                    .json_body(serde_json::json!({"code": 5066, "message": "file gone"}));
            })
            .await;

        let client = test_client(server.base_url());
        let err = client.download_info(9, None).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn upload_domain_is_cached() -> Result<()> {
        let server = MockServer::start_async().await;
        let domain_mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET)
                    .path("/upload/v2/file/domain");
                then.status(200).json_body(serde_json::json!({
                    "code": 0, "message": "ok", "data": ["https://upload.example.com"]
                }));
            })
            .await;

        let client = test_client(server.base_url());
        assert_eq!(client.upload_domain().await?, "https://upload.example.com");
        assert_eq!(client.upload_domain().await?, "https://upload.example.com");
        domain_mock.assert_hits_async(1).await;
        Ok(())
    }

    #[tokio::test]
    async fn server_fault_retries_with_backoff() -> Result<()> {
        let server = MockServer::start_async().await;
        // httpmock cannot flip responses per hit, so mount the failure, let
        // the first attempt land, then swap in the success mock while the
        // client sleeps out its backoff.
        let failing = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST).path("/api/v1/file/trash");
                then.status(502).body("bad gateway");
            })
            .await;
        let client = test_client(server.base_url());

        let handle = tokio::spawn(async move { client.trash(vec![1]).await });
        tokio::time::sleep(Duration::from_millis(300)).await;
        failing.delete_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST).path("/api/v1/file/trash");
                then.status(200)
                    .json_body(serde_json::json!({"code": 0, "message": "ok"}));
            })
            .await;

        let result = tokio::time::timeout(Duration::from_secs(10), handle).await??;
        assert!(result.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn file_infos_posts_ids() -> Result<()> {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST)
                    .path("/api/v1/file/infos")
                    .json_body_partial(r#"{"fileIDs": [4, 5]}"#);
                then.status(200).json_body(serde_json::json!({
                    "code": 0, "message": "ok",
                    "data": {"fileList": [
                        {"fileId": 4, "filename": "a", "type": 0, "size": 1,
                         "etag": "aa", "status": 2, "parentFileId": 0, "trashed": 0},
                        {"fileId": 5, "filename": "b", "type": 1, "size": 0,
                         "etag": "", "status": 2, "parentFileId": 0, "trashed": 0}
                    ]}
                }));
            })
            .await;

        let client = test_client(server.base_url());
        let infos = client.file_infos(vec![4, 5]).await?;
        assert_eq!(infos.file_list.len(), 2);
        assert!(infos.file_list[1].is_folder());
        Ok(())
    }

    #[tokio::test]
    async fn list_upload_parts_reports_etags() -> Result<()> {
        let server = MockServer::start_async().await;
        let client = test_client(server.base_url());
        let base = server.base_url();
        server
            .mock_async(move |when, then| {
                when.method(httpmock::Method::GET)
                    .path("/upload/v2/file/domain");
                then.status(200).json_body(serde_json::json!({
                    "code": 0, "message": "ok", "data": [base]
                }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST)
                    .path("/upload/v1/file/list_upload_parts");
                then.status(200).json_body(serde_json::json!({
                    "code": 0, "message": "ok",
                    "data": {"parts": [
                        {"partNumber": 1, "etag": "e1", "size": 100},
                        {"partNumber": 2, "etag": "e2", "size": 40}
                    ]}
                }));
            })
            .await;

        let parts = client.list_upload_parts("sess").await?;
        assert_eq!(parts.parts.len(), 2);
        assert_eq!(parts.parts[0].part_number, 1);
        assert_eq!(parts.parts[1].etag, "e2");
        Ok(())
    }

    #[tokio::test]
    async fn throttle_envelope_code_is_detected() {
        assert!(Pan123ApiClient::is_throttle(codes::THROTTLED, ""));
        assert!(Pan123ApiClient::is_throttle(codes::THROTTLED_UPLOAD, ""));
        assert!(Pan123ApiClient::is_throttle(7, "访问频率过高"));
        assert!(!Pan123ApiClient::is_throttle(7, "other"));
    }
}
