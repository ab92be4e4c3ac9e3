#![deny(clippy::all)]

//! Wire types for the 123Pan open platform API.
//!
//! Every response is a JSON envelope `{code, message, data}` where `code == 0`
//! signals success. Unknown fields are ignored throughout so that server-side
//! additions do not break deserialization.

use serde::{Deserialize, Serialize};

/// Envelope error codes with well-known meanings. Anything else is surfaced
/// verbatim to the caller.
pub mod codes {
    pub const OK: i64 = 0;
    pub const UNAUTHORIZED: i64 = 401;
    pub const THROTTLED: i64 = 429;
    /// Secondary throttle code used by the upload endpoints.
    pub const THROTTLED_UPLOAD: i64 = 20003;
    pub const FILE_NOT_FOUND: i64 = 5066;
    /// Returned by mkdir when a folder of the same name already exists.
    pub const DUPLICATE_NAME: i64 = 1;
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    pub data: Option<T>,
    #[serde(rename = "x-traceID", default)]
    pub trace_id: Option<String>,
}

impl<T> ApiEnvelope<T> {
    pub fn is_success(&self) -> bool {
        self.code == codes::OK
    }
}

/// A single node in a directory listing. `file_type` is 0 for files and 1 for
/// folders.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    #[serde(rename = "fileId")]
    pub file_id: i64,
    pub filename: String,
    #[serde(rename = "type")]
    pub file_type: i64,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub etag: String,
    #[serde(default)]
    pub status: i64,
    #[serde(rename = "parentFileId", default)]
    pub parent_file_id: i64,
    #[serde(default)]
    pub trashed: i64,
}

impl FileInfo {
    pub fn is_folder(&self) -> bool {
        self.file_type == 1
    }

    pub fn is_trashed(&self) -> bool {
        self.trashed != 0
    }
}

/// One page of a directory listing. `last_file_id == -1` terminates the pager.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileListData {
    #[serde(rename = "lastFileId")]
    pub last_file_id: i64,
    #[serde(rename = "fileList", default)]
    pub file_list: Vec<FileInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenData {
    pub access_token: String,
    /// RFC-3339 expiry timestamp.
    pub expired_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    #[serde(rename = "clientID")]
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfoData {
    #[serde(default)]
    pub uid: i64,
    #[serde(default)]
    pub nickname: String,
    pub space_permanent: i64,
    pub space_used: i64,
    #[serde(default)]
    pub space_temp: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadInfoData {
    pub download_url: String,
    #[serde(default)]
    pub expire_time: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MkdirRequest {
    pub name: String,
    #[serde(rename = "parentID")]
    pub parent_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MkdirData {
    #[serde(rename = "dirID")]
    pub dir_id: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveRequest {
    #[serde(rename = "fileIDs")]
    pub file_ids: Vec<i64>,
    #[serde(rename = "toParentFileID")]
    pub to_parent_file_id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RenameRequest {
    #[serde(rename = "fileId")]
    pub file_id: i64,
    #[serde(rename = "fileName")]
    pub file_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrashRequest {
    #[serde(rename = "fileIDs")]
    pub file_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteRequest {
    #[serde(rename = "fileIDs")]
    pub file_ids: Vec<i64>,
}

/// Body of `upload/v*/file/create`. Supplying `size` and `etag` lets the
/// server answer with `reuse == true` when it already holds the content.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadCreateRequest {
    #[serde(rename = "parentFileID")]
    pub parent_file_id: i64,
    pub filename: String,
    pub etag: String,
    pub size: i64,
    /// 1 keeps both names (the server appends a suffix), 2 overwrites.
    pub duplicate: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadCreateData {
    #[serde(rename = "fileID", default)]
    pub file_id: i64,
    #[serde(rename = "preuploadID", default)]
    pub preupload_id: String,
    #[serde(default)]
    pub reuse: bool,
    #[serde(default)]
    pub slice_size: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadUrlRequest {
    #[serde(rename = "preuploadID")]
    pub preupload_id: String,
    pub slice_no: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadUrlData {
    #[serde(rename = "presignedURL")]
    pub presigned_url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListUploadPartsRequest {
    #[serde(rename = "preuploadID")]
    pub preupload_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPartInfo {
    pub part_number: i64,
    #[serde(default)]
    pub etag: String,
    #[serde(default)]
    pub size: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListUploadPartsData {
    #[serde(default)]
    pub parts: Vec<UploadPartInfo>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadCompleteRequest {
    #[serde(rename = "preuploadID")]
    pub preupload_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadCompleteData {
    #[serde(rename = "async", default)]
    pub is_async: bool,
    #[serde(default)]
    pub completed: bool,
    #[serde(rename = "fileID", default)]
    pub file_id: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadAsyncResultRequest {
    #[serde(rename = "preuploadID")]
    pub preupload_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadAsyncResultData {
    #[serde(default)]
    pub completed: bool,
    #[serde(rename = "fileID", default)]
    pub file_id: i64,
    /// Server-side MD5 of the assembled file, reported once assembly is done.
    #[serde(default)]
    pub etag: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleUploadData {
    #[serde(rename = "fileID", default)]
    pub file_id: i64,
    #[serde(default)]
    pub completed: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfosData {
    #[serde(rename = "fileList", default)]
    pub file_list: Vec<FileInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileInfosRequest {
    #[serde(rename = "fileIDs")]
    pub file_ids: Vec<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDetailData {
    #[serde(rename = "fileID", alias = "fileId")]
    pub file_id: i64,
    pub filename: String,
    #[serde(rename = "type")]
    pub file_type: i64,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub etag: String,
    #[serde(rename = "parentFileId", default)]
    pub parent_file_id: i64,
    #[serde(default)]
    pub trashed: i64,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn envelope_success_is_code_zero() {
        let env: ApiEnvelope<FileListData> = serde_json::from_str(
            r#"{"code":0,"message":"ok","data":{"lastFileId":-1,"fileList":[]}}"#,
        )
        .unwrap();
        assert!(env.is_success());
        assert_eq!(env.data.unwrap().last_file_id, -1);
    }

    #[test]
    fn envelope_tolerates_unknown_fields() {
        let env: ApiEnvelope<UploadCreateData> = serde_json::from_str(
            r#"{"code":0,"message":"","x-traceID":"abc","data":
               {"fileID":7,"preuploadID":"p1","reuse":true,"sliceSize":1048576,"extra":42}}"#,
        )
        .unwrap();
        let data = env.data.unwrap();
        assert!(data.reuse);
        assert_eq!(data.slice_size, 1048576);
        assert_eq!(env.trace_id.as_deref(), Some("abc"));
    }

    #[test]
    fn file_list_entry_shape() {
        let env: ApiEnvelope<FileListData> = serde_json::from_str(
            r#"{"code":0,"message":"ok","data":{"lastFileId":104,"fileList":[
               {"fileId":103,"filename":"a.bin","type":0,"size":12,
                "etag":"d41d8cd98f00b204e9800998ecf8427e","status":2,
                "parentFileId":0,"trashed":0},
               {"fileId":104,"filename":"dir","type":1,"size":0,
                "etag":"","status":2,"parentFileId":0,"trashed":1}]}}"#,
        )
        .unwrap();
        let data = env.data.unwrap();
        assert_eq!(data.file_list.len(), 2);
        assert!(!data.file_list[0].is_folder());
        assert!(data.file_list[1].is_folder());
        assert!(data.file_list[1].is_trashed());
    }

    #[test]
    fn upload_complete_async_flag() {
        let env: ApiEnvelope<UploadCompleteData> =
            serde_json::from_str(r#"{"code":0,"message":"","data":{"async":true,"completed":false,"fileID":0}}"#)
                .unwrap();
        let data = env.data.unwrap();
        assert!(data.is_async);
        assert!(!data.completed);
    }

    #[test]
    fn token_request_wire_names() {
        let body = serde_json::to_value(TokenRequest {
            client_id: "id".into(),
            client_secret: "secret".into(),
        })
        .unwrap();
        assert_eq!(body["clientID"], "id");
        assert_eq!(body["clientSecret"], "secret");
    }
}
