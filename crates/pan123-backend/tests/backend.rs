//! End-to-end backend tests against a mock API server.

use anyhow::Result;
use bytes::Bytes;
use camino::Utf8PathBuf;
use httpmock::MockServer;
use serde_json::json;

use pan123_backend::{config::Options, BackendError, Pan123Backend};
use pan123_transfer::{hash, UploadSource};

struct Fixture {
    server: MockServer,
    backend: Pan123Backend,
    _dir: tempfile::TempDir,
}

async fn fixture() -> Result<Fixture> {
    let server = MockServer::start_async().await;

    server
        .mock_async(|when, then| {
            when.method(httpmock::Method::POST)
                .path("/api/v1/access_token");
            then.status(200).json_body(json!({
                "code": 0, "message": "ok",
                "data": {
                    "accessToken": "token-1",
                    "expiredAt": (chrono::Utc::now() + chrono::Duration::hours(12)).to_rfc3339()
                }
            }));
        })
        .await;

    let dir = tempfile::tempdir()?;
    let backend = Pan123Backend::new(Options {
        client_id: "id".to_string(),
        client_secret: "secret".to_string(),
        cache_dir: Some(Utf8PathBuf::try_from(dir.path().join("cache"))?),
        pacer_min_sleep_ms: Some(1),
        base_url: Some(server.base_url()),
        ..Options::default()
    })
    .await?;

    Ok(Fixture {
        server,
        backend,
        _dir: dir,
    })
}

fn file_json(id: i64, name: &str, file_type: i64, size: i64, trashed: i64) -> serde_json::Value {
    json!({
        "fileId": id, "filename": name, "type": file_type, "size": size,
        "etag": "e", "status": 2, "parentFileId": 0, "trashed": trashed
    })
}

async fn mock_list(
    server: &MockServer,
    parent_id: i64,
    files: Vec<serde_json::Value>,
) -> httpmock::Mock<'_> {
    server
        .mock_async(move |when, then| {
            when.method(httpmock::Method::GET)
                .path("/api/v2/file/list")
                .query_param("parentFileId", parent_id.to_string());
            then.status(200).json_body(json!({
                "code": 0, "message": "ok",
                "data": {"lastFileId": -1, "fileList": files}
            }));
        })
        .await
}

#[tokio::test]
async fn list_serves_repeats_from_cache_and_hides_trash() -> Result<()> {
    let fx = fixture().await?;
    let listing = mock_list(
        &fx.server,
        0,
        vec![
            file_json(1, "keep.bin", 0, 10, 0),
            file_json(2, "gone.bin", 0, 10, 1),
        ],
    ).await;

    let first = fx.backend.list("/").await?;
    let second = fx.backend.list("/").await?;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].name, "keep.bin");
    assert_eq!(first, second);
    listing.assert_hits_async(1).await;
    Ok(())
}

#[tokio::test]
async fn mkdir_recovers_existing_directory_id() -> Result<()> {
    let fx = fixture().await?;
    mock_list(&fx.server, 0, vec![file_json(77, "docs", 1, 0, 0)]).await;
    fx.server
        .mock_async(|when, then| {
            when.method(httpmock::Method::POST)
                .path("/upload/v1/file/mkdir");
            then.status(200)
                .json_body(json!({"code": 1, "message": "该目录下已经有同名文件夹"}));
        })
        .await;

    let id = fx.backend.mkdir("/docs").await?;
    assert_eq!(id, 77);
    Ok(())
}

#[tokio::test]
async fn move_with_conflict_probes_and_renames() -> Result<()> {
    let fx = fixture().await?;
    mock_list(
        &fx.server,
        0,
        vec![
            json!({"fileId": 1, "filename": "a", "type": 1, "size": 0,
                   "etag": "", "status": 2, "parentFileId": 0, "trashed": 0}),
            json!({"fileId": 2, "filename": "b", "type": 1, "size": 0,
                   "etag": "", "status": 2, "parentFileId": 0, "trashed": 0}),
        ],
    ).await;
    fx.server.mock_async(|when, then| {
        when.method(httpmock::Method::GET)
            .path("/api/v2/file/list")
            .query_param("parentFileId", "1");
        then.status(200).json_body(json!({
            "code": 0, "message": "ok",
            "data": {"lastFileId": -1, "fileList": [
                {"fileId": 10, "filename": "x.bin", "type": 0, "size": 4,
                 "etag": "aa", "status": 2, "parentFileId": 1, "trashed": 0}
            ]}
        }));
    }).await;
    fx.server.mock_async(|when, then| {
        when.method(httpmock::Method::GET)
            .path("/api/v2/file/list")
            .query_param("parentFileId", "2");
        then.status(200).json_body(json!({
            "code": 0, "message": "ok",
            "data": {"lastFileId": -1, "fileList": [
                {"fileId": 20, "filename": "x.bin", "type": 0, "size": 4,
                 "etag": "bb", "status": 2, "parentFileId": 2, "trashed": 0}
            ]}
        }));
    }).await;
    let moved = fx
        .server
        .mock_async(|when, then| {
            when.method(httpmock::Method::POST).path("/api/v1/file/move");
            then.status(200).json_body(json!({"code": 0, "message": "ok"}));
        })
        .await;
    let renamed = fx
        .server
        .mock_async(|when, then| {
            when.method(httpmock::Method::PUT)
                .path("/api/v1/file/name")
                .json_body_partial(r#"{"fileName": "x (1).bin"}"#);
            then.status(200).json_body(json!({"code": 0, "message": "ok"}));
        })
        .await;

    let dest = fx.backend.move_to("/a/x.bin", "/b").await?;
    assert_eq!(dest, "/b/x (1).bin");
    moved.assert_hits_async(1).await;
    renamed.assert_hits_async(1).await;
    Ok(())
}

#[tokio::test]
async fn remove_invalidates_cached_listing() -> Result<()> {
    let fx = fixture().await?;
    let listing = mock_list(&fx.server, 0, vec![file_json(5, "f.bin", 0, 3, 0)]).await;
    fx.server
        .mock_async(|when, then| {
            when.method(httpmock::Method::POST).path("/api/v1/file/trash");
            then.status(200).json_body(json!({"code": 0, "message": "ok"}));
        })
        .await;

    fx.backend.remove("/f.bin").await?;
    // The mutation cleared the cached page; this list refetches.
    fx.backend.list("/").await?;
    listing.assert_hits_async(2).await;
    Ok(())
}

#[tokio::test]
async fn put_cleans_name_and_uploads_single_step() -> Result<()> {
    let fx = fixture().await?;
    mock_list(&fx.server, 0, vec![]).await;
    let base = fx.server.base_url();
    fx.server
        .mock_async(move |when, then| {
            when.method(httpmock::Method::GET)
                .path("/upload/v2/file/domain");
            then.status(200)
                .json_body(json!({"code": 0, "message": "ok", "data": [base]}));
        })
        .await;
    // Parent existence probe for the root is implicit; the file detail
    // endpoint is not consulted for id 0.
    let single = fx
        .server
        .mock_async(|when, then| {
            when.method(httpmock::Method::POST)
                .path("/upload/v2/file/single/create");
            then.status(200).json_body(json!({
                "code": 0, "message": "ok",
                "data": {"fileID": 909, "completed": true}
            }));
        })
        .await;

    let data = b"tiny";
    let entry = fx
        .backend
        .put(
            "/",
            "bad:name.bin",
            UploadSource::Memory(Bytes::from_static(data)),
            Some(4),
            Some(hash::md5_hex(data)),
        )
        .await?;

    assert_eq!(entry.name, "bad_name.bin");
    assert_eq!(entry.path, "/bad_name.bin");
    assert_eq!(entry.id, 909);
    single.assert_hits_async(1).await;
    Ok(())
}

#[tokio::test]
async fn about_reports_quota() -> Result<()> {
    let fx = fixture().await?;
    fx.server
        .mock_async(|when, then| {
            when.method(httpmock::Method::GET).path("/api/v1/user/info");
            then.status(200).json_body(json!({
                "code": 0, "message": "ok",
                "data": {"spacePermanent": 1000, "spaceUsed": 250}
            }));
        })
        .await;

    let about = fx.backend.about().await?;
    assert_eq!(about.total, 1000);
    assert_eq!(about.used, 250);
    assert_eq!(about.free, 750);
    Ok(())
}

#[tokio::test]
async fn commands_dispatch() -> Result<()> {
    let fx = fixture().await?;
    let stats = fx.backend.command("stats", &[]).await?;
    assert_eq!(stats["operations"], 0);

    let err = fx.backend.command("explode", &[]).await.unwrap_err();
    assert!(matches!(err, BackendError::UnknownCommand { .. }));
    Ok(())
}

#[test]
fn registration_hands_over_the_backend_record() {
    struct Collected(Vec<pan123_backend::BackendInfo>);
    impl pan123_backend::Registry for Collected {
        fn register(&mut self, info: pan123_backend::BackendInfo) {
            self.0.push(info);
        }
    }

    let mut registry = Collected(Vec::new());
    pan123_backend::register(&mut registry);
    assert_eq!(registry.0.len(), 1);
    assert_eq!(registry.0[0].name, "123pan");
}

#[tokio::test]
async fn missing_path_is_not_found() -> Result<()> {
    let fx = fixture().await?;
    mock_list(&fx.server, 0, vec![]).await;
    let err = fx.backend.stat("/absent.bin").await.unwrap_err();
    assert!(matches!(err, BackendError::NotFound { .. }));
    Ok(())
}
