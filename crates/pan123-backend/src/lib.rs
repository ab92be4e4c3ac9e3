#![deny(clippy::all)]

//! 123Pan backend: the file-system face of the driver.
//!
//! One backend instance owns the API client with its pacers, the token
//! manager, the persistent caches, the transfer engine and the path
//! resolver. Operations take user paths, resolve them to node IDs, run the
//! wire calls under the right pacer class and keep the caches coherent: any
//! mutation clears the touched path mappings and the affected directory
//! listings before it returns.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use pan123_api_client::{ClientOptions, Pan123ApiClient};
use pan123_auth::{TokenManager, TokenPersistence};
use pan123_cache::{
    namespaces, DirListCache, DownloadUrlCache, KvStore, MemoryManager, ParentIdCache,
    PathIdCache, ResumeStore,
};
use pan123_transfer::{
    DownloadStream, Downloader, MetricsRing, NetworkMonitor, ProgressPersister, TransferConfig,
    UploadEngine, UploadRequest, UploadSource,
};

pub mod config;
pub mod name;
pub mod resolver;

pub use config::Options;
use resolver::PathResolver;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Api(#[from] pan123_api_client::Error),
    #[error(transparent)]
    Auth(#[from] pan123_auth::Error),
    #[error(transparent)]
    Cache(#[from] pan123_cache::CacheError),
    #[error(transparent)]
    Transfer(#[from] pan123_transfer::TransferError),
    #[error(transparent)]
    Name(#[from] name::NameError),
    #[error("client_id and client_secret are required")]
    MissingCredentials,
    #[error("invalid option {option}: {reason}")]
    InvalidOption {
        option: &'static str,
        reason: String,
    },
    #[error("not found: {path}")]
    NotFound { path: String },
    #[error("not a directory: {path}")]
    NotADirectory { path: String },
    #[error("is a directory: {path}")]
    IsADirectory { path: String },
    #[error("directory not empty: {path}")]
    DirectoryNotEmpty { path: String },
    #[error("cache directory is not a UTF-8 path")]
    NonUtf8CacheDir,
    #[error("unknown backend command: {command}")]
    UnknownCommand { command: String },
    #[error("command {command} expects {expected}")]
    BadCommandArgs {
        command: &'static str,
        expected: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// One remote node as the framework sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub id: i64,
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub etag: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct About {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

/// Registration record handed to the enclosing framework exactly once at
/// startup.
#[derive(Debug, Clone, Copy)]
pub struct BackendInfo {
    pub name: &'static str,
    pub description: &'static str,
}

pub trait Registry {
    fn register(&mut self, info: BackendInfo);
}

pub fn register(registry: &mut dyn Registry) {
    registry.register(BackendInfo {
        name: "123pan",
        description: "123Pan object storage",
    });
}

pub struct Pan123Backend {
    client: Arc<Pan123ApiClient>,
    tokens: Arc<TokenManager>,
    kv: Arc<KvStore>,
    resolver: PathResolver,
    url_cache: Arc<DownloadUrlCache>,
    engine: UploadEngine,
    downloader: Downloader,
    metrics: Arc<MetricsRing>,
    options: Options,
}

impl Pan123Backend {
    pub async fn new(options: Options) -> Result<Self> {
        let options = options.validated()?;

        let mut client_options = ClientOptions {
            connect_timeout: options.conn_timeout(),
            timeout: options.timeout(),
            pacers: options.pacer_config(),
            ..ClientOptions::default()
        };
        if let Some(base_url) = &options.base_url {
            client_options.base_url = base_url.clone();
        }
        if let Some(user_agent) = &options.user_agent {
            client_options.user_agent = user_agent.clone();
        }
        let client = Arc::new(Pan123ApiClient::new(client_options)?);

        let persistence = options.token_file.clone().map(|path| TokenPersistence {
            path,
            remote_name: options.remote_name.clone(),
        });
        let tokens = Arc::new(TokenManager::new(
            Arc::clone(&client),
            options.client_id.clone(),
            options.client_secret.clone(),
            persistence,
        ));
        client.set_token_source(Arc::clone(&tokens) as Arc<dyn pan123_api_client::TokenSource>);
        tokens.load_persisted().await?;
        tokens.start_renewer();

        let cache_root = match &options.cache_dir {
            Some(dir) => dir.clone(),
            None => default_cache_dir()?,
        };
        let kv = Arc::new(KvStore::open(cache_root)?);
        let swept = kv.sweep_all()?;
        if swept > 0 {
            debug!(swept, "dropped expired cache entries at startup");
        }

        let dir_list = Arc::new(DirListCache::new(kv.namespace(namespaces::DIR_LIST)?));
        let paths = Arc::new(PathIdCache::new(kv.namespace(namespaces::PATH_TO_ID)?));
        let parents = Arc::new(ParentIdCache::new(kv.namespace(namespaces::PARENT_IDS)?));
        let url_cache = Arc::new(DownloadUrlCache::new(
            kv.namespace(namespaces::DOWNLOAD_URL)?,
            kv.namespace(namespaces::DOWNLOAD_URL_ENHANCED)?,
        ));
        let resume = Arc::new(ResumeStore::new(kv.namespace(namespaces::RESUME)?));
        let persister = Arc::new(ProgressPersister::new(resume)?);

        let memory = Arc::new(MemoryManager::default());
        let network = Arc::new(NetworkMonitor::new());
        let metrics = Arc::new(MetricsRing::new());

        let transfer_config = TransferConfig {
            base_timeout: options.timeout().max(std::time::Duration::from_secs(60)),
            max_upload_parts: options.max_upload_parts,
            max_concurrent_uploads: options.max_concurrent_uploads,
            max_concurrent_downloads: options.max_concurrent_downloads,
            upload_cutoff: options.upload_cutoff,
            chunk_size_override: options.chunk_size,
            progress_display: options.enable_progress_display,
            progress_interval: std::time::Duration::from_secs(
                options.progress_update_interval_secs.max(1),
            ),
            ..TransferConfig::default()
        };
        let engine = UploadEngine::new(
            Arc::clone(&client),
            persister,
            Arc::clone(&memory),
            Arc::clone(&network),
            Arc::clone(&metrics),
            transfer_config.clone(),
        );
        engine.sweep_progress()?;
        let downloader = Downloader::new(
            Arc::clone(&client),
            Arc::clone(&url_cache),
            memory,
            network,
            Arc::clone(&metrics),
            transfer_config.max_concurrent_downloads,
            transfer_config.download_timeout,
        );

        let resolver = PathResolver::new(
            Arc::clone(&client),
            dir_list,
            paths,
            parents,
            options.root_folder_id,
            options.list_chunk,
        );

        Ok(Pan123Backend {
            client,
            tokens,
            kv,
            resolver,
            url_cache,
            engine,
            downloader,
            metrics,
            options,
        })
    }

    /// Lists a directory. Trashed entries are already filtered out.
    pub async fn list(&self, dir_path: &str) -> Result<Vec<Entry>> {
        let normalized = PathResolver::normalize(dir_path);
        let dir_id = self.resolver.resolve_dir(&normalized, false).await?;
        let children = self.resolver.list_children(dir_id).await?;
        Ok(children
            .into_iter()
            .map(|f| Entry {
                path: join_path(&normalized, &f.filename),
                name: f.filename.clone(),
                id: f.file_id,
                is_dir: f.is_folder(),
                size: f.size.max(0) as u64,
                etag: f.etag,
            })
            .collect())
    }

    /// Metadata for one path. The parent listing is authoritative.
    pub async fn stat(&self, path: &str) -> Result<Entry> {
        let normalized = PathResolver::normalize(path);
        let (parent_path, leaf) = split_path(&normalized);
        if leaf.is_empty() {
            return Ok(Entry {
                id: self.resolver.root_id(),
                name: String::new(),
                path: "/".to_string(),
                is_dir: true,
                size: 0,
                etag: String::new(),
            });
        }
        let parent_id = self.resolver.resolve_dir(parent_path, false).await?;
        let found = self
            .resolver
            .find_leaf(parent_id, leaf)
            .await?
            .ok_or_else(|| BackendError::NotFound {
                path: normalized.clone(),
            })?;
        Ok(Entry {
            path: normalized,
            name: found.filename.clone(),
            id: found.file_id,
            is_dir: found.is_folder(),
            size: found.size.max(0) as u64,
            etag: found.etag,
        })
    }

    /// Creates a directory and any missing ancestors. Returns its ID.
    pub async fn mkdir(&self, path: &str) -> Result<i64> {
        let normalized = PathResolver::normalize(path);
        let (_, leaf) = split_path(&normalized);
        if !leaf.is_empty() {
            name::validate(leaf)?;
        }
        let id = self.resolver.resolve_dir(&normalized, true).await?;
        Ok(id)
    }

    /// Removes an empty directory by trashing it.
    pub async fn rmdir(&self, path: &str) -> Result<()> {
        let normalized = PathResolver::normalize(path);
        let entry = self.require(&normalized).await?;
        if !entry.is_dir {
            return Err(BackendError::NotADirectory { path: normalized });
        }
        if !self.resolver.list_children(entry.id).await?.is_empty() {
            return Err(BackendError::DirectoryNotEmpty { path: normalized });
        }
        self.client.trash(vec![entry.id]).await?;
        self.invalidate_after_mutation(&normalized, &[entry.parent_id, entry.id]);
        Ok(())
    }

    /// Soft delete: moves the node to the trash.
    pub async fn remove(&self, path: &str) -> Result<()> {
        let normalized = PathResolver::normalize(path);
        let entry = self.require(&normalized).await?;
        self.client.trash(vec![entry.id]).await?;
        self.invalidate_after_mutation(&normalized, &[entry.parent_id, entry.id]);
        Ok(())
    }

    /// Hard delete: trash, then purge. The server only purges trashed nodes.
    pub async fn remove_permanently(&self, path: &str) -> Result<()> {
        let normalized = PathResolver::normalize(path);
        let entry = self.require(&normalized).await?;
        self.client.trash(vec![entry.id]).await?;
        self.client.delete_permanently(vec![entry.id]).await?;
        self.invalidate_after_mutation(&normalized, &[entry.parent_id, entry.id]);
        Ok(())
    }

    /// Renames in place, cleaning the target name first.
    pub async fn rename(&self, path: &str, new_name: &str) -> Result<String> {
        let normalized = PathResolver::normalize(path);
        let entry = self.require(&normalized).await?;
        name::validate(new_name)?;
        let final_name = self.unique_in(entry.parent_id, new_name).await?;
        self.client.rename(entry.id, &final_name).await?;
        self.invalidate_after_mutation(&normalized, &[entry.parent_id]);
        let (parent_path, _) = split_path(&normalized);
        Ok(join_path(parent_path, &final_name))
    }

    /// Moves a node into another directory. A name conflict at the
    /// destination gets a uniqueness suffix, applied by rename after the
    /// move so the final name is predictable.
    pub async fn move_to(&self, src: &str, dest_dir: &str) -> Result<String> {
        let src_path = PathResolver::normalize(src);
        let entry = self.require(&src_path).await?;
        let dest_dir_path = PathResolver::normalize(dest_dir);
        let dest_id = self.resolver.resolve_dir(&dest_dir_path, true).await?;

        let final_name = self.unique_in(dest_id, &entry.name).await?;
        self.client.move_files(vec![entry.id], dest_id).await?;
        if final_name != entry.name {
            self.client.rename(entry.id, &final_name).await?;
        }
        self.invalidate_after_mutation(&src_path, &[entry.parent_id]);
        let dest_path = join_path(&dest_dir_path, &final_name);
        self.invalidate_after_mutation(&dest_path, &[dest_id]);
        Ok(dest_path)
    }

    /// Server-side copy is not in the API; copy reads the source and writes
    /// it to the destination. A matching `(size, md5)` on the server still
    /// short-circuits the write through instant upload.
    pub async fn copy(&self, src: &str, dest_dir: &str) -> Result<Entry> {
        let src_path = PathResolver::normalize(src);
        let entry = self.require(&src_path).await?;
        if entry.is_dir {
            return Err(BackendError::IsADirectory { path: src_path });
        }
        let stream = self.open(&src_path, None).await?;
        let (reader, mut writer) = tokio::io::duplex(256 * 1024);
        let pump = tokio::spawn(async move {
            let mut stream = stream;
            while let Ok(Some(chunk)) = stream.next_chunk().await {
                if writer.write_all(&chunk).await.is_err() {
                    return;
                }
            }
            let _ = writer.shutdown().await;
        });
        let result = self
            .put(
                dest_dir,
                &entry.name,
                UploadSource::Stream(Box::new(reader)),
                Some(entry.size),
                Some(entry.etag.clone()),
            )
            .await;
        pump.abort();
        result
    }

    /// Uploads one file into a directory, creating missing ancestors. The
    /// name is cleaned to the service's rules and made unique among the
    /// destination's children.
    pub async fn put(
        &self,
        dir_path: &str,
        file_name: &str,
        source: UploadSource,
        declared_size: Option<u64>,
        known_md5: Option<String>,
    ) -> Result<Entry> {
        let dir_path = PathResolver::normalize(dir_path);
        let parent_id = self.resolver.resolve_dir(&dir_path, true).await?;
        if !self.resolver.parent_exists(parent_id).await? {
            return Err(BackendError::NotFound { path: dir_path });
        }

        let cleaned = name::clean(file_name);
        if cleaned != file_name {
            debug!(file_name, cleaned, "cleaned upload file name");
        }
        let final_name = self.unique_in(parent_id, &cleaned).await?;

        let outcome = self
            .engine
            .upload(UploadRequest {
                parent_id,
                file_name: final_name.clone(),
                declared_size,
                known_md5,
                source,
            })
            .await?;

        let path = join_path(&dir_path, &final_name);
        self.invalidate_after_mutation(&path, &[parent_id]);
        Ok(Entry {
            id: outcome.file_id,
            name: final_name,
            path,
            is_dir: false,
            size: outcome.size,
            etag: outcome.etag,
        })
    }

    /// Opens a file for reading, optionally a byte range.
    pub async fn open(&self, path: &str, range: Option<(u64, u64)>) -> Result<DownloadStream> {
        let entry = self.require(&PathResolver::normalize(path)).await?;
        if entry.is_dir {
            return Err(BackendError::IsADirectory { path: entry.path });
        }
        Ok(self.downloader.open(entry.id, entry.size, range).await?)
    }

    /// Quota from the user-info endpoint.
    pub async fn about(&self) -> Result<About> {
        let info = self.client.user_info().await?;
        let total = info.space_permanent.max(0) as u64;
        let used = info.space_used.max(0) as u64;
        Ok(About {
            total,
            used,
            free: total.saturating_sub(used),
        })
    }

    /// Host-invokable commands.
    pub async fn command(&self, command: &str, args: &[String]) -> Result<serde_json::Value> {
        match command {
            "getdownloadurlua" => {
                let [path, user_agent] = args else {
                    return Err(BackendError::BadCommandArgs {
                        command: "getdownloadurlua",
                        expected: "<remote> <user-agent>",
                    });
                };
                let entry = self.require(&PathResolver::normalize(path)).await?;
                let url = self
                    .downloader
                    .download_url_with_ua(entry.id, entry.size as i64, Some(user_agent.as_str()))
                    .await?;
                Ok(serde_json::json!({ "url": url }))
            }
            "stats" => {
                let summary = self.metrics.summary();
                Ok(serde_json::json!({
                    "operations": summary.operations,
                    "bytes": summary.bytes,
                    "errors": summary.errors,
                    "retries": summary.retries,
                    "avg_throughput_bps": summary.avg_throughput_bps,
                }))
            }
            "logstats" => {
                let summary = self.metrics.summary();
                info!(
                    operations = summary.operations,
                    bytes = summary.bytes,
                    errors = summary.errors,
                    retries = summary.retries,
                    avg_throughput_bps = summary.avg_throughput_bps,
                    "transfer statistics"
                );
                Ok(serde_json::Value::Null)
            }
            other => Err(BackendError::UnknownCommand {
                command: other.to_string(),
            }),
        }
    }

    /// Stops background work and flushes housekeeping state. Uncompleted
    /// uploads stay resumable.
    pub fn shutdown(&self) {
        self.tokens.shutdown();
        if let Err(err) = self.kv.sweep_all() {
            warn!(?err, "cache sweep on shutdown failed");
        }
        if let Err(err) = self.engine.sweep_progress() {
            warn!(?err, "progress sweep on shutdown failed");
        }
    }

    async fn require(&self, normalized: &str) -> Result<ResolvedEntry> {
        let entry =
            self.resolver
                .resolve(normalized)
                .await?
                .ok_or_else(|| BackendError::NotFound {
                    path: normalized.to_string(),
                })?;
        let (_, leaf) = split_path(normalized);
        Ok(ResolvedEntry {
            id: entry.id,
            parent_id: entry.parent_id,
            is_dir: entry.is_dir,
            name: leaf.to_string(),
            path: normalized.to_string(),
            size: self.size_of(normalized, entry.id, entry.is_dir).await?,
            etag: self.etag_of(normalized, entry.id, entry.is_dir).await?,
        })
    }

    async fn size_of(&self, normalized: &str, id: i64, is_dir: bool) -> Result<u64> {
        if is_dir {
            return Ok(0);
        }
        // The listing already resolved this node; its parent's cached page
        // answers without another round-trip.
        let (parent_path, leaf) = split_path(normalized);
        let parent_id = self.resolver.resolve_dir(parent_path, false).await?;
        if let Some(found) = self.resolver.find_leaf(parent_id, leaf).await? {
            if found.file_id == id {
                return Ok(found.size.max(0) as u64);
            }
        }
        Ok(0)
    }

    async fn etag_of(&self, normalized: &str, id: i64, is_dir: bool) -> Result<String> {
        if is_dir {
            return Ok(String::new());
        }
        let (parent_path, leaf) = split_path(normalized);
        let parent_id = self.resolver.resolve_dir(parent_path, false).await?;
        if let Some(found) = self.resolver.find_leaf(parent_id, leaf).await? {
            if found.file_id == id {
                return Ok(found.etag);
            }
        }
        Ok(String::new())
    }

    /// A destination name no existing child uses.
    async fn unique_in(&self, parent_id: i64, base: &str) -> Result<String> {
        let children = self.resolver.list_children(parent_id).await?;
        let names: std::collections::HashSet<String> =
            children.into_iter().map(|f| f.filename).collect();
        Ok(name::unique_name(base, &|candidate: &str| {
            names.contains(candidate)
        }))
    }

    /// The invalidation hook every mutation runs: the path and its subtree
    /// leave the path cache, every touched parent loses its listing pages,
    /// and the parent-existence answers for those IDs are dropped.
    fn invalidate_after_mutation(&self, path: &str, parent_ids: &[i64]) {
        let (dir_list, paths, parents) = self.resolver.caches();
        if let Err(err) = paths.invalidate_subtree(path) {
            warn!(path, ?err, "path cache invalidation failed");
        }
        for &parent_id in parent_ids {
            if let Err(err) = dir_list.invalidate(parent_id) {
                warn!(parent_id, ?err, "dir list invalidation failed");
            }
            if let Err(err) = parents.invalidate(parent_id) {
                warn!(parent_id, ?err, "parent cache invalidation failed");
            }
            if let Err(err) = self.url_cache.invalidate(parent_id) {
                warn!(parent_id, ?err, "download url invalidation failed");
            }
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }
}

struct ResolvedEntry {
    id: i64,
    parent_id: i64,
    is_dir: bool,
    name: String,
    path: String,
    size: u64,
    etag: String,
}

fn default_cache_dir() -> Result<Utf8PathBuf> {
    let temp = std::env::temp_dir();
    let temp = Utf8Path::from_path(&temp).ok_or(BackendError::NonUtf8CacheDir)?;
    Ok(temp.join("rclone-123pan-cache"))
}

fn join_path(dir: &str, leaf: &str) -> String {
    if dir == "/" {
        format!("/{leaf}")
    } else {
        format!("{dir}/{leaf}")
    }
}

fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("/", path),
    }
}
