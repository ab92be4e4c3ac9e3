//! Path resolution over the numeric ID tree.
//!
//! The service addresses nodes by ID; users address them by path. Resolution
//! walks from the root one segment at a time, paging each directory through
//! the listing cache, and writes every resolved prefix back to the path
//! cache so the next lookup is one read. Back-references are IDs, never
//! object references.

use std::sync::Arc;

use pan123_api::FileInfo;
use pan123_api_client::Pan123ApiClient;
use pan123_cache::{
    dir_list::START_TOKEN, path_map::PathIdEntry, DirListCache, ParentIdCache, PathIdCache,
};
use tracing::debug;

use crate::{BackendError, Result};

/// Server-side terminator for the listing pager.
const LAST_PAGE: i64 = -1;

pub struct PathResolver {
    client: Arc<Pan123ApiClient>,
    dir_list: Arc<DirListCache>,
    paths: Arc<PathIdCache>,
    parents: Arc<ParentIdCache>,
    root_folder_id: i64,
    list_chunk: u32,
}

impl PathResolver {
    pub fn new(
        client: Arc<Pan123ApiClient>,
        dir_list: Arc<DirListCache>,
        paths: Arc<PathIdCache>,
        parents: Arc<ParentIdCache>,
        root_folder_id: i64,
        list_chunk: u32,
    ) -> Self {
        PathResolver {
            client,
            dir_list,
            paths,
            parents,
            root_folder_id,
            list_chunk,
        }
    }

    pub fn root_id(&self) -> i64 {
        self.root_folder_id
    }

    /// Canonical form: leading slash, single separators, no empty or `.`
    /// segments. The root is `/`.
    pub fn normalize(path: &str) -> String {
        let mut out = String::with_capacity(path.len() + 1);
        for segment in path.split('/') {
            if segment.is_empty() || segment == "." {
                continue;
            }
            out.push('/');
            out.push_str(segment);
        }
        if out.is_empty() {
            out.push('/');
        }
        out
    }

    /// All live children of a directory, paged through the cache. Trashed
    /// entries never enter the cache or the result.
    pub async fn list_children(&self, parent_id: i64) -> Result<Vec<FileInfo>> {
        let mut children = Vec::new();
        let mut token = START_TOKEN.to_string();
        loop {
            let (page_files, next_token) = match self.dir_list.get(parent_id, &token)? {
                Some(cached) => (cached.file_list, cached.next_token),
                None => {
                    let last_file_id = token.parse::<i64>().ok();
                    let fetched = self
                        .client
                        .file_list_page(parent_id, self.list_chunk, last_file_id)
                        .await?;
                    let live: Vec<FileInfo> = fetched
                        .file_list
                        .into_iter()
                        .filter(|f| !f.is_trashed())
                        .collect();
                    self.dir_list
                        .put(parent_id, &token, live.clone(), fetched.last_file_id)?;
                    (live, fetched.last_file_id)
                }
            };
            children.extend(page_files);
            if next_token == LAST_PAGE {
                break;
            }
            token = next_token.to_string();
        }
        Ok(children)
    }

    /// Exact-name child lookup. The listing is authoritative; the search
    /// endpoint lags behind writes.
    pub async fn find_leaf(&self, parent_id: i64, name: &str) -> Result<Option<FileInfo>> {
        let children = self.list_children(parent_id).await?;
        Ok(children.into_iter().find(|f| f.filename == name))
    }

    /// Path to node entry, walking down from the root on cache misses.
    pub async fn resolve(&self, path: &str) -> Result<Option<PathIdEntry>> {
        let normalized = Self::normalize(path);
        if normalized == "/" {
            return Ok(Some(PathIdEntry {
                id: self.root_folder_id,
                is_dir: true,
                parent_id: self.root_folder_id,
            }));
        }
        if let Some(entry) = self.paths.get(&normalized)? {
            return Ok(Some(entry));
        }

        let mut current = self.root_folder_id;
        let mut walked = String::new();
        let mut resolved = None;
        for segment in normalized.split('/').filter(|s| !s.is_empty()) {
            walked.push('/');
            walked.push_str(segment);

            if let Some(entry) = self.paths.get(&walked)? {
                current = entry.id;
                resolved = Some(entry);
                continue;
            }
            let Some(found) = self.find_leaf(current, segment).await? else {
                return Ok(None);
            };
            let entry = PathIdEntry {
                id: found.file_id,
                is_dir: found.is_folder(),
                parent_id: current,
            };
            self.paths.put(&walked, &entry)?;
            if !entry.is_dir && walked != normalized {
                // A file in the middle of the path; nothing below it exists.
                return Ok(None);
            }
            current = found.file_id;
            resolved = Some(entry);
        }
        Ok(resolved)
    }

    /// Resolves a directory path, creating missing segments when asked.
    pub async fn resolve_dir(&self, path: &str, create: bool) -> Result<i64> {
        let normalized = Self::normalize(path);
        if let Some(entry) = self.resolve(&normalized).await? {
            if !entry.is_dir {
                return Err(BackendError::NotADirectory {
                    path: normalized.clone(),
                });
            }
            return Ok(entry.id);
        }
        if !create {
            return Err(BackendError::NotFound { path: normalized });
        }

        let mut current = self.root_folder_id;
        let mut walked = String::new();
        for segment in normalized.split('/').filter(|s| !s.is_empty()) {
            walked.push('/');
            walked.push_str(segment);
            if let Some(entry) = self.paths.get(&walked)? {
                if !entry.is_dir {
                    return Err(BackendError::NotADirectory { path: walked });
                }
                current = entry.id;
                continue;
            }
            match self.find_leaf(current, segment).await? {
                Some(found) if found.is_folder() => {
                    self.paths.put(
                        &walked,
                        &PathIdEntry {
                            id: found.file_id,
                            is_dir: true,
                            parent_id: current,
                        },
                    )?;
                    current = found.file_id;
                }
                Some(_) => {
                    return Err(BackendError::NotADirectory { path: walked });
                }
                None => {
                    let created = self.create_dir(current, segment).await?;
                    self.paths.put(
                        &walked,
                        &PathIdEntry {
                            id: created,
                            is_dir: true,
                            parent_id: current,
                        },
                    )?;
                    current = created;
                }
            }
        }
        Ok(current)
    }

    /// Creates one directory, recovering the existing ID when the server
    /// answers with its duplicate-name code.
    pub async fn create_dir(&self, parent_id: i64, name: &str) -> Result<i64> {
        match self.client.mkdir(parent_id, name).await {
            Ok(data) => {
                self.dir_list.invalidate(parent_id)?;
                self.parents.put(data.dir_id, true)?;
                debug!(parent_id, name, dir_id = data.dir_id, "created directory");
                Ok(data.dir_id)
            }
            Err(pan123_api_client::Error::ApiError { code, message, .. })
                if code == pan123_api::codes::DUPLICATE_NAME =>
            {
                debug!(parent_id, name, %message, "directory exists, looking up its id");
                self.dir_list.invalidate(parent_id)?;
                match self.find_leaf(parent_id, name).await? {
                    Some(found) if found.is_folder() => Ok(found.file_id),
                    _ => Err(BackendError::NotFound {
                        path: name.to_string(),
                    }),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Whether a node ID currently exists as a directory. Both answers are
    /// cached.
    pub async fn parent_exists(&self, id: i64) -> Result<bool> {
        if id == self.root_folder_id {
            return Ok(true);
        }
        if let Some(known) = self.parents.get(id)? {
            return Ok(known);
        }
        let exists = match self.client.file_detail(id).await {
            Ok(detail) => detail.trashed == 0 && detail.file_type == 1,
            Err(pan123_api_client::Error::NotFound { .. }) => false,
            Err(err) => return Err(err.into()),
        };
        self.parents.put(id, exists)?;
        Ok(exists)
    }

    pub fn caches(&self) -> (&Arc<DirListCache>, &Arc<PathIdCache>, &Arc<ParentIdCache>) {
        (&self.dir_list, &self.paths, &self.parents)
    }
}

#[cfg(test)]
mod test {
    use test_case::test_case;

    use super::*;

    #[test_case("", "/" ; "empty is root")]
    #[test_case("/", "/" ; "root stays root")]
    #[test_case("a/b", "/a/b" ; "leading slash added")]
    #[test_case("//a///b//", "/a/b" ; "doubled separators collapse")]
    #[test_case("./a/./b/.", "/a/b" ; "dot segments drop")]
    fn normalization(input: &str, expected: &str) {
        assert_eq!(PathResolver::normalize(input), expected);
    }
}
