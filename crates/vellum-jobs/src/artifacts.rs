//! Object-store seam for inputs, artifacts, and logs.
//!
//! The real platform fronts an object store; this trait mirrors its
//! primitives (put/get/delete/list) and ships a filesystem-backed
//! implementation. Key layout:
//!
//! - input files: `projects/{project}/files/{path}`
//! - compilation outputs: `compilations/{job_id}/{name}`

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use vellum_core::JobId;

use crate::error::{JobError, JobResult};

/// Key of one project input file.
#[must_use]
pub fn input_key(project: &str, path: &str) -> String {
    format!("projects/{project}/files/{path}")
}

/// Prefix covering all of a project's input files.
#[must_use]
pub fn input_prefix(project: &str) -> String {
    format!("projects/{project}/files/")
}

/// Key of a compilation output file.
#[must_use]
pub fn result_key(job_id: JobId, name: &str) -> String {
    format!("compilations/{job_id}/{name}")
}

/// Key of a compilation's build log.
#[must_use]
pub fn log_key(job_id: JobId) -> String {
    format!("compilations/{job_id}/build.log")
}

/// Object-store primitives.
#[async_trait]
pub trait ArtifactStore: Send + Sync + 'static {
    /// Store bytes under a key, overwriting.
    async fn put(&self, key: &str, bytes: &[u8]) -> JobResult<()>;

    /// Fetch bytes by key; `None` if absent.
    async fn get(&self, key: &str) -> JobResult<Option<Vec<u8>>>;

    /// Remove a key; absent keys are a no-op.
    async fn delete(&self, key: &str) -> JobResult<()>;

    /// All keys under a prefix.
    async fn list(&self, prefix: &str) -> JobResult<Vec<String>>;
}

/// Filesystem-backed [`ArtifactStore`] rooted at one directory.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Create a store rooted at `root` (created lazily on first put).
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map a key onto the root, refusing traversal.
    fn resolve(&self, key: &str) -> JobResult<PathBuf> {
        if key.is_empty() {
            return Err(JobError::UnsafeKey(key.to_owned()));
        }
        let rel = Path::new(key);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(JobError::UnsafeKey(key.to_owned()));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> JobResult<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> JobResult<Option<Vec<u8>>> {
        let path = self.resolve(key)?;
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> JobResult<()> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> JobResult<Vec<String>> {
        // Walk the deepest existing directory under the prefix and
        // reassemble keys relative to the root.
        let dir = self.resolve(prefix.trim_end_matches('/'))?;
        let mut keys = Vec::new();
        let mut stack = vec![dir];
        while let Some(current) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                } else if let Ok(rel) = path.strip_prefix(&self.root) {
                    keys.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        keys.sort();
        keys.retain(|k| k.starts_with(prefix));
        Ok(keys)
    }
}
