//! Object storage for job inputs and outputs.
//!
//! Keys are `/`-separated. Outputs of a job live under
//! `jobs/<job_id>/outputs/`, staged inputs under `jobs/<job_id>/inputs/`.
//! [`FsObjectStore`] serves the Docker backend from local disk;
//! [`S3ObjectStore`] is a bucket that Kubernetes pods can reach as well.

mod s3;

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::{RunnerConfig, S3Config};
use crate::error::ExecutorError;

pub use s3::S3ObjectStore;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>, ExecutorError>;

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), ExecutorError>;

    async fn exists(&self, key: &str) -> Result<bool, ExecutorError>;

    /// Keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, ExecutorError>;

    /// The bucket behind this store, if containers can address it directly.
    fn bucket(&self) -> Option<&S3Config> {
        None
    }
}

/// Open the store named by the configuration: the `[s3]` bucket when set,
/// otherwise a directory under `storage_root`.
pub async fn open(config: &RunnerConfig) -> Arc<dyn ObjectStore> {
    match &config.s3 {
        Some(s3) => {
            tracing::info!(bucket = %s3.bucket, endpoint = ?s3.endpoint, "Using S3 object store");
            Arc::new(S3ObjectStore::connect(s3.clone()).await)
        }
        None => {
            tracing::info!(root = %config.storage_root.display(), "Using local object store");
            Arc::new(FsObjectStore::new(config.storage_root.clone()))
        }
    }
}

/// Bucket coordinates handed to containers that move their own data.
pub fn bucket_environment(bucket: &S3Config) -> Vec<(String, String)> {
    let mut env = vec![("STORAGE_BUCKET".to_string(), bucket.bucket.clone())];
    if let Some(endpoint) = &bucket.endpoint {
        env.push(("STORAGE_ENDPOINT".to_string(), endpoint.clone()));
    }
    if let Some(region) = &bucket.region {
        env.push(("AWS_REGION".to_string(), region.clone()));
    }
    env
}

pub fn input_prefix(job_id: Uuid) -> String {
    format!("jobs/{job_id}/inputs/")
}

pub fn output_prefix(job_id: Uuid) -> String {
    format!("jobs/{job_id}/outputs/")
}

pub fn output_key(job_id: Uuid, path: &str) -> String {
    format!("{}{}", output_prefix(job_id), path.trim_start_matches('/'))
}

pub fn input_key(job_id: Uuid, path: &str) -> String {
    format!("{}{}", input_prefix(job_id), path.trim_start_matches('/'))
}

/// Validate a relative path declared by a job. Absolute paths and `..` are
/// rejected so a job cannot escape its mount.
pub fn safe_relative_path(path: &str) -> Result<PathBuf, ExecutorError> {
    let candidate = Path::new(path);
    let mut clean = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => {
                return Err(ExecutorError::InvalidSpec(format!(
                    "path must be relative and stay inside its mount: {path}"
                )))
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(ExecutorError::InvalidSpec("empty path".into()));
    }
    Ok(clean)
}

/// Object store backed by a local directory.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, ExecutorError> {
        Ok(self.root.join(safe_relative_path(key)?))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, ExecutorError> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| ExecutorError::Storage(format!("get {key}: {e}")))
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), ExecutorError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ExecutorError::Storage(format!("put {key}: {e}")))?;
        }
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| ExecutorError::Storage(format!("put {key}: {e}")))
    }

    async fn exists(&self, key: &str) -> Result<bool, ExecutorError> {
        let path = self.path_for(key)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| ExecutorError::Storage(format!("stat {key}: {e}")))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ExecutorError> {
        let storage_err = |e: std::io::Error| ExecutorError::Storage(format!("list {prefix}: {e}"));
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(storage_err(e)),
            };
            while let Some(entry) = entries.next_entry().await.map_err(storage_err)? {
                let path = entry.path();
                if entry.file_type().await.map_err(storage_err)?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(rel) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}
