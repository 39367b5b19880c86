use std::path::{Path, PathBuf};

use tonic::async_trait;

/// Shared object store used to fetch and persist small files (eg, the
/// post-start hook script). Returns `false` on any failure; callers treat a
/// missing object the same as a fetch error.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, bucket: &str, key: &str, local_path: &Path) -> bool;
    async fn put(&self, bucket: &str, key: &str, local_path: &Path) -> bool;
}

/// Filesystem-backed store: objects live under `<root>/<bucket>/<key>`.
///
/// Stands in for the cloud bucket in development and tests; the cloud-backed
/// implementation is supplied by the hosting application.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key)
    }
}

#[async_trait]
impl ObjectStore for DirStore {
    async fn get(&self, bucket: &str, key: &str, local_path: &Path) -> bool {
        let src = self.object_path(bucket, key);
        match tokio::fs::copy(&src, local_path).await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(bucket, key, error = %e, "Object fetch failed");
                false
            }
        }
    }

    async fn put(&self, bucket: &str, key: &str, local_path: &Path) -> bool {
        let dst = self.object_path(bucket, key);
        if let Some(parent) = dst.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                tracing::warn!(bucket, key, error = %e, "Object store unavailable");
                return false;
            }
        }
        match tokio::fs::copy(local_path, &dst).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(bucket, key, error = %e, "Object upload failed");
                false
            }
        }
    }
}
