//! Object store backed by a local directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use super::ObjectStore;
use crate::error::StorageError;

/// Stores objects as files under a root directory.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    async fn prepare(&self, key: &str) -> Result<PathBuf, StorageError> {
        let path = self.path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(path)
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    fn url(&self, key: &str) -> String {
        format!("file://{}", self.path(key).display())
    }

    async fn upload_file(&self, local: &Path, key: &str) -> Result<String, StorageError> {
        let path = self.prepare(key).await?;
        fs::copy(local, &path).await?;
        Ok(self.url(key))
    }

    async fn upload_bytes(&self, bytes: &[u8], key: &str) -> Result<String, StorageError> {
        let path = self.prepare(key).await?;
        fs::write(&path, bytes).await?;
        Ok(self.url(key))
    }

    async fn exists(&self, url: &str) -> Result<bool, StorageError> {
        let path = url
            .strip_prefix("file://")
            .ok_or_else(|| StorageError::InvalidUrl(url.to_string()))?;
        Ok(fs::try_exists(path).await?)
    }
}
