//! Durable artifact storage.
//!
//! Status documents, request records, per-job inputs, logs and output
//! bundles are published to an [`ObjectStore`] under the key layout in
//! [`keys`]. Two stores ship with the crate:
//! - **S3**: uploads through the `aws` CLI; public `https://` URLs
//! - **Local**: a directory tree on disk; `file://` URLs

pub mod keys;
pub mod local;
pub mod s3;

use std::path::Path;

use async_trait::async_trait;

use crate::error::StorageError;

pub use local::LocalStore;
pub use s3::S3Store;

/// A bucket of objects addressed by key.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Public URL of the object at `key`.
    fn url(&self, key: &str) -> String;

    /// Upload a local file, returning its URL.
    async fn upload_file(&self, local: &Path, key: &str) -> Result<String, StorageError>;

    /// Upload an in-memory object, returning its URL.
    async fn upload_bytes(&self, bytes: &[u8], key: &str) -> Result<String, StorageError>;

    /// Whether an object exists at `url`.
    async fn exists(&self, url: &str) -> Result<bool, StorageError>;

    /// A shell command that uploads `remote_path` on a worker directly to
    /// `key`, if the store is reachable from workers.
    fn remote_upload_command(&self, remote_path: &str, key: &str) -> Option<String> {
        let _ = (remote_path, key);
        None
    }
}

/// Serialize `value` as pretty JSON and upload it.
pub async fn upload_json<T: serde::Serialize + ?Sized>(
    store: &dyn ObjectStore,
    value: &T,
    key: &str,
) -> Result<String, StorageError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    store.upload_bytes(&bytes, key).await
}
