//! S3 object store driven through the `aws` CLI.

use std::io::Write;
use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use super::ObjectStore;
use crate::aws::{args, AwsCli};
use crate::error::StorageError;
use crate::remote::shell_quote;

#[derive(Debug, Clone)]
pub struct S3Store {
    cli: AwsCli,
    bucket: String,
}

impl S3Store {
    pub fn new(cli: AwsCli, bucket: impl Into<String>) -> Self {
        Self {
            cli,
            bucket: bucket.into(),
        }
    }

    fn base_url(&self) -> String {
        format!("https://{}.s3.amazonaws.com/", self.bucket)
    }

    fn s3_uri(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }

    /// The key an `https://` URL of this bucket points at.
    pub fn key_from_url(&self, url: &str) -> Result<String, StorageError> {
        let path = url
            .strip_prefix(&self.base_url())
            .ok_or_else(|| StorageError::InvalidUrl(url.to_string()))?;
        path.split('/')
            .map(|segment| {
                urlencoding::decode(segment)
                    .map(|s| s.into_owned())
                    .map_err(|_| StorageError::InvalidUrl(url.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(|segments| segments.join("/"))
    }

    async fn copy(&self, local: &Path, key: &str) -> Result<String, StorageError> {
        let from = local.display().to_string();
        let to = self.s3_uri(key);
        let output = self
            .cli
            .run(&args(["s3", "cp", "--only-show-errors", from.as_str(), to.as_str()]))
            .await?;
        if !output.success {
            return Err(StorageError::UploadFailed {
                bucket: self.bucket.clone(),
                key: key.to_string(),
                reason: output.stderr,
            });
        }
        debug!(bucket = %self.bucket, key = %key, "Uploaded object");
        Ok(self.url(key))
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn url(&self, key: &str) -> String {
        let encoded: Vec<String> = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!("{}{}", self.base_url(), encoded.join("/"))
    }

    async fn upload_file(&self, local: &Path, key: &str) -> Result<String, StorageError> {
        self.copy(local, key).await
    }

    async fn upload_bytes(&self, bytes: &[u8], key: &str) -> Result<String, StorageError> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(bytes)?;
        file.flush()?;
        self.copy(file.path(), key).await
    }

    async fn exists(&self, url: &str) -> Result<bool, StorageError> {
        let key = self.key_from_url(url)?;
        let output = self
            .cli
            .run(&args([
                "s3api",
                "head-object",
                "--bucket",
                self.bucket.as_str(),
                "--key",
                key.as_str(),
            ]))
            .await?;
        if output.success {
            return Ok(true);
        }
        if output.stderr.contains("404") || output.stderr.contains("Not Found") {
            return Ok(false);
        }
        Err(StorageError::ExistsFailed {
            url: url.to_string(),
            reason: output.stderr,
        })
    }

    fn remote_upload_command(&self, remote_path: &str, key: &str) -> Option<String> {
        Some(format!(
            "aws s3 cp --only-show-errors {} {}",
            shell_quote(remote_path),
            shell_quote(&self.s3_uri(key))
        ))
    }
}
