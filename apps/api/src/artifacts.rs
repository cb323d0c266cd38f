//! Durable storage for submission artifacts (screenshots, attempt logs).
//!
//! Screenshots go to S3 when a bucket is configured, otherwise they stay on
//! local disk under `ARTIFACT_DIR`. The returned location is what gets
//! recorded in the Application's artifact log.

use std::path::PathBuf;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("S3 error: {0}")]
    S3(String),
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Stores `bytes` under `key` and returns the location to record.
    async fn put(&self, key: &str, content_type: &str, bytes: Bytes) -> Result<String, ArtifactError>;
}

pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put(&self, key: &str, _content_type: &str, bytes: Bytes) -> Result<String, ArtifactError> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &bytes).await?;
        debug!(path = %path.display(), "Artifact written");
        Ok(path.to_string_lossy().into_owned())
    }
}

pub struct S3ArtifactStore {
    client: S3Client,
    bucket: String,
}

impl S3ArtifactStore {
    pub fn new(client: S3Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    async fn put(&self, key: &str, content_type: &str, bytes: Bytes) -> Result<String, ArtifactError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| ArtifactError::S3(format!("upload of {key} failed: {e}")))?;
        Ok(format!("s3://{}/{}", self.bucket, key))
    }
}
