//! Object storage (S3-compatible, e.g. MinIO)

use async_trait::async_trait;
use neurodx_common::config::StorageConfig;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use std::path::Path;
use thiserror::Error;

const ARTIFACT_CONTENT_TYPE: &str = "image/png";

#[derive(Debug, Error)]
pub enum StorageError {
    /// Client could not be built from the configuration
    #[error("Storage configuration error: {0}")]
    Config(String),

    #[error("Download of {key} failed: {reason}")]
    Download { key: String, reason: String },

    #[error("Upload of {key} failed: {reason}")]
    Upload { key: String, reason: String },

    /// Local file could not be read or written
    #[error("Storage IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Single-bucket object store
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch `key` into the local file `dest`
    async fn download(&self, key: &str, dest: &Path) -> Result<(), StorageError>;

    /// Store the local file `src` under `key`
    async fn upload(&self, src: &Path, key: &str) -> Result<(), StorageError>;
}

pub struct S3ObjectStore {
    bucket: Box<Bucket>,
}

impl S3ObjectStore {
    /// Path-style client for the configured endpoint
    pub fn new(config: &StorageConfig) -> Result<Self, StorageError> {
        let credentials = Credentials::new(
            Some(&config.access_key),
            Some(&config.secret_key),
            None,
            None,
            None,
        )
        .map_err(|e| StorageError::Config(e.to_string()))?;

        let region = Region::Custom {
            region: config.region.clone(),
            endpoint: config.endpoint_url(),
        };

        let bucket = Bucket::new(&config.bucket, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?
            .with_path_style();

        tracing::info!(
            endpoint = %config.endpoint_url(),
            bucket = %config.bucket,
            "Object store configured"
        );

        Ok(Self { bucket })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn download(&self, key: &str, dest: &Path) -> Result<(), StorageError> {
        let response = self
            .bucket
            .get_object(key)
            .await
            .map_err(|e| StorageError::Download {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, response.bytes()).await?;

        tracing::debug!(key, dest = %dest.display(), bytes = response.bytes().len(), "Object downloaded");
        Ok(())
    }

    async fn upload(&self, src: &Path, key: &str) -> Result<(), StorageError> {
        let content = tokio::fs::read(src).await?;
        self.bucket
            .put_object_with_content_type(key, &content, ARTIFACT_CONTENT_TYPE)
            .await
            .map_err(|e| StorageError::Upload {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        tracing::debug!(key, src = %src.display(), bytes = content.len(), "Object uploaded");
        Ok(())
    }
}
