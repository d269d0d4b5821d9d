use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::{Client, presigning::PresigningConfig};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object store put failed: {0}")]
    Put(String),
    #[error("object store delete failed: {0}")]
    Delete(String),
    #[error("object store presign failed: {0}")]
    Presign(String),
}

/// Capability interface the rest of the crate depends on; a tagged variant
/// per backend rather than a trait object, matching the in-flight map
/// pattern the teacher uses for `SSLProvider` and `DnsResolver`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<(), ObjectStoreError>;
    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError>;
    async fn presign(&self, key: &str, expiry: Duration) -> Result<String, ObjectStoreError>;
}

#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn from_env(bucket: String) -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self {
            client: Client::new(&config),
            bucket,
        }
    }

    pub fn new(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<(), ObjectStoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(bytes.to_vec().into())
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Put(e.to_string()))?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Delete(e.to_string()))?;

        Ok(())
    }

    async fn presign(&self, key: &str, expiry: Duration) -> Result<String, ObjectStoreError> {
        let presigning_config = PresigningConfig::expires_in(expiry)
            .map_err(|e| ObjectStoreError::Presign(e.to_string()))?;

        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| ObjectStoreError::Presign(e.to_string()))?;

        Ok(request.uri().to_string())
    }
}
