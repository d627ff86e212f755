//! S3-based snapshot storage backend.
//!
//! This module provides remote snapshot storage on AWS S3 (or compatible
//! services), typically used as the backup endpoint of a local primary.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::Client;
use tracing::{debug, info};

use crate::error::{LeaseError, Result, StorageError};

use super::store::SnapshotStore;
use super::types::InventorySnapshot;

/// Snapshot object key suffix.
const SNAPSHOT_KEY: &str = "inventory.json";

/// Marker object written to check write access, next to the snapshot.
const WRITE_CHECK_KEY: &str = ".write-check";

/// S3-based snapshot store.
#[derive(Debug, Clone)]
pub struct S3SnapshotStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix.
    prefix: String,
}

impl S3SnapshotStore {
    /// Creates a new S3 snapshot store using the ambient AWS configuration.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region_str) = region {
            loader = loader.region(Region::new(region_str.to_string()));
        }
        let config = loader.load().await;

        Self::with_client(Client::new(&config), bucket, prefix)
    }

    /// Creates a new S3 snapshot store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    /// Gets the full S3 key of the snapshot.
    fn key(&self) -> String {
        format!("{}{SNAPSHOT_KEY}", self.prefix)
    }

    /// Gets the full S3 key of the write-access marker.
    fn write_check_key(&self) -> String {
        format!("{}{WRITE_CHECK_KEY}", self.prefix)
    }

    /// Gets an object from S3.
    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let bytes = response.body.collect().await.map_err(|e| {
                    StorageError::s3(format!("Failed to read S3 object: {e}"))
                })?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    LeaseError::Storage(StorageError::Corrupted {
                        message: format!("Invalid UTF-8 in S3 object: {e}"),
                    })
                })?;

                Ok(Some(content))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StorageError::s3(format!("S3 get error: {service_err}")).into())
                }
            }
        }
    }

    /// Puts an object to S3.
    async fn put_object(&self, key: &str, content: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| StorageError::s3(format!("S3 put error: {e}")))?;

        Ok(())
    }

    /// Checks if an object exists in S3.
    async fn object_exists(&self, key: &str) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(StorageError::s3(format!("S3 head error: {service_err}")).into())
                }
            }
        }
    }
}

/// Normalizes a key prefix to either empty or `segment/`.
fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

#[async_trait]
impl SnapshotStore for S3SnapshotStore {
    async fn load(&self) -> Result<Option<InventorySnapshot>> {
        let key = self.key();
        debug!("Loading snapshot from s3://{}/{key}", self.bucket);

        let Some(json) = self.get_object(&key).await? else {
            debug!("No snapshot found in S3");
            return Ok(None);
        };

        let snapshot: InventorySnapshot = serde_json::from_str(&json).map_err(|e| {
            LeaseError::Storage(StorageError::Corrupted {
                message: format!("Failed to parse snapshot: {e}"),
            })
        })?;

        info!("Loaded snapshot with {} GPUs from S3", snapshot.gpus.len());
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &InventorySnapshot) -> Result<()> {
        let key = self.key();
        debug!("Saving snapshot to s3://{}/{key}", self.bucket);

        let content = serde_json::to_string_pretty(snapshot).map_err(|e| {
            StorageError::serialization(format!("Failed to serialize snapshot: {e}"))
        })?;

        self.put_object(&key, &content).await?;

        debug!("Snapshot saved successfully to S3");
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        self.object_exists(&self.key()).await
    }

    /// The snapshot object must exist and the prefix must accept a write.
    ///
    /// Write access is checked by overwriting a small marker object, never
    /// the snapshot itself.
    async fn check_available(&self) -> Result<()> {
        if !self.object_exists(&self.key()).await? {
            return Err(
                StorageError::s3(format!("Snapshot object missing: {}", self.location())).into(),
            );
        }

        let marker = self.write_check_key();
        self.put_object(&marker, "{}").await.map_err(|e| {
            StorageError::s3(format!("s3://{}/{marker} is not writable: {e}", self.bucket))
        })?;
        Ok(())
    }

    fn location(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key())
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::config::retry::RetryConfig;
    use aws_sdk_s3::config::{Builder, Credentials};

    fn unreachable_store(prefix: Option<&str>) -> S3SnapshotStore {
        let config = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .credentials_provider(Credentials::new("test", "test", None, None, "test"))
            .endpoint_url("http://127.0.0.1:1")
            .force_path_style(true)
            .retry_config(RetryConfig::disabled())
            .build();
        S3SnapshotStore::with_client(Client::from_conf(config), "fleet", prefix)
    }

    #[test]
    fn test_write_check_never_touches_snapshot() {
        let store = unreachable_store(Some("prod"));
        assert_eq!(store.key(), "prod/inventory.json");
        assert_eq!(store.write_check_key(), "prod/.write-check");
        assert_eq!(store.location(), "s3://fleet/prod/inventory.json");
    }

    #[tokio::test]
    async fn test_unreachable_bucket_is_unavailable() {
        let store = unreachable_store(None);
        let err = store.check_available().await.expect_err("should fail");
        assert!(matches!(err, LeaseError::Storage(StorageError::S3 { .. })));
    }

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix(None), "");
        assert_eq!(normalize_prefix(Some("")), "");
        assert_eq!(normalize_prefix(Some("/")), "");
        assert_eq!(normalize_prefix(Some("prod")), "prod/");
        assert_eq!(normalize_prefix(Some("/fleet/prod/")), "fleet/prod/");
    }
}
