//! # Blob Context Backend
//!
//! One implementation covers both blob products behind the typed
//! object-store client; `name()` reports which product backs it. Every
//! object is written with content-type `application/gzip` and the
//! `{lambda-name, lambda-namespace, content-hash, created-at}` user
//! metadata, so sweeps and forensics need no external state.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use object_store::aws::AmazonS3Builder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path as ObjectPath;
use object_store::{Attribute, Attributes, ObjectStore, PutOptions, PutPayload};
use tracing::{debug, warn};

use crate::config::{GcsContextConfig, S3ContextConfig};
use crate::models::{BlobBackend, ContextMetadata, StorageLocation};
use crate::{metrics, OperatorError, Result};

use super::ContextStore;

pub struct BlobContextStore {
    store: Arc<dyn ObjectStore>,
    backend: BlobBackend,
    bucket: String,
    prefix: String,
    endpoint: Option<String>,
    region: Option<String>,
}

impl BlobContextStore {
    /// S3-compatible backend; credentials come from the operator's ambient
    /// environment (IRSA, instance profile, or AWS_* variables).
    pub fn from_s3(config: &S3ContextConfig) -> Result<Self> {
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(config.bucket.clone());
        if let Some(region) = &config.region {
            builder = builder.with_region(region.clone());
        }
        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint.clone())
                .with_allow_http(endpoint.starts_with("http://"));
        }
        let store = builder
            .build()
            .map_err(|e| OperatorError::ConfigError(format!("s3 context backend: {e}")))?;
        Ok(Self {
            store: Arc::new(store),
            backend: BlobBackend::S3,
            bucket: config.bucket.clone(),
            prefix: config.prefix.clone(),
            endpoint: config.endpoint.clone(),
            region: config.region.clone(),
        })
    }

    /// GCS backend; workload identity by default.
    pub fn from_gcs(config: &GcsContextConfig) -> Result<Self> {
        let store = GoogleCloudStorageBuilder::from_env()
            .with_bucket_name(config.bucket.clone())
            .build()
            .map_err(|e| OperatorError::ConfigError(format!("gcs context backend: {e}")))?;
        Ok(Self {
            store: Arc::new(store),
            backend: BlobBackend::Gcs,
            bucket: config.bucket.clone(),
            prefix: config.prefix.clone(),
            endpoint: None,
            region: None,
        })
    }

    /// Wrap an existing store; used by tests with the in-memory store.
    pub fn with_store(
        store: Arc<dyn ObjectStore>,
        backend: BlobBackend,
        bucket: &str,
        prefix: &str,
        endpoint: Option<String>,
        region: Option<String>,
    ) -> Self {
        Self {
            store,
            backend,
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
            endpoint,
            region,
        }
    }

    fn object_path(&self, key: &str) -> ObjectPath {
        ObjectPath::from(format!("{}/{}", self.prefix, key))
    }

    /// Sweep objects older than `older_than`, skipping any whose key still
    /// carries a content hash in `keep_hashes`. Per-object failures are
    /// counted and the sweep continues.
    pub async fn sweep(&self, older_than: Duration, keep_hashes: &HashSet<String>) -> Result<usize> {
        let cutoff = Utc::now() - older_than;
        let prefix = ObjectPath::from(self.prefix.clone());
        let mut listing = self.store.list(Some(&prefix));
        let mut deleted = 0usize;

        while let Some(entry) = listing.next().await {
            let meta = match entry {
                Ok(meta) => meta,
                Err(err) => {
                    warn!(backend = self.name(), "context sweep listing error: {err}");
                    metrics::record_error("context-sweep", crate::ErrorKind::Internal);
                    continue;
                }
            };
            if meta.last_modified >= cutoff {
                continue;
            }
            let key = meta.location.to_string();
            if keep_hashes.iter().any(|hash| key.contains(hash)) {
                debug!(object = %key, "context still referenced, skipping sweep");
                continue;
            }
            match self.store.delete(&meta.location).await {
                Ok(()) => deleted += 1,
                Err(err) => {
                    warn!(object = %key, "context sweep delete failed: {err}");
                    metrics::record_error("context-sweep", crate::ErrorKind::Internal);
                }
            }
        }

        Ok(deleted)
    }
}

#[async_trait]
impl ContextStore for BlobContextStore {
    async fn save(
        &self,
        key: &str,
        archive: &[u8],
        meta: &ContextMetadata,
        _owner: Option<&OwnerReference>,
    ) -> Result<StorageLocation> {
        let path = self.object_path(key);

        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, "application/gzip".into());
        attributes.insert(
            Attribute::Metadata(ContextMetadata::KEY_NAME.into()),
            meta.lambda_name.clone().into(),
        );
        attributes.insert(
            Attribute::Metadata(ContextMetadata::KEY_NAMESPACE.into()),
            meta.lambda_namespace.clone().into(),
        );
        attributes.insert(
            Attribute::Metadata(ContextMetadata::KEY_CONTENT_HASH.into()),
            meta.content_hash.clone().into(),
        );
        attributes.insert(
            Attribute::Metadata(ContextMetadata::KEY_CREATED_AT.into()),
            meta.created_at.to_rfc3339().into(),
        );

        let options = PutOptions {
            attributes,
            ..Default::default()
        };

        self.store
            .put_opts(&path, PutPayload::from(archive.to_vec()), options)
            .await
            .map_err(|e| OperatorError::DownloadError(format!("put {path}: {e}")))?;

        debug!(
            backend = self.name(),
            object = %path,
            bytes = archive.len(),
            "stored build context blob"
        );

        Ok(StorageLocation::Blob {
            backend: self.backend,
            bucket: self.bucket.clone(),
            key: path.to_string(),
            endpoint: self.endpoint.clone(),
            region: self.region.clone(),
        })
    }

    async fn cleanup(&self, older_than: Duration) -> Result<usize> {
        self.sweep(older_than, &HashSet::new()).await
    }

    fn name(&self) -> &'static str {
        self.backend.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn test_store() -> BlobContextStore {
        BlobContextStore::with_store(
            Arc::new(InMemory::new()),
            BlobBackend::S3,
            "contexts",
            "build-contexts",
            Some("http://minio.storage:9000".to_string()),
            None,
        )
    }

    fn meta(hash: &str) -> ContextMetadata {
        ContextMetadata::new("echo", "default", hash)
    }

    #[tokio::test]
    async fn save_returns_a_blob_location_under_the_prefix() {
        let store = test_store();
        let location = store
            .save(
                "default/echo/deadbeefcafe.tar.gz",
                b"archive",
                &meta("deadbeefcafe"),
                None,
            )
            .await
            .unwrap();
        match location {
            StorageLocation::Blob {
                backend,
                bucket,
                key,
                endpoint,
                ..
            } => {
                assert_eq!(backend, BlobBackend::S3);
                assert_eq!(bucket, "contexts");
                assert_eq!(key, "build-contexts/default/echo/deadbeefcafe.tar.gz");
                assert_eq!(endpoint.as_deref(), Some("http://minio.storage:9000"));
            }
            other => panic!("expected blob location, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn save_is_idempotent_at_fixed_content() {
        let store = test_store();
        let key = "default/echo/deadbeefcafe.tar.gz";
        let first = store.save(key, b"archive", &meta("deadbeefcafe"), None).await.unwrap();
        let second = store.save(key, b"archive", &meta("deadbeefcafe"), None).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn sweep_deletes_only_aged_unreferenced_objects() {
        let store = test_store();
        store
            .save("default/echo/aaaa.tar.gz", b"old", &meta("aaaa"), None)
            .await
            .unwrap();
        store
            .save("default/echo/bbbb.tar.gz", b"kept", &meta("bbbb"), None)
            .await
            .unwrap();

        // Nothing is older than a day yet.
        let deleted = store.sweep(Duration::hours(24), &HashSet::new()).await.unwrap();
        assert_eq!(deleted, 0);

        // With a cutoff in the future everything qualifies by age; the
        // referenced hash survives.
        let keep: HashSet<String> = [String::from("bbbb")].into_iter().collect();
        let deleted = store.sweep(Duration::seconds(-60), &keep).await.unwrap();
        assert_eq!(deleted, 1);

        let remaining = store
            .store
            .list(Some(&ObjectPath::from("build-contexts")))
            .collect::<Vec<_>>()
            .await;
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0]
            .as_ref()
            .unwrap()
            .location
            .to_string()
            .contains("bbbb"));
    }

    #[tokio::test]
    async fn cleanup_matches_sweep_without_exclusions() {
        let store = test_store();
        store
            .save("default/echo/cccc.tar.gz", b"old", &meta("cccc"), None)
            .await
            .unwrap();
        let deleted = store.cleanup(Duration::seconds(-60)).await.unwrap();
        assert_eq!(deleted, 1);
    }
}
