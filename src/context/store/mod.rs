//! # Context Store
//!
//! Three backends persist build-context archives behind one contract:
//! `save` / `cleanup` / `name`. Backend selection is size- and
//! policy-driven: an explicit annotation wins, otherwise archives at or
//! under 768 KiB go inline into a ConfigMap and larger ones to the first
//! configured blob backend (S3 preferred over GCS).

pub mod blob;
pub mod configmap;

use async_trait::async_trait;
use chrono::Duration;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

use crate::config::OperatorConfig;
use crate::models::{ContextMetadata, StorageLocation};
use crate::{OperatorError, Result};

pub use blob::BlobContextStore;
pub use configmap::ConfigMapContextStore;

/// Largest archive the inline ConfigMap backend accepts. Oversize writes
/// are refused, never truncated.
pub const MAX_CONFIGMAP_CONTEXT_BYTES: usize = 768 * 1024;

/// Common contract over the storage backends.
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Persist an archive. Saves are idempotent at fixed content: the key
    /// is content-addressed, so re-writing the same bytes is a no-op at the
    /// store level.
    async fn save(
        &self,
        key: &str,
        archive: &[u8],
        meta: &ContextMetadata,
        owner: Option<&OwnerReference>,
    ) -> Result<StorageLocation>;

    /// Delete stored contexts older than `older_than`; returns how many
    /// were removed. The inline backend is a no-op (the owner-reference
    /// cascade collects it).
    async fn cleanup(&self, older_than: Duration) -> Result<usize>;

    /// Backend tag: `configmap`, `s3` or `gcs`.
    fn name(&self) -> &'static str;
}

/// The configured backends plus the selection rule.
pub struct ContextStoreSet {
    configmap: ConfigMapContextStore,
    s3: Option<BlobContextStore>,
    gcs: Option<BlobContextStore>,
}

impl ContextStoreSet {
    pub fn new(client: kube::Client, config: &OperatorConfig) -> Result<Self> {
        let s3 = config
            .s3_context
            .as_ref()
            .map(BlobContextStore::from_s3)
            .transpose()?;
        let gcs = config
            .gcs_context
            .as_ref()
            .map(BlobContextStore::from_gcs)
            .transpose()?;
        Ok(Self {
            configmap: ConfigMapContextStore::new(client),
            s3,
            gcs,
        })
    }

    #[cfg(test)]
    pub fn for_tests(
        configmap: ConfigMapContextStore,
        s3: Option<BlobContextStore>,
        gcs: Option<BlobContextStore>,
    ) -> Self {
        Self { configmap, s3, gcs }
    }

    /// Pick a backend for an archive.
    ///
    /// An explicit annotation is honored (the ConfigMap backend will still
    /// refuse an oversize write at save time); without one, size decides.
    pub fn select(&self, annotation: Option<&str>, archive_len: usize) -> Result<&dyn ContextStore> {
        match annotation {
            Some("configmap") => Ok(&self.configmap),
            Some("s3") => self
                .s3
                .as_ref()
                .map(|s| s as &dyn ContextStore)
                .ok_or_else(|| {
                    OperatorError::ConfigError("s3 context backend is not configured".to_string())
                }),
            Some("gcs") => self
                .gcs
                .as_ref()
                .map(|s| s as &dyn ContextStore)
                .ok_or_else(|| {
                    OperatorError::ConfigError("gcs context backend is not configured".to_string())
                }),
            Some(other) => Err(OperatorError::ValidationRejected(format!(
                "unknown build-context storage backend {:?}",
                other
            ))),
            None => {
                if archive_len <= MAX_CONFIGMAP_CONTEXT_BYTES {
                    Ok(&self.configmap)
                } else if let Some(s3) = &self.s3 {
                    Ok(s3 as &dyn ContextStore)
                } else if let Some(gcs) = &self.gcs {
                    Ok(gcs as &dyn ContextStore)
                } else {
                    Err(OperatorError::ConfigError(format!(
                        "archive is {archive_len} bytes and no blob backend is configured"
                    )))
                }
            }
        }
    }

    /// The blob backends, for the TTL sweeper.
    pub fn blob_stores(&self) -> Vec<&BlobContextStore> {
        self.s3.iter().chain(self.gcs.iter()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BlobBackend;
    use object_store::memory::InMemory;
    use std::sync::Arc;

    fn set_with(s3: bool, gcs: bool) -> ContextStoreSet {
        let blob = |backend| {
            BlobContextStore::with_store(
                Arc::new(InMemory::new()),
                backend,
                "contexts",
                "build-contexts",
                None,
                None,
            )
        };
        ContextStoreSet::for_tests(
            ConfigMapContextStore::for_tests(),
            s3.then(|| blob(BlobBackend::S3)),
            gcs.then(|| blob(BlobBackend::Gcs)),
        )
    }

    #[test]
    fn small_archives_select_configmap() {
        let set = set_with(true, true);
        let store = set.select(None, MAX_CONFIGMAP_CONTEXT_BYTES).unwrap();
        assert_eq!(store.name(), "configmap");
    }

    #[test]
    fn oversize_archives_select_s3_over_gcs() {
        let set = set_with(true, true);
        let store = set.select(None, MAX_CONFIGMAP_CONTEXT_BYTES + 1).unwrap();
        assert_eq!(store.name(), "s3");
    }

    #[test]
    fn gcs_is_the_fallback_blob_backend() {
        let set = set_with(false, true);
        let store = set.select(None, MAX_CONFIGMAP_CONTEXT_BYTES + 1).unwrap();
        assert_eq!(store.name(), "gcs");
    }

    #[test]
    fn oversize_without_blob_backend_is_config_error() {
        let set = set_with(false, false);
        let err = set
            .select(None, MAX_CONFIGMAP_CONTEXT_BYTES + 1)
            .map(|s| s.name())
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ConfigError);
    }

    #[test]
    fn annotation_overrides_size_based_selection() {
        let set = set_with(true, false);
        let store = set.select(Some("s3"), 10).unwrap();
        assert_eq!(store.name(), "s3");
        let store = set.select(Some("configmap"), 10).unwrap();
        assert_eq!(store.name(), "configmap");
    }

    #[test]
    fn unknown_annotation_is_rejected() {
        let set = set_with(true, true);
        let err = set.select(Some("floppy"), 10).map(|s| s.name()).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ValidationRejected);
    }

    #[test]
    fn annotated_backend_must_be_configured() {
        let set = set_with(false, false);
        let err = set.select(Some("gcs"), 10).map(|s| s.name()).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ConfigError);
    }
}
