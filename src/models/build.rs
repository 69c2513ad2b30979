//! # Build Context Model
//!
//! The derived, content-addressed artifact a reconcile produces: a hash over
//! the context inputs, the image tag cut from it, and where the archive
//! ended up.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Length of the image tag cut from the content hash.
pub const IMAGE_TAG_LEN: usize = 12;

/// Which blob product backs a [`StorageLocation::Blob`].
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BlobBackend {
    S3,
    Gcs,
}

impl BlobBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlobBackend::S3 => "s3",
            BlobBackend::Gcs => "gcs",
        }
    }
}

/// Where a build context archive is stored.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum StorageLocation {
    /// Inline in a ConfigMap, collected by the owner-reference cascade.
    ConfigMap { name: String },
    /// In a blob store, collected by the TTL sweep.
    Blob {
        backend: BlobBackend,
        bucket: String,
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region: Option<String>,
    },
}

/// User metadata stamped on every persisted context so sweeps and forensics
/// need no external state.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ContextMetadata {
    pub lambda_name: String,
    pub lambda_namespace: String,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

impl ContextMetadata {
    pub const KEY_NAME: &'static str = "lambda-name";
    pub const KEY_NAMESPACE: &'static str = "lambda-namespace";
    pub const KEY_CONTENT_HASH: &'static str = "content-hash";
    pub const KEY_CREATED_AT: &'static str = "created-at";

    pub fn new(name: &str, namespace: &str, content_hash: &str) -> Self {
        Self {
            lambda_name: name.to_string(),
            lambda_namespace: namespace.to_string(),
            content_hash: content_hash.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// A fabricated, stored build context.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildContext {
    /// SHA-256 over `source || dockerfile || wrapper`, hex-encoded.
    pub content_hash: String,
    /// First [`IMAGE_TAG_LEN`] hex chars of the content hash; the stable
    /// image identity.
    pub image_tag: String,
    pub storage: StorageLocation,
    pub created_at: DateTime<Utc>,
}

impl BuildContext {
    pub fn new(content_hash: String, storage: StorageLocation) -> Self {
        let image_tag = image_tag_for(&content_hash);
        Self {
            content_hash,
            image_tag,
            storage,
            created_at: Utc::now(),
        }
    }
}

/// The image tag is a pure function of the content hash.
pub fn image_tag_for(content_hash: &str) -> String {
    content_hash.chars().take(IMAGE_TAG_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_tag_is_twelve_hex_prefix() {
        let hash = "a1b2c3d4e5f60718293a4b5c6d7e8f90a1b2c3d4e5f60718293a4b5c6d7e8f90";
        let tag = image_tag_for(hash);
        assert_eq!(tag.len(), IMAGE_TAG_LEN);
        assert_eq!(tag, &hash[..12]);
        assert!(tag.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn build_context_derives_tag_from_hash() {
        let hash = "deadbeefcafe0123456789abcdef0123456789abcdef0123456789abcdef0123";
        let context = BuildContext::new(
            hash.to_string(),
            StorageLocation::ConfigMap {
                name: "echo-build-context".to_string(),
            },
        );
        assert_eq!(context.image_tag, "deadbeefcafe");
    }

    #[test]
    fn blob_backend_tags_are_stable() {
        assert_eq!(BlobBackend::S3.as_str(), "s3");
        assert_eq!(BlobBackend::Gcs.as_str(), "gcs");
    }
}
