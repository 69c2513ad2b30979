//! # Object-Store Fetchers (S3-compatible, GCS)
//!
//! Both blob products are reached through the same typed client. A key with
//! a trailing slash is treated as a directory: the fetcher lists it and
//! picks the language's conventional filename. Size is checked via a `head`
//! before the body is pulled, enforcing the 50 MiB cap without a partial
//! download.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectMeta, ObjectStore};

use crate::models::{GcsSource, Language, S3Source};
use crate::{OperatorError, Result};

use super::{secrets, validate, FetchedSource, MAX_SOURCE_BYTES};

/// Map object-store failures onto the kind taxonomy. The client folds HTTP
/// status into its error text, so auth is recognized by message.
fn map_store_err(err: object_store::Error, what: &str) -> OperatorError {
    match err {
        object_store::Error::NotFound { .. } => {
            OperatorError::NotFound(format!("{what} does not exist"))
        }
        other => {
            let msg = other.to_string();
            if msg.contains("403")
                || msg.contains("401")
                || msg.contains("AccessDenied")
                || msg.contains("Forbidden")
                || msg.contains("SignatureDoesNotMatch")
            {
                OperatorError::AuthFailed(format!("{what}: {msg}"))
            } else {
                OperatorError::DownloadError(format!("{what}: {msg}"))
            }
        }
    }
}

pub(crate) fn build_s3_store(
    spec: &S3Source,
    secret: Option<&BTreeMap<String, Vec<u8>>>,
) -> Result<Arc<dyn ObjectStore>> {
    let mut builder = AmazonS3Builder::new()
        .with_bucket_name(spec.bucket.clone())
        .with_region(spec.region.clone().unwrap_or_else(|| "us-east-1".to_string()));
    if let Some(endpoint) = &spec.endpoint {
        builder = builder
            .with_endpoint(endpoint.clone())
            .with_allow_http(endpoint.starts_with("http://"));
    }
    if let Some(data) = secret {
        let (access_key, secret_key) = secrets::s3_credentials(data)?;
        builder = builder
            .with_access_key_id(access_key)
            .with_secret_access_key(secret_key);
    }
    let store = builder
        .build()
        .map_err(|e| OperatorError::ConfigError(format!("s3 client: {e}")))?;
    Ok(Arc::new(store))
}

pub(crate) fn build_gcs_store(
    spec: &GcsSource,
    secret: Option<&BTreeMap<String, Vec<u8>>>,
) -> Result<Arc<dyn ObjectStore>> {
    let mut builder = GoogleCloudStorageBuilder::new().with_bucket_name(spec.bucket.clone());
    // Workload identity is the default; a secret-carried JSON key overrides
    // it. No temp files: the key is handed to the client in memory.
    if let Some(json) = secret.and_then(secrets::gcs_service_account) {
        builder = builder.with_service_account_key(json);
    }
    let store = builder
        .build()
        .map_err(|e| OperatorError::ConfigError(format!("gcs client: {e}")))?;
    Ok(Arc::new(store))
}

pub async fn fetch_s3(
    spec: &S3Source,
    language: Language,
    secret: Option<&BTreeMap<String, Vec<u8>>>,
) -> Result<FetchedSource> {
    validate::bucket(&spec.bucket)?;
    validate::object_key(&spec.key)?;
    let store = build_s3_store(spec, secret)?;
    fetch_from_store(store, &spec.key, language).await
}

pub async fn fetch_gcs(
    spec: &GcsSource,
    language: Language,
    secret: Option<&BTreeMap<String, Vec<u8>>>,
) -> Result<FetchedSource> {
    validate::bucket(&spec.bucket)?;
    validate::object_key(&spec.key)?;
    let store = build_gcs_store(spec, secret)?;
    fetch_from_store(store, &spec.key, language).await
}

/// Shared fetch path once a store client exists.
pub(crate) async fn fetch_from_store(
    store: Arc<dyn ObjectStore>,
    key: &str,
    language: Language,
) -> Result<FetchedSource> {
    let location = if key.ends_with('/') {
        find_in_directory(store.as_ref(), key, language).await?
    } else {
        ObjectPath::from(key)
    };

    let meta = store
        .head(&location)
        .await
        .map_err(|e| map_store_err(e, &format!("object {location}")))?;
    check_size(&meta)?;

    let bytes = store
        .get(&location)
        .await
        .map_err(|e| map_store_err(e, &format!("object {location}")))?
        .bytes()
        .await
        .map_err(|e| map_store_err(e, &format!("object {location}")))?;

    let filename = location
        .filename()
        .unwrap_or(language.source_filename())
        .to_string();
    Ok(FetchedSource {
        bytes: bytes.to_vec(),
        filename,
        language,
    })
}

fn check_size(meta: &ObjectMeta) -> Result<()> {
    if meta.size as u64 > MAX_SOURCE_BYTES {
        return Err(OperatorError::DownloadError(format!(
            "object {} is {} bytes, over the {} byte cap",
            meta.location, meta.size, MAX_SOURCE_BYTES
        )));
    }
    Ok(())
}

/// List a directory-style key and pick the conventional filename for the
/// language.
async fn find_in_directory(
    store: &dyn ObjectStore,
    key: &str,
    language: Language,
) -> Result<ObjectPath> {
    let wanted = language.source_filename();
    let prefix = ObjectPath::from(key.trim_end_matches('/'));
    let mut entries = store.list(Some(&prefix));
    while let Some(entry) = entries.next().await {
        let meta = entry.map_err(|e| map_store_err(e, &format!("listing {key}")))?;
        if meta.location.filename() == Some(wanted) {
            return Ok(meta.location);
        }
    }
    Err(OperatorError::NotFound(format!(
        "no {wanted} under prefix {key}"
    )))
}
