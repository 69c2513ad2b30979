//! # Inline ConfigMap Context Backend
//!
//! Upserts the archive into a ConfigMap named `<function>-build-context`
//! with an owner reference back to the Function, so deletion cascades
//! through the platform. Oversize archives are refused outright.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Duration;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::ByteString;
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use kube::Client;
use tracing::debug;

use crate::models::{ContextMetadata, StorageLocation};
use crate::{metrics, OperatorError, Result};

use super::{ContextStore, MAX_CONFIGMAP_CONTEXT_BYTES};

/// Key the archive lives under inside the ConfigMap.
pub const CONTEXT_KEY: &str = "context.tar.gz";
/// Field manager for server-side apply.
const FIELD_MANAGER: &str = "knative-lambda-operator";

pub struct ConfigMapContextStore {
    client: Option<Client>,
}

impl ConfigMapContextStore {
    pub fn new(client: Client) -> Self {
        Self {
            client: Some(client),
        }
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self { client: None }
    }

    /// Deterministic ConfigMap name for a function.
    pub fn object_name(function_name: &str) -> String {
        format!("{function_name}-build-context")
    }

    /// The full desired ConfigMap; separated from the API call so manifest
    /// shape is unit-testable.
    pub fn desired_configmap(
        archive: &[u8],
        meta: &ContextMetadata,
        owner: Option<&OwnerReference>,
    ) -> ConfigMap {
        let name = Self::object_name(&meta.lambda_name);

        let mut annotations = BTreeMap::new();
        annotations.insert("lambda.knative.dev/content-hash".to_string(), meta.content_hash.clone());
        annotations.insert(
            "lambda.knative.dev/created-at".to_string(),
            meta.created_at.to_rfc3339(),
        );

        let mut labels = BTreeMap::new();
        labels.insert(
            "app.kubernetes.io/managed-by".to_string(),
            "knative-lambda-operator".to_string(),
        );
        labels.insert(
            "lambda.knative.dev/function-name".to_string(),
            meta.lambda_name.clone(),
        );
        labels.insert(
            "lambda.knative.dev/component".to_string(),
            "build-context".to_string(),
        );

        let mut binary_data = BTreeMap::new();
        binary_data.insert(CONTEXT_KEY.to_string(), ByteString(archive.to_vec()));

        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name),
                namespace: Some(meta.lambda_namespace.clone()),
                annotations: Some(annotations),
                labels: Some(labels),
                owner_references: owner.map(|o| vec![o.clone()]),
                ..Default::default()
            },
            binary_data: Some(binary_data),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContextStore for ConfigMapContextStore {
    async fn save(
        &self,
        _key: &str,
        archive: &[u8],
        meta: &ContextMetadata,
        owner: Option<&OwnerReference>,
    ) -> Result<StorageLocation> {
        if archive.len() > MAX_CONFIGMAP_CONTEXT_BYTES {
            metrics::CONFIGMAP_SIZE_LIMIT_TOTAL.inc();
            return Err(OperatorError::ValidationRejected(format!(
                "context archive is {} bytes and exceeds ConfigMap limit of {} bytes",
                archive.len(),
                MAX_CONFIGMAP_CONTEXT_BYTES
            )));
        }

        let client = self.client.clone().ok_or_else(|| {
            OperatorError::Internal("configmap store has no API client".to_string())
        })?;

        let configmap = Self::desired_configmap(archive, meta, owner);
        let name = Self::object_name(&meta.lambda_name);
        let api: Api<ConfigMap> = Api::namespaced(client, &meta.lambda_namespace);
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&configmap),
        )
        .await?;

        debug!(
            configmap = %name,
            namespace = %meta.lambda_namespace,
            bytes = archive.len(),
            "stored build context inline"
        );
        Ok(StorageLocation::ConfigMap { name })
    }

    /// Inline contexts are collected by the owner-reference cascade.
    async fn cleanup(&self, _older_than: Duration) -> Result<usize> {
        Ok(0)
    }

    fn name(&self) -> &'static str {
        "configmap"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> ContextMetadata {
        ContextMetadata::new("echo", "default", "deadbeefcafe")
    }

    #[tokio::test]
    async fn oversize_archive_is_rejected_not_truncated() {
        let store = ConfigMapContextStore::for_tests();
        let archive = vec![0u8; MAX_CONFIGMAP_CONTEXT_BYTES + 1];
        let err = store.save("k", &archive, &meta(), None).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ValidationRejected);
        assert!(err.to_string().contains("exceeds ConfigMap limit"));
    }

    #[tokio::test]
    async fn boundary_archive_passes_the_size_check() {
        // Exactly 768 KiB is accepted; the refusal starts one byte later.
        let store = ConfigMapContextStore::for_tests();
        let at_limit = vec![0u8; MAX_CONFIGMAP_CONTEXT_BYTES];
        let err = store.save("k", &at_limit, &meta(), None).await.unwrap_err();
        // The size gate passed; the only failure left is the missing test
        // client, which is not a validation rejection.
        assert_eq!(err.kind(), crate::ErrorKind::Internal);
    }

    #[test]
    fn desired_configmap_carries_labels_annotations_and_owner() {
        let owner = OwnerReference {
            api_version: "lambda.knative.dev/v1alpha1".to_string(),
            kind: "LambdaFunction".to_string(),
            name: "echo".to_string(),
            uid: "1234-uid".to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        };
        let configmap =
            ConfigMapContextStore::desired_configmap(b"archive-bytes", &meta(), Some(&owner));

        assert_eq!(
            configmap.metadata.name.as_deref(),
            Some("echo-build-context")
        );
        let labels = configmap.metadata.labels.as_ref().unwrap();
        assert_eq!(
            labels.get("lambda.knative.dev/component").map(String::as_str),
            Some("build-context")
        );
        let annotations = configmap.metadata.annotations.as_ref().unwrap();
        assert_eq!(
            annotations
                .get("lambda.knative.dev/content-hash")
                .map(String::as_str),
            Some("deadbeefcafe")
        );
        let owners = configmap.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].uid, "1234-uid");
        assert!(configmap
            .binary_data
            .as_ref()
            .unwrap()
            .contains_key(CONTEXT_KEY));
    }
}
