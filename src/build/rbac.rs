//! # Build RBAC Scaffolding
//!
//! Before a job is created in a namespace, the `{ServiceAccount, Role,
//! RoleBinding}` triple is ensured via server-side apply with fixed names.
//! Apply is an upsert with field merging, so concurrent reconciles cannot
//! flap the objects and ensuring twice equals ensuring once.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use kube::Client;
use tracing::debug;

use crate::Result;

pub const SERVICE_ACCOUNT_NAME: &str = "lambda-build";
pub const ROLE_NAME: &str = "lambda-build-role";
pub const ROLE_BINDING_NAME: &str = "lambda-build-binding";
const FIELD_MANAGER: &str = "knative-lambda-operator";

fn build_labels() -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        "knative-lambda-operator".to_string(),
    );
    labels.insert(
        "lambda.knative.dev/component".to_string(),
        "build".to_string(),
    );
    labels
}

fn metadata(name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(build_labels()),
        ..Default::default()
    }
}

pub fn desired_service_account(namespace: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: metadata(SERVICE_ACCOUNT_NAME, namespace),
        ..Default::default()
    }
}

/// Namespace-scoped grants only: the builder stages contexts from
/// ConfigMaps/Secrets and watches its own pods and jobs.
pub fn desired_role(namespace: &str) -> Role {
    let verbs: Vec<String> = ["get", "list", "watch", "create", "update", "patch", "delete"]
        .into_iter()
        .map(String::from)
        .collect();
    Role {
        metadata: metadata(ROLE_NAME, namespace),
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(
                    ["configmaps", "secrets", "pods", "pods/log"]
                        .into_iter()
                        .map(String::from)
                        .collect(),
                ),
                verbs: verbs.clone(),
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec!["batch".to_string()]),
                resources: Some(vec!["jobs".to_string()]),
                verbs,
                ..Default::default()
            },
        ]),
    }
}

pub fn desired_role_binding(namespace: &str) -> RoleBinding {
    RoleBinding {
        metadata: metadata(ROLE_BINDING_NAME, namespace),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: ROLE_NAME.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: SERVICE_ACCOUNT_NAME.to_string(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    }
}

/// Ensure the build RBAC triple exists in a namespace. Safe to call from
/// any number of reconciles concurrently.
pub async fn ensure_build_rbac(client: &Client, namespace: &str) -> Result<()> {
    let params = PatchParams::apply(FIELD_MANAGER).force();

    let service_accounts: Api<ServiceAccount> = Api::namespaced(client.clone(), namespace);
    service_accounts
        .patch(
            SERVICE_ACCOUNT_NAME,
            &params,
            &Patch::Apply(&desired_service_account(namespace)),
        )
        .await?;

    let roles: Api<Role> = Api::namespaced(client.clone(), namespace);
    roles
        .patch(ROLE_NAME, &params, &Patch::Apply(&desired_role(namespace)))
        .await?;

    let bindings: Api<RoleBinding> = Api::namespaced(client.clone(), namespace);
    bindings
        .patch(
            ROLE_BINDING_NAME,
            &params,
            &Patch::Apply(&desired_role_binding(namespace)),
        )
        .await?;

    debug!(namespace, "build RBAC ensured");
    Ok(())
}
