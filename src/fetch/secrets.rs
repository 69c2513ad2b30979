//! # Secret Resolution
//!
//! Fetchers never read credentials from the spec; they reference a Secret
//! and the keys are probed in a documented order. Probing is pure over the
//! secret's data map so it unit-tests without a cluster.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};

use crate::{OperatorError, Result};

/// Ordered key sets probed per credential class.
const S3_ACCESS_KEYS: &[&str] = &["AWS_ACCESS_KEY_ID", "accesskey", "access-key"];
const S3_SECRET_KEYS: &[&str] = &["AWS_SECRET_ACCESS_KEY", "secretkey", "secret-key"];
const GCS_KEYS: &[&str] = &[
    "key.json",
    "credentials.json",
    "service-account.json",
    "GOOGLE_APPLICATION_CREDENTIALS",
];
const ARCHIVE_TOKEN_KEYS: &[&str] = &["token", "github-token", "GITHUB_TOKEN", "password"];
const GIT_PASSWORD_KEYS: &[&str] = &["password", "token", "github-token", "gitlab-token"];

/// Reads referenced secrets through the Kubernetes API.
pub struct SecretResolver {
    client: Client,
}

impl SecretResolver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Load a secret's data map. A missing secret is an auth failure, not a
    /// not-found: the function references credentials it does not have.
    pub async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get_opt(name).await?.ok_or_else(|| {
            OperatorError::AuthFailed(format!("secret {namespace}/{name} not found"))
        })?;
        Ok(secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect())
    }
}

/// Probe `keys` in order and return the first present, non-empty value.
pub fn probe<'a>(data: &'a BTreeMap<String, Vec<u8>>, keys: &[&str]) -> Option<&'a [u8]> {
    keys.iter()
        .filter_map(|k| data.get(*k))
        .map(|v| v.as_slice())
        .find(|v| !v.is_empty())
}

fn probe_string(data: &BTreeMap<String, Vec<u8>>, keys: &[&str]) -> Option<String> {
    probe(data, keys).map(|v| String::from_utf8_lossy(v).trim().to_string())
}

/// S3-compatible access/secret key pair.
pub fn s3_credentials(data: &BTreeMap<String, Vec<u8>>) -> Result<(String, String)> {
    let access = probe_string(data, S3_ACCESS_KEYS)
        .ok_or_else(|| OperatorError::AuthFailed("secret has no S3 access key".to_string()))?;
    let secret = probe_string(data, S3_SECRET_KEYS)
        .ok_or_else(|| OperatorError::AuthFailed("secret has no S3 secret key".to_string()))?;
    Ok((access, secret))
}

/// GCS service-account JSON, if the secret carries one. Absence is not an
/// error: workload identity is the default.
pub fn gcs_service_account(data: &BTreeMap<String, Vec<u8>>) -> Option<String> {
    probe_string(data, GCS_KEYS)
}

/// Bearer token for the GitHub archive API.
pub fn archive_token(data: &BTreeMap<String, Vec<u8>>) -> Option<String> {
    probe_string(data, ARCHIVE_TOKEN_KEYS)
}

/// SSH private key for git clones.
pub fn git_ssh_key(data: &BTreeMap<String, Vec<u8>>) -> Option<String> {
    probe_string(data, &["ssh-privatekey"])
}

/// Basic-auth pair for git clones. When no username is stored, substitute
/// the provider's conventional one for the token kind that matched.
pub fn git_basic_auth(data: &BTreeMap<String, Vec<u8>>) -> Option<(String, String)> {
    let password = probe_string(data, GIT_PASSWORD_KEYS)?;
    let username = probe_string(data, &["username"]).unwrap_or_else(|| {
        if data.contains_key("github-token") {
            "x-access-token".to_string()
        } else if data.contains_key("gitlab-token") {
            "oauth2".to_string()
        } else {
            "git".to_string()
        }
    });
    Some((username, password))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(pairs: &[(&str, &str)]) -> BTreeMap<String, Vec<u8>> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn s3_keys_probe_in_documented_order() {
        let d = data(&[
            ("accesskey", "minio"),
            ("AWS_ACCESS_KEY_ID", "aws"),
            ("secretkey", "miniosecret"),
        ]);
        let (access, secret) = s3_credentials(&d).unwrap();
        assert_eq!(access, "aws");
        assert_eq!(secret, "miniosecret");
    }

    #[test]
    fn missing_s3_secret_key_is_auth_failure() {
        let d = data(&[("accesskey", "minio")]);
        let err = s3_credentials(&d).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::AuthFailed);
    }

    #[test]
    fn empty_values_are_skipped() {
        let d = data(&[("token", ""), ("password", "hunter2")]);
        assert_eq!(archive_token(&d).as_deref(), Some("hunter2"));
    }

    #[test]
    fn git_username_substitution_per_provider() {
        let d = data(&[("github-token", "ghp_abc")]);
        assert_eq!(
            git_basic_auth(&d),
            Some(("x-access-token".to_string(), "ghp_abc".to_string()))
        );

        let d = data(&[("gitlab-token", "glpat-abc")]);
        assert_eq!(
            git_basic_auth(&d),
            Some(("oauth2".to_string(), "glpat-abc".to_string()))
        );

        let d = data(&[("username", "alice"), ("password", "s3cret")]);
        assert_eq!(
            git_basic_auth(&d),
            Some(("alice".to_string(), "s3cret".to_string()))
        );
    }

    #[test]
    fn gcs_probes_json_keys_before_env_style() {
        let d = data(&[
            ("GOOGLE_APPLICATION_CREDENTIALS", "/var/run/creds.json"),
            ("key.json", "{\"type\":\"service_account\"}"),
        ]);
        assert_eq!(
            gcs_service_account(&d).as_deref(),
            Some("{\"type\":\"service_account\"}")
        );
    }
}
