//! # LambdaFunction Custom Resource
//!
//! The primary desired-state object: where the source lives, which runtime
//! executes it, and how its events are wired. The reconciler only ever
//! mutates `status`; everything else belongs to the user.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::eventing::EventingSpec;
use crate::{OperatorError, Result};

/// Annotation selecting the build-context storage backend explicitly.
pub const STORAGE_ANNOTATION: &str = "lambda.knative.dev/build-context-storage";

/// Desired state of a lambda function.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "lambda.knative.dev",
    version = "v1alpha1",
    kind = "LambdaFunction",
    status = "FunctionStatus",
    shortname = "lf",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSpec {
    /// Where the function source comes from. Exactly one variant.
    pub source: SourceSpec,
    /// Language runtime, handler and resource shape.
    pub runtime: RuntimeSpec,
    /// Event routing; omitted functions still build and deploy, they just
    /// receive no broker wiring.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eventing: Option<EventingSpec>,
}

/// Closed set of source kinds. Expressed as a sum type so validation stays
/// exhaustive; there is no runtime-extensible fetcher registry.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum SourceSpec {
    /// Source code carried verbatim in the object.
    Inline(InlineSource),
    /// An S3-compatible object (AWS, MinIO, ...).
    S3(S3Source),
    /// A Google Cloud Storage object.
    Gcs(GcsSource),
    /// A repository zipball fetched through the GitHub API.
    GithubArchive(GithubArchiveSource),
    /// A git clone.
    Git(GitSource),
}

impl SourceSpec {
    /// Short tag for logs and the per-source-kind error counters.
    pub fn kind(&self) -> &'static str {
        match self {
            SourceSpec::Inline(_) => "inline",
            SourceSpec::S3(_) => "s3",
            SourceSpec::Gcs(_) => "gcs",
            SourceSpec::GithubArchive(_) => "github-archive",
            SourceSpec::Git(_) => "git",
        }
    }

    /// Name of the secret carrying credentials for this source, if any.
    pub fn secret_ref(&self) -> Option<&str> {
        match self {
            SourceSpec::Inline(_) => None,
            SourceSpec::S3(s) => s.secret_ref.as_deref(),
            SourceSpec::Gcs(s) => s.secret_ref.as_deref(),
            SourceSpec::GithubArchive(s) => s.secret_ref.as_deref(),
            SourceSpec::Git(s) => s.secret_ref.as_deref(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InlineSource {
    pub code: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct S3Source {
    pub bucket: String,
    /// Object key; a trailing `/` means "directory": the fetcher looks for
    /// the language's conventional filename under it.
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible stores (MinIO).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GcsSource {
    pub bucket: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GithubArchiveSource {
    pub owner: String,
    pub repo: String,
    /// Branch, tag or commit; empty means the repository HEAD.
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
    /// Restrict the search for the source file to this subdirectory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subpath: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GitSource {
    pub url: String,
    /// Branch, tag or commit-hash prefix; empty resolves to HEAD.
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
    /// Path of the source file inside the repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
}

/// Supported language runtimes.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[serde(alias = "python3")]
    Python,
    #[serde(alias = "node", alias = "javascript")]
    Nodejs,
    #[serde(alias = "golang")]
    Go,
}

impl Language {
    /// Conventional filename the fetchers look for and the fabricator packs.
    pub fn source_filename(&self) -> &'static str {
        match self {
            Language::Python => "main.py",
            Language::Nodejs => "index.js",
            Language::Go => "main.go",
        }
    }

    /// Stable label value for metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Nodejs => "nodejs",
            Language::Go => "go",
        }
    }

    /// Parse a user-supplied language string, accepting the documented
    /// aliases. Unknown languages are rejected, never silently defaulted.
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "python" | "python3" => Ok(Language::Python),
            "nodejs" | "node" | "javascript" => Ok(Language::Nodejs),
            "go" | "golang" => Ok(Language::Go),
            other => Err(OperatorError::ValidationRejected(format!(
                "unsupported language {:?}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_timeout() -> u32 {
    60
}

/// Runtime shape of the function workload.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSpec {
    pub language: Language,
    /// Runtime version hint rendered into the Dockerfile (e.g. `3.11`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Entry point inside the user's source file.
    pub handler: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
    /// Invocation timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u32,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Coarse lifecycle state of a Function.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum FunctionPhase {
    #[default]
    Pending,
    Building,
    Deploying,
    Ready,
    Failed,
    Deleting,
}

impl FunctionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            FunctionPhase::Pending => "Pending",
            FunctionPhase::Building => "Building",
            FunctionPhase::Deploying => "Deploying",
            FunctionPhase::Ready => "Ready",
            FunctionPhase::Failed => "Failed",
            FunctionPhase::Deleting => "Deleting",
        }
    }
}

impl std::fmt::Display for FunctionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single observed condition, in the usual Kubernetes shape.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    /// "True" / "False" / "Unknown".
    pub status: String,
    /// An [`crate::ErrorKind`] name for failures, or a progress reason.
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        type_: impl Into<String>,
        status: bool,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status: if status { "True" } else { "False" }.to_string(),
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Observed state, written only by the reconciler.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionStatus {
    #[serde(default)]
    pub phase: FunctionPhase,
    /// Content hash of the last successfully fabricated context; equal
    /// hashes mean no rebuild.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_content_hash: Option<String>,
    /// Pull-side image reference once a build has completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
    /// Name of the in-flight or last-terminal build job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_job_ref: Option<String>,
    /// `metadata.generation` last acted upon; lets steady-state reconciles
    /// skip the fetch+hash path entirely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl LambdaFunction {
    /// The explicit storage-backend annotation, if present.
    pub fn storage_annotation(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(STORAGE_ANNOTATION))
            .map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
source:
  inline:
    code: "def handler(e): return e"
runtime:
  language: python
  handler: handler
"#
    }

    #[test]
    fn spec_deserializes_with_defaults() {
        let spec: FunctionSpec = serde_yaml::from_str(minimal_yaml()).unwrap();
        assert_eq!(spec.runtime.language, Language::Python);
        assert_eq!(spec.runtime.timeout_seconds, 60);
        assert!(spec.eventing.is_none());
        match spec.source {
            SourceSpec::Inline(ref inline) => {
                assert!(inline.code.contains("handler"));
            }
            ref other => panic!("expected inline source, got {:?}", other.kind()),
        }
    }

    #[test]
    fn source_spec_is_externally_tagged() {
        let yaml = r#"
s3:
  bucket: my-functions
  key: app/main.py
  region: us-east-1
"#;
        let source: SourceSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(source.kind(), "s3");
    }

    #[test]
    fn git_ref_field_is_named_ref() {
        let yaml = r#"
git:
  url: https://github.com/acme/fns.git
  ref: v1.2.0
  path: fn/main.py
"#;
        let source: SourceSpec = serde_yaml::from_str(yaml).unwrap();
        match source {
            SourceSpec::Git(git) => {
                assert_eq!(git.git_ref.as_deref(), Some("v1.2.0"));
                assert_eq!(git.path.as_deref(), Some("fn/main.py"));
            }
            other => panic!("expected git source, got {:?}", other.kind()),
        }
    }

    #[test]
    fn language_aliases_parse() {
        assert_eq!(Language::parse("python3").unwrap(), Language::Python);
        assert_eq!(Language::parse("node").unwrap(), Language::Nodejs);
        assert_eq!(Language::parse("golang").unwrap(), Language::Go);
        assert!(Language::parse("rust").is_err());
    }

    #[test]
    fn language_filenames_follow_convention() {
        assert_eq!(Language::Python.source_filename(), "main.py");
        assert_eq!(Language::Nodejs.source_filename(), "index.js");
        assert_eq!(Language::Go.source_filename(), "main.go");
    }

    #[test]
    fn phase_defaults_to_pending() {
        let status = FunctionStatus::default();
        assert_eq!(status.phase, FunctionPhase::Pending);
        assert!(status.last_content_hash.is_none());
    }
}
