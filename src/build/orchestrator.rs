//! # Build Orchestrator
//!
//! One-shot, idempotent submission and supervision of the external image
//! builder. The job itself carries no retry logic (`backoffLimit: 0`); the
//! reconciler decides whether a failure is worth another attempt. The job's
//! annotations carry both the push-side image URI and the pull registry so
//! the status probe can translate the terminal reference without extra
//! state.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;
use k8s_openapi::api::batch::v1::Job;
use kube::api::{Api, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use tracing::{info, warn};

use crate::config::BuildConfig;
use crate::models::{LambdaFunction, StorageLocation};
use crate::{metrics, OperatorError, Result};

/// Annotation keys read back by the status probe.
pub const ANNOTATION_IMAGE_URI: &str = "lambda.knative.dev/image-uri";
pub const ANNOTATION_PULL_REGISTRY: &str = "lambda.knative.dev/pull-registry";
pub const ANNOTATION_CONTENT_HASH: &str = "lambda.knative.dev/content-hash";

/// Terminal jobs are collected five minutes after finishing.
const JOB_TTL_SECONDS: i32 = 300;
/// Wall-clock budget for the whole build.
pub const BUILD_TIMEOUT_SECONDS: i64 = 30 * 60;
/// Transient-failure retry policy: base 1 s doubling, capped, max 3 tries.
pub const BUILD_MAX_RETRIES: u32 = 3;
const BUILD_BACKOFF_CAP_SECONDS: u64 = 30;

/// Backoff before retry `attempt` (0-based) of a transient build failure.
pub fn transient_backoff(attempt: u32) -> std::time::Duration {
    let seconds = 1u64
        .checked_shl(attempt)
        .unwrap_or(BUILD_BACKOFF_CAP_SECONDS)
        .min(BUILD_BACKOFF_CAP_SECONDS);
    std::time::Duration::from_secs(seconds)
}

/// Outcome of a status probe.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildStatus {
    pub completed: bool,
    pub success: bool,
    /// Pull-host-rewritten image reference, set on success.
    pub image_uri: Option<String>,
    pub error: Option<String>,
    /// Wall-clock from job start to the terminal condition.
    pub duration_seconds: Option<f64>,
}

impl BuildStatus {
    fn running() -> Self {
        Self {
            completed: false,
            success: false,
            image_uri: None,
            error: None,
            duration_seconds: None,
        }
    }
}

pub struct BuildOrchestrator {
    client: Client,
    config: BuildConfig,
}

impl BuildOrchestrator {
    pub fn new(client: Client, config: BuildConfig) -> Self {
        Self { client, config }
    }

    /// Submit a build job for the function's current context. Ensures the
    /// build RBAC first; an already-existing job (409) means another
    /// reconcile got here first and is treated as success.
    pub async fn submit(
        &self,
        function: &LambdaFunction,
        content_hash: &str,
        image_tag: &str,
        location: &StorageLocation,
    ) -> Result<String> {
        let namespace = function.namespace().unwrap_or_else(|| "default".to_string());
        super::rbac::ensure_build_rbac(&self.client, &namespace).await?;

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let job = desired_job(
            &self.config,
            function,
            content_hash,
            image_tag,
            location,
            timestamp,
        )?;
        let job_name = job.name_any();

        let api: Api<Job> = Api::namespaced(self.client.clone(), &namespace);
        match api.create(&PostParams::default(), &job).await {
            Ok(_) => {
                info!(
                    function = %function.name_any(),
                    namespace = %namespace,
                    job = %job_name,
                    image_tag,
                    "build job submitted"
                );
                metrics::BUILD_JOBS_ACTIVE
                    .with_label_values(&[namespace.as_str()])
                    .inc();
                Ok(job_name)
            }
            Err(kube::Error::Api(response)) if response.code == 409 => {
                warn!(job = %job_name, "build job already exists, treating as submitted");
                Ok(job_name)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Probe a job's terminal state. On completion the image reference is
    /// rewritten from the push host to the pull host using the job's own
    /// annotations.
    pub async fn get_build_status(&self, namespace: &str, job_name: &str) -> Result<BuildStatus> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let job = api
            .get_opt(job_name)
            .await?
            .ok_or_else(|| OperatorError::NotFound(format!("build job {namespace}/{job_name}")))?;
        Ok(interpret_job(&job))
    }
}

/// Name for a function's build job; the timestamp suffix keeps retries of
/// changed specs unique while content-hash idempotence is enforced by the
/// annotations.
pub fn job_name(function_name: &str, timestamp: u64) -> String {
    format!("{function_name}-build-{timestamp}")
}

/// Push-side destination reference.
pub fn destination_image(
    registry: &str,
    namespace: &str,
    function_name: &str,
    image_tag: &str,
) -> String {
    format!("{registry}/{namespace}/{function_name}:{image_tag}")
}

/// Swap the registry host of an image reference.
pub fn rewrite_to_pull_host(image_uri: &str, pull_registry: &str) -> String {
    match image_uri.split_once('/') {
        Some((_push_host, rest)) => format!("{pull_registry}/{rest}"),
        None => image_uri.to_string(),
    }
}

/// The init step that stages the context into the shared workspace.
fn context_staging(location: &StorageLocation) -> (serde_json::Value, Vec<serde_json::Value>) {
    // The command both stages and unpacks; the builder only ever sees a
    // plain directory.
    match location {
        StorageLocation::ConfigMap { name } => (
            json!({
                "command": ["sh", "-c",
                    "cp /context/context.tar.gz /workspace/ && cd /workspace && tar -xzf context.tar.gz && rm context.tar.gz"],
                "volumeMounts": [
                    {"name": "context", "mountPath": "/context", "readOnly": true},
                    {"name": "workspace", "mountPath": "/workspace"}
                ]
            }),
            vec![json!({"name": "context", "configMap": {"name": name}})],
        ),
        StorageLocation::Blob { .. } => {
            let url = blob_download_url(location);
            (
                json!({
                    "command": ["sh", "-c",
                        format!("wget -q -O /workspace/context.tar.gz {url} && cd /workspace && tar -xzf context.tar.gz && rm context.tar.gz")],
                    "volumeMounts": [
                        {"name": "workspace", "mountPath": "/workspace"}
                    ]
                }),
                vec![],
            )
        }
    }
}

/// HTTP URL the init container downloads a blob context from.
pub fn blob_download_url(location: &StorageLocation) -> String {
    match location {
        StorageLocation::ConfigMap { .. } => String::new(),
        StorageLocation::Blob {
            backend,
            bucket,
            key,
            endpoint,
            region,
        } => match backend {
            crate::models::BlobBackend::S3 => match endpoint {
                // Path-style for custom endpoints (MinIO).
                Some(endpoint) => format!("{endpoint}/{bucket}/{key}"),
                None => {
                    let region = region.as_deref().unwrap_or("us-east-1");
                    format!("https://{bucket}.s3.{region}.amazonaws.com/{key}")
                }
            },
            crate::models::BlobBackend::Gcs => {
                format!("https://storage.googleapis.com/{bucket}/{key}")
            }
        },
    }
}

/// The full builder Job manifest.
pub fn desired_job(
    config: &BuildConfig,
    function: &LambdaFunction,
    content_hash: &str,
    image_tag: &str,
    location: &StorageLocation,
    timestamp: u64,
) -> Result<Job> {
    let name = function.name_any();
    let namespace = function.namespace().unwrap_or_else(|| "default".to_string());
    let job_name = job_name(&name, timestamp);
    let image_uri = destination_image(&config.default_registry, &namespace, &name, image_tag);

    let owner = function
        .controller_owner_ref(&())
        .ok_or_else(|| OperatorError::Internal("function has no metadata for owner ref".into()))?;

    let (staging, mut extra_volumes) = context_staging(location);
    let mut volumes = vec![json!({"name": "workspace", "emptyDir": {}})];
    volumes.append(&mut extra_volumes);

    let mut init_container = json!({
        "name": "prepare-context",
        "image": config.download_image,
        "resources": {
            "requests": {"cpu": "100m", "memory": "128Mi"},
            "limits": {"cpu": "500m", "memory": "256Mi"}
        }
    });
    init_container
        .as_object_mut()
        .expect("init container is an object")
        .extend(staging.as_object().cloned().expect("staging is an object"));

    let job = json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": job_name,
            "namespace": namespace,
            "labels": {
                "app.kubernetes.io/managed-by": "knative-lambda-operator",
                "lambda.knative.dev/function-name": name,
                "lambda.knative.dev/component": "build"
            },
            "annotations": {
                "lambda.knative.dev/image-uri": image_uri,
                "lambda.knative.dev/pull-registry": config.pull_registry,
                "lambda.knative.dev/content-hash": content_hash
            },
            "ownerReferences": [owner]
        },
        "spec": {
            "backoffLimit": 0,
            "ttlSecondsAfterFinished": JOB_TTL_SECONDS,
            "template": {
                "metadata": {
                    "labels": {
                        "lambda.knative.dev/function-name": name,
                        "lambda.knative.dev/component": "build"
                    }
                },
                "spec": {
                    "serviceAccountName": super::rbac::SERVICE_ACCOUNT_NAME,
                    "automountServiceAccountToken": false,
                    "restartPolicy": "Never",
                    "initContainers": [init_container],
                    "containers": [{
                        "name": "kaniko",
                        "image": config.kaniko_image,
                        "args": [
                            "--dockerfile=/workspace/Dockerfile",
                            "--context=dir:///workspace",
                            format!("--destination={image_uri}"),
                            "--cache=false",
                            "--insecure",
                            "--skip-tls-verify"
                        ],
                        "volumeMounts": [
                            {"name": "workspace", "mountPath": "/workspace"}
                        ],
                        "resources": {
                            "requests": {"cpu": "500m", "memory": "1Gi"},
                            "limits": {"cpu": "2", "memory": "4Gi"}
                        }
                    }],
                    "volumes": volumes
                }
            }
        }
    });

    serde_json::from_value(job).map_err(Into::into)
}

/// Translate job conditions into a [`BuildStatus`].
pub fn interpret_job(job: &Job) -> BuildStatus {
    let annotations = job.metadata.annotations.clone().unwrap_or_default();
    let status = match &job.status {
        Some(status) => status,
        None => return BuildStatus::running(),
    };

    // Job start to terminal-condition transition.
    let duration_of = |condition: &k8s_openapi::api::batch::v1::JobCondition| {
        match (status.start_time.as_ref(), condition.last_transition_time.as_ref()) {
            (Some(start), Some(end)) => {
                Some(end.0.signed_duration_since(start.0).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        }
    };

    for condition in status.conditions.iter().flatten() {
        if condition.status != "True" {
            continue;
        }
        match condition.type_.as_str() {
            "Complete" => {
                let image_uri = annotations.get(ANNOTATION_IMAGE_URI).map(|uri| {
                    match annotations.get(ANNOTATION_PULL_REGISTRY) {
                        Some(pull) => rewrite_to_pull_host(uri, pull),
                        None => uri.clone(),
                    }
                });
                return BuildStatus {
                    completed: true,
                    success: true,
                    image_uri,
                    error: None,
                    duration_seconds: duration_of(condition),
                };
            }
            "Failed" => {
                let message = condition
                    .message
                    .clone()
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| "Build job failed".to_string());
                return BuildStatus {
                    completed: true,
                    success: false,
                    image_uri: None,
                    error: Some(message),
                    duration_seconds: duration_of(condition),
                };
            }
            _ => {}
        }
    }

    // Not terminal; enforce the build wall-clock here so a wedged job
    // surfaces as a timeout instead of hanging the phase machine.
    if let Some(start) = status.start_time.as_ref() {
        let age = Utc::now().signed_duration_since(start.0);
        if age.num_seconds() > BUILD_TIMEOUT_SECONDS {
            return BuildStatus {
                completed: true,
                success: false,
                image_uri: None,
                error: Some(format!(
                    "build exceeded {BUILD_TIMEOUT_SECONDS}s wall-clock",
                )),
                duration_seconds: Some(age.num_seconds() as f64),
            };
        }
    }

    BuildStatus::running()
}

/// Map a failed build's condition message onto the error taxonomy.
pub fn classify_build_failure(message: &str) -> OperatorError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("oomkilled") || lower.contains("out of memory") {
        OperatorError::BuildOom(message.to_string())
    } else if lower.contains("wall-clock")
        || lower.contains("deadlineexceeded")
        || lower.contains("deadline exceeded")
        || lower.contains("activedeadlineseconds")
    {
        OperatorError::BuildTimeout(message.to_string())
    } else if lower.contains("unauthorized")
        || lower.contains("401")
        || (lower.contains("push") && lower.contains("denied"))
    {
        OperatorError::PushAuthError(message.to_string())
    } else if lower.contains("toomanyrequests")
        || lower.contains("rate limit")
        || lower.contains("pull qps")
    {
        // Image-pull throttling is worth another attempt.
        OperatorError::DownloadError(message.to_string())
    } else {
        // Dependency 404s, broken Dockerfiles, compile errors: the same
        // inputs will fail the same way.
        OperatorError::BuildFailed(message.to_string())
    }
}
