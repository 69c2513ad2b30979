//! # Operator Configuration
//!
//! Environment-driven configuration for the control process. Every knob has
//! a documented default so the operator runs out of the box against a local
//! registry; deployments override via the container environment.

use std::env;

use serde::{Deserialize, Serialize};

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Images and registries used to assemble build jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Registry the builder pushes to (in-cluster service name).
    pub default_registry: String,
    /// Registry host the kubelet pulls from (node-visible name).
    pub pull_registry: String,
    /// Daemonless image builder.
    pub kaniko_image: String,
    /// Init image used to stage and untar the build context.
    pub download_image: String,
    /// Base images per language runtime.
    pub python_base_image: String,
    pub nodejs_base_image: String,
    pub go_base_image: String,
    /// Runtime image for Go multi-stage builds.
    pub alpine_image: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            default_registry: "registry.default.svc.cluster.local:5000".to_string(),
            pull_registry: "localhost:5000".to_string(),
            kaniko_image: "gcr.io/kaniko-project/executor:v1.23.2".to_string(),
            download_image: "alpine:3.20".to_string(),
            python_base_image: "python:3.11-slim".to_string(),
            nodejs_base_image: "node:20-alpine".to_string(),
            go_base_image: "golang:1.22-alpine".to_string(),
            alpine_image: "alpine:3.20".to_string(),
        }
    }
}

impl BuildConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_registry: env_or("BUILD_DEFAULT_REGISTRY", &defaults.default_registry),
            pull_registry: env_or("BUILD_PULL_REGISTRY", &defaults.pull_registry),
            kaniko_image: env_or("BUILD_KANIKO_IMAGE", &defaults.kaniko_image),
            download_image: env_or("BUILD_DOWNLOAD_IMAGE", &defaults.download_image),
            python_base_image: env_or("PYTHON_BASE_IMAGE", &defaults.python_base_image),
            nodejs_base_image: env_or("NODEJS_BASE_IMAGE", &defaults.nodejs_base_image),
            go_base_image: env_or("GO_BASE_IMAGE", &defaults.go_base_image),
            alpine_image: env_or("ALPINE_IMAGE", &defaults.alpine_image),
        }
    }
}

/// S3-compatible context store backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3ContextConfig {
    pub bucket: String,
    pub prefix: String,
    pub endpoint: Option<String>,
    pub region: Option<String>,
}

/// GCS context store backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcsContextConfig {
    pub bucket: String,
    pub prefix: String,
}

/// Top-level operator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorConfig {
    pub build: BuildConfig,
    /// HTTP ingress of the event broker (CloudEvents binding).
    pub broker_url: String,
    /// HTTP ingress events are dead-lettered to.
    pub dlq_broker_url: String,
    /// Optional S3-compatible blob backend; preferred over GCS when both
    /// are configured.
    pub s3_context: Option<S3ContextConfig>,
    /// Optional GCS blob backend.
    pub gcs_context: Option<GcsContextConfig>,
    /// Bind address of the health/metrics server.
    pub metrics_addr: String,
    /// Blob sweep cadence and retention, in seconds.
    pub sweep_interval_secs: u64,
    pub sweep_retention_secs: u64,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            build: BuildConfig::default(),
            broker_url: "http://broker-ingress.knative-eventing.svc.cluster.local/default/lambda-broker"
                .to_string(),
            dlq_broker_url:
                "http://broker-ingress.knative-eventing.svc.cluster.local/default/lambda-dlq"
                    .to_string(),
            s3_context: None,
            gcs_context: None,
            metrics_addr: "0.0.0.0:8080".to_string(),
            sweep_interval_secs: 3600,
            sweep_retention_secs: 86_400,
        }
    }
}

impl OperatorConfig {
    /// Build the configuration from the process environment.
    ///
    /// A blob backend is considered configured only when its bucket is set;
    /// backend selection between the two happens in the context store.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let s3_context = env_opt("CONTEXT_S3_BUCKET").map(|bucket| S3ContextConfig {
            bucket,
            prefix: env_or("CONTEXT_S3_PREFIX", "build-contexts"),
            endpoint: env_opt("CONTEXT_S3_ENDPOINT"),
            region: env_opt("CONTEXT_S3_REGION"),
        });

        let gcs_context = env_opt("CONTEXT_GCS_BUCKET").map(|bucket| GcsContextConfig {
            bucket,
            prefix: env_or("CONTEXT_GCS_PREFIX", "build-contexts"),
        });

        Self {
            build: BuildConfig::from_env(),
            broker_url: env_or("BROKER_URL", &defaults.broker_url),
            dlq_broker_url: env_or("DLQ_BROKER_URL", &defaults.dlq_broker_url),
            s3_context,
            gcs_context,
            metrics_addr: env_or("METRICS_ADDR", &defaults.metrics_addr),
            sweep_interval_secs: env_u64("SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs),
            sweep_retention_secs: env_u64("SWEEP_RETENTION_SECS", defaults.sweep_retention_secs),
        }
    }
}
