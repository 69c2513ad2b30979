// Knative Lambda Operator
// Turns declarative LambdaFunction objects into built, event-wired workloads

//! # Knative Lambda Operator Library
//!
//! This is the library crate behind the `operator` binary. It watches
//! `LambdaFunction` and `LambdaAgent` custom resources and drives each one
//! through `Pending -> Building -> Deploying -> Ready`, producing along the
//! way:
//!
//! - a deterministic, content-addressed build context (fetched source +
//!   generated Dockerfile + runtime wrapper, packed as tar+gzip),
//! - a Kaniko build job that pushes the resulting image,
//! - a serverless Service running that image,
//! - broker / trigger / dead-letter wiring for the function's events.
//!
//! ## Module Map
//!
//! - [`models`]: the CRDs and embedded spec types (source variants, runtime,
//!   eventing, DLQ policy, build context)
//! - [`fetch`]: source fetchers for inline, S3-compatible, GCS, GitHub
//!   archive and git sources, with up-front input validation
//! - [`context`]: build-context fabrication (templates, hashing, tar) and
//!   the ConfigMap / blob context stores
//! - [`build`]: build job orchestration and the build RBAC scaffolding
//! - [`eventing`]: event topology rendering, retry/DLQ policy, the circuit
//!   breaker and the CloudEvent delivery pipeline
//! - [`reconcile`]: the controllers and the per-function phase machine
//! - [`metrics`]: the `knative_lambda` Prometheus registry
//! - [`server`]: health and metrics HTTP endpoints
//!
//! Reconciliation is level-triggered: every pass recomputes the desired
//! artifacts from the spec, and all side effects are idempotent (server-side
//! apply, content-addressed storage keys, fixed-name RBAC).

pub mod build;
pub mod config;
pub mod context;
pub mod eventing;
pub mod fetch;
pub mod metrics;
pub mod models;
pub mod reconcile;
pub mod server;

// Re-export the core domain types so users don't need to navigate the
// module hierarchy for the common ones.
pub use config::OperatorConfig;
pub use models::{
    AgentSpec, DlqPolicy, EventType, FunctionPhase, FunctionSpec, FunctionStatus, LambdaAgent,
    LambdaFunction, Language, RuntimeSpec, SourceSpec,
};

use thiserror::Error;

/// The closed error-kind taxonomy.
///
/// Kinds (not messages) drive retry classification and label the error
/// metrics; free-form error text never becomes a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Untrusted input failed a pattern or allow-list check.
    ValidationRejected,
    /// Missing or invalid credentials for a source or registry.
    AuthFailed,
    /// Source key/bucket/repo/path absent.
    NotFound,
    /// Transport-level failure (DNS, TLS, partial read).
    DownloadError,
    /// Malformed archive or missing conventional filename.
    ExtractError,
    /// Unsupported language or version at template selection.
    DockerfileGenError,
    /// Builder exited non-zero for code reasons (deps, Dockerfile).
    BuildFailed,
    /// Builder main container was OOM-killed.
    BuildOom,
    /// Build wall-clock exceeded.
    BuildTimeout,
    /// Registry refused the push.
    PushAuthError,
    /// Broker unreachable or responding 5xx.
    BrokerTransient,
    /// Queue at max length with reject-publish overflow policy.
    QueueOverflow,
    /// Message aged out before delivery.
    TtlExpired,
    /// Operator misconfiguration (e.g. no blob backend configured).
    ConfigError,
    /// Anything else, including Kubernetes API failures.
    Internal,
}

impl ErrorKind {
    /// Stable kebab-case name, used as the `error_type` metric label and as
    /// the condition `reason` on failed Functions.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationRejected => "validation-rejected",
            ErrorKind::AuthFailed => "auth-failed",
            ErrorKind::NotFound => "not-found",
            ErrorKind::DownloadError => "download-error",
            ErrorKind::ExtractError => "extract-error",
            ErrorKind::DockerfileGenError => "dockerfile-gen-error",
            ErrorKind::BuildFailed => "build-failed",
            ErrorKind::BuildOom => "build-oom",
            ErrorKind::BuildTimeout => "build-timeout",
            ErrorKind::PushAuthError => "push-auth-error",
            ErrorKind::BrokerTransient => "broker-transient",
            ErrorKind::QueueOverflow => "queue-overflow",
            ErrorKind::TtlExpired => "ttl-expired",
            ErrorKind::ConfigError => "config-error",
            ErrorKind::Internal => "internal",
        }
    }

    /// Permanent kinds mark the Function `Failed` and stop retrying;
    /// transient kinds re-enqueue with backoff.
    pub fn is_permanent(&self) -> bool {
        match self {
            ErrorKind::ValidationRejected
            | ErrorKind::AuthFailed
            | ErrorKind::NotFound
            | ErrorKind::ExtractError
            | ErrorKind::DockerfileGenError
            | ErrorKind::BuildFailed
            | ErrorKind::BuildOom
            | ErrorKind::PushAuthError
            | ErrorKind::QueueOverflow
            | ErrorKind::TtlExpired
            | ErrorKind::ConfigError => true,
            ErrorKind::DownloadError
            | ErrorKind::BuildTimeout
            | ErrorKind::BrokerTransient
            | ErrorKind::Internal => false,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator error type. Every variant maps onto one [`ErrorKind`]; the
/// reconciler turns permanent kinds into `Failed` conditions and transient
/// kinds into re-enqueues.
#[derive(Error, Debug)]
pub enum OperatorError {
    #[error("validation rejected: {0}")]
    ValidationRejected(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("download error: {0}")]
    DownloadError(String),

    #[error("archive extraction failed: {0}")]
    ExtractError(String),

    #[error("dockerfile generation failed: {0}")]
    DockerfileGenError(String),

    #[error("build failed: {0}")]
    BuildFailed(String),

    /// Carries a remediation hint in the message; treated as permanent for
    /// identical inputs.
    #[error("build OOM-killed: {0} (consider raising runtime.resources.memory)")]
    BuildOom(String),

    #[error("build timed out: {0}")]
    BuildTimeout(String),

    #[error("registry push rejected: {0}")]
    PushAuthError(String),

    #[error("broker unavailable: {0}")]
    BrokerTransient(String),

    #[error("queue overflow: {0}")]
    QueueOverflow(String),

    #[error("message TTL expired: {0}")]
    TtlExpired(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("template error: {0}")]
    Template(#[from] tera::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl OperatorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OperatorError::ValidationRejected(_) => ErrorKind::ValidationRejected,
            OperatorError::AuthFailed(_) => ErrorKind::AuthFailed,
            OperatorError::NotFound(_) => ErrorKind::NotFound,
            OperatorError::DownloadError(_) => ErrorKind::DownloadError,
            OperatorError::ExtractError(_) => ErrorKind::ExtractError,
            OperatorError::DockerfileGenError(_) => ErrorKind::DockerfileGenError,
            OperatorError::BuildFailed(_) => ErrorKind::BuildFailed,
            OperatorError::BuildOom(_) => ErrorKind::BuildOom,
            OperatorError::BuildTimeout(_) => ErrorKind::BuildTimeout,
            OperatorError::PushAuthError(_) => ErrorKind::PushAuthError,
            OperatorError::BrokerTransient(_) => ErrorKind::BrokerTransient,
            OperatorError::QueueOverflow(_) => ErrorKind::QueueOverflow,
            OperatorError::TtlExpired(_) => ErrorKind::TtlExpired,
            OperatorError::ConfigError(_) => ErrorKind::ConfigError,
            OperatorError::Template(_) => ErrorKind::DockerfileGenError,
            OperatorError::Kube(_) | OperatorError::Serialization(_) | OperatorError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.kind().is_permanent()
    }
}

impl From<std::io::Error> for OperatorError {
    fn from(err: std::io::Error) -> Self {
        OperatorError::Internal(err.to_string())
    }
}

/// Type alias for Results that use the operator error type.
pub type Result<T> = std::result::Result<T, OperatorError>;
