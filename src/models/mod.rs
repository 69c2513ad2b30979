//! # Domain Models
//!
//! The custom resources and their embedded spec types:
//! - [`LambdaFunction`]: the primary desired-state object
//! - [`LambdaAgent`]: same shape family, with a per-agent broker
//! - [`SourceSpec`]: closed sum type over the supported source kinds
//! - [`DlqPolicy`] / [`EventType`]: eventing policy and the bounded
//!   CloudEvent type taxonomy
//! - [`BuildContext`]: the derived, content-addressed build artifact

pub mod agent;
pub mod build;
pub mod eventing;
pub mod function;

pub use agent::{AgentSpec, AgentStatus, LambdaAgent};
pub use build::{BlobBackend, BuildContext, ContextMetadata, StorageLocation};
pub use eventing::{
    sanitize_event_label, DlqPolicy, EventType, EventingSpec, OverflowPolicy, QueueType,
    RabbitmqClusterRef, DEFAULT_BROKER_NAME, DLQ_EXCHANGE_NAME, DLQ_QUEUE_NAME,
    DLQ_ROUTING_PREFIX,
};
pub use function::{
    Condition, FunctionPhase, FunctionSpec, FunctionStatus, GcsSource, GitSource,
    GithubArchiveSource, InlineSource, LambdaFunction, Language, ResourceSpec, RuntimeSpec,
    S3Source, SourceSpec, STORAGE_ANNOTATION,
};
