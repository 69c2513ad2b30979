//! # Eventing Spec, DLQ Policy and Event Taxonomy
//!
//! The compact eventing spec embedded in functions and agents, the retry /
//! dead-letter policy knobs with their documented defaults, and the closed
//! CloudEvent type taxonomy. Event-type strings are the only strings that
//! ever reach labels, and only after [`sanitize_event_label`].

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Shared broker used by functions without an explicit override.
pub const DEFAULT_BROKER_NAME: &str = "lambda-broker";
/// Dead-letter exchange and queue names.
pub const DLQ_EXCHANGE_NAME: &str = "lambda-dlq-exchange";
pub const DLQ_QUEUE_NAME: &str = "lambda-dlq-queue";
/// Routing-key prefix for dead-lettered events.
pub const DLQ_ROUTING_PREFIX: &str = "io.knative.lambda.dlq";

/// Event routing section of a function or agent spec.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventingSpec {
    /// Broker override; functions default to [`DEFAULT_BROKER_NAME`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_name: Option<String>,
    /// RabbitMQ cluster backing the broker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rabbitmq_cluster_ref: Option<RabbitmqClusterRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dlq: Option<DlqPolicy>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RabbitmqClusterRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// What happens when the DLQ hits `max_length`.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Fail publishes closed when the queue is full; nothing is lost
    /// silently.
    #[default]
    RejectPublish,
    /// Drop the oldest message to admit the new one.
    DropHead,
}

impl OverflowPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverflowPolicy::RejectPublish => "reject-publish",
            OverflowPolicy::DropHead => "drop-head",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueType {
    #[default]
    Quorum,
    Classic,
}

impl QueueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueType::Quorum => "quorum",
            QueueType::Classic => "classic",
        }
    }
}

fn default_retry_attempts() -> u32 {
    5
}
fn default_backoff_base_seconds() -> u64 {
    1
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_backoff_cap_seconds() -> u64 {
    30
}
fn default_message_ttl_seconds() -> u64 {
    7 * 24 * 3600
}
fn default_max_length() -> u64 {
    100_000
}
fn default_parallelism() -> u32 {
    50
}

/// Per-function retry and dead-letter policy.
///
/// Defaults: 5 attempts, exponential backoff 1 s doubling with a 30 s cap,
/// 7-day message TTL, 100 000 message cap with reject-publish overflow,
/// quorum queues at parallelism 50.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DlqPolicy {
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_backoff_base_seconds")]
    pub backoff_base_seconds: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_backoff_cap_seconds")]
    pub backoff_cap_seconds: u64,
    #[serde(default = "default_message_ttl_seconds")]
    pub message_ttl_seconds: u64,
    #[serde(default = "default_max_length")]
    pub max_length: u64,
    #[serde(default)]
    pub overflow: OverflowPolicy,
    #[serde(default)]
    pub queue_type: QueueType,
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
    /// Name overrides; the `lambda-dlq` prefixed defaults apply otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange_override: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_override: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_prefix_override: Option<String>,
}

impl Default for DlqPolicy {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            backoff_base_seconds: default_backoff_base_seconds(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_cap_seconds: default_backoff_cap_seconds(),
            message_ttl_seconds: default_message_ttl_seconds(),
            max_length: default_max_length(),
            overflow: OverflowPolicy::default(),
            queue_type: QueueType::default(),
            parallelism: default_parallelism(),
            exchange_override: None,
            queue_override: None,
            routing_prefix_override: None,
        }
    }
}

impl DlqPolicy {
    /// Exchange/queue/routing names fall back to the `lambda-dlq` prefix.
    pub fn exchange_name(&self) -> String {
        self.exchange_override
            .clone()
            .unwrap_or_else(|| DLQ_EXCHANGE_NAME.to_string())
    }

    pub fn queue_name(&self) -> String {
        self.queue_override
            .clone()
            .unwrap_or_else(|| DLQ_QUEUE_NAME.to_string())
    }

    pub fn routing_prefix(&self) -> String {
        self.routing_prefix_override
            .clone()
            .unwrap_or_else(|| DLQ_ROUTING_PREFIX.to_string())
    }
}

/// The closed CloudEvent type taxonomy. Every type the operator emits or
/// routes appears here; nothing else is ever published or filtered on.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum EventType {
    // command.*: user-initiated operations
    CommandDeploy,
    CommandUndeploy,
    // lifecycle.*: operator-emitted state changes
    LifecycleBuildStarted,
    LifecycleBuildCompleted,
    LifecycleBuildFailed,
    LifecycleDeployed,
    LifecycleReady,
    LifecycleFailed,
    LifecycleDeleted,
    // invoke.*: requests routed to the function
    InvokeRequest,
    InvokeAsync,
    // response.*: function results
    ResponseSuccess,
    ResponseError,
}

impl EventType {
    /// Full reversed-DNS CloudEvent type string.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::CommandDeploy => "io.knative.lambda.command.deploy",
            EventType::CommandUndeploy => "io.knative.lambda.command.undeploy",
            EventType::LifecycleBuildStarted => "io.knative.lambda.lifecycle.build.started",
            EventType::LifecycleBuildCompleted => "io.knative.lambda.lifecycle.build.completed",
            EventType::LifecycleBuildFailed => "io.knative.lambda.lifecycle.build.failed",
            EventType::LifecycleDeployed => "io.knative.lambda.lifecycle.deployed",
            EventType::LifecycleReady => "io.knative.lambda.lifecycle.ready",
            EventType::LifecycleFailed => "io.knative.lambda.lifecycle.failed",
            EventType::LifecycleDeleted => "io.knative.lambda.lifecycle.deleted",
            EventType::InvokeRequest => "io.knative.lambda.invoke.request",
            EventType::InvokeAsync => "io.knative.lambda.invoke.async",
            EventType::ResponseSuccess => "io.knative.lambda.response.success",
            EventType::ResponseError => "io.knative.lambda.response.error",
        }
    }

    /// Types a function trigger subscribes to.
    pub fn trigger_types() -> &'static [EventType] {
        &[EventType::InvokeRequest, EventType::InvokeAsync]
    }

    /// All types, for exhaustive template rendering and tests.
    pub fn all() -> &'static [EventType] {
        &[
            EventType::CommandDeploy,
            EventType::CommandUndeploy,
            EventType::LifecycleBuildStarted,
            EventType::LifecycleBuildCompleted,
            EventType::LifecycleBuildFailed,
            EventType::LifecycleDeployed,
            EventType::LifecycleReady,
            EventType::LifecycleFailed,
            EventType::LifecycleDeleted,
            EventType::InvokeRequest,
            EventType::InvokeAsync,
            EventType::ResponseSuccess,
            EventType::ResponseError,
        ]
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sanitize an event-type string for use as a label: lowercase, `.` `/` `_`
/// become `-`, truncated to 40 characters. Idempotent.
pub fn sanitize_event_label(raw: &str) -> String {
    let mut out: String = raw
        .to_ascii_lowercase()
        .chars()
        .map(|c| match c {
            '.' | '/' | '_' => '-',
            other => other,
        })
        .collect();
    out.truncate(40);
    out
}
