//! # Lifecycle CloudEvents
//!
//! The operator narrates phase transitions as CloudEvents on the broker:
//! build started/completed/failed, deployed, ready, failed, deleted.
//! Emission is best-effort; a broker outage never blocks a reconcile (the
//! delivery pipeline dead-letters what it cannot deliver).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::models::EventType;

use super::publisher::DeliveryPipeline;

/// A CloudEvents 1.0 envelope in the JSON structured encoding, with the
/// operator's extension attributes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloudEvent {
    pub specversion: String,
    pub id: String,
    pub source: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub time: DateTime<Utc>,
    pub datacontenttype: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Correlates chains of events; part of the consumer idempotency key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlationid: Option<String>,
    /// Dead-letter metadata, set only on events routed to the DLQ.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrycount: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dlqreason: Option<String>,
    pub data: serde_json::Value,
}

impl CloudEvent {
    pub fn new(type_: &str, source: String, data: serde_json::Value) -> Self {
        Self {
            specversion: "1.0".to_string(),
            id: Uuid::new_v4().to_string(),
            source,
            type_: type_.to_string(),
            time: Utc::now(),
            datacontenttype: "application/json".to_string(),
            subject: None,
            correlationid: None,
            retrycount: None,
            dlqreason: None,
            data,
        }
    }

    /// A lifecycle event about one function.
    pub fn lifecycle(
        event_type: EventType,
        namespace: &str,
        function: &str,
        data: serde_json::Value,
    ) -> Self {
        let source = format!(
            "/apis/lambda.knative.dev/v1alpha1/namespaces/{namespace}/lambdafunctions/{function}"
        );
        let mut event = Self::new(event_type.as_str(), source, data);
        event.subject = Some(format!("{namespace}/{function}"));
        event
    }

    /// Key downstream consumers deduplicate on.
    pub fn idempotency_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.id,
            self.type_,
            self.correlationid.as_deref().unwrap_or_default()
        )
    }
}

/// Emits lifecycle events through the delivery pipeline without letting
/// broker trouble surface into the reconcile result.
pub struct LifecycleEmitter {
    pipeline: Arc<DeliveryPipeline>,
}

impl LifecycleEmitter {
    pub fn new(pipeline: Arc<DeliveryPipeline>) -> Self {
        Self { pipeline }
    }

    pub async fn emit(
        &self,
        event_type: EventType,
        namespace: &str,
        function: &str,
        data: serde_json::Value,
    ) {
        let event = CloudEvent::lifecycle(event_type, namespace, function, data);
        if let Err(err) = self.pipeline.deliver(event).await {
            warn!(
                event_type = %event_type,
                namespace,
                function,
                "lifecycle event not delivered: {err}"
            );
        }
    }
}
