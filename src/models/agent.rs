//! # LambdaAgent Custom Resource
//!
//! Agents are long-running event consumers in the same shape family as
//! functions, but each one gets its own broker (`<agent>-broker`) instead of
//! sharing `lambda-broker`. Only the event topology and DLQ policy apply;
//! agents do not go through the build pipeline.

use kube::CustomResource;
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::eventing::EventingSpec;
use super::function::Condition;

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "lambda.knative.dev",
    version = "v1alpha1",
    kind = "LambdaAgent",
    status = "AgentStatus",
    shortname = "la",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// DLQ policy and cluster references; the broker name itself is always
    /// derived from the agent name and cannot be overridden.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eventing: Option<EventingSpec>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    /// "Ready" once the broker and DLQ wiring exist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl LambdaAgent {
    /// Deterministic per-agent broker name.
    pub fn broker_name(&self) -> String {
        format!("{}-broker", self.name_any())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_name_is_derived_from_agent_name() {
        let agent = LambdaAgent::new("support-bot", AgentSpec {
            description: None,
            eventing: None,
        });
        assert_eq!(agent.broker_name(), "support-bot-broker");
    }
}
