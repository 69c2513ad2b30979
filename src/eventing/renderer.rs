//! # Event Topology Renderer
//!
//! Materializes the event mesh for a function or agent from a fixed,
//! compile-time template pack: broker, trigger, DLQ exchange/queue/binding,
//! api-source (with its RBAC) and the serving Service. Rendered YAML is
//! parsed into dynamic objects and applied with server-side apply, so the
//! whole topology is a level-triggered upsert.
//!
//! Naming is deterministic: the shared broker is `lambda-broker` unless the
//! spec overrides it, agents always get `<agent>-broker`, triggers are
//! `<function>-trigger` and the DLQ objects carry the `lambda-dlq` prefix.

use kube::api::{Api, Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Client, Resource, ResourceExt};
use lazy_static::lazy_static;
use serde_json::json;
use tera::{Context as TemplateContext, Tera};
use tracing::debug;

use crate::config::OperatorConfig;
use crate::models::{
    EventType, EventingSpec, LambdaAgent, LambdaFunction, DEFAULT_BROKER_NAME,
};
use crate::{OperatorError, Result};

const FIELD_MANAGER: &str = "knative-lambda-operator";
/// Service account used by the api-source to watch lambda objects.
const EVENTS_SERVICE_ACCOUNT: &str = "lambda-events";
/// Name of the per-namespace api-source.
const EVENTS_SOURCE_NAME: &str = "lambda-events";

lazy_static! {
    static ref TEMPLATES: Tera = {
        let mut tera = Tera::default();
        tera.add_raw_templates(vec![
            ("broker", include_str!("templates/broker.yaml.tera")),
            ("trigger", include_str!("templates/trigger.yaml.tera")),
            ("dlq", include_str!("templates/dlq.yaml.tera")),
            ("api-source", include_str!("templates/api-source.yaml.tera")),
            ("rbac", include_str!("templates/rbac.yaml.tera")),
            ("service", include_str!("templates/service.yaml.tera")),
        ])
        .expect("embedded eventing templates parse");
        tera
    };
}

/// Broker a function's trigger binds to.
pub fn broker_name_for(function: &LambdaFunction) -> String {
    function
        .spec
        .eventing
        .as_ref()
        .and_then(|e| e.broker_name.clone())
        .unwrap_or_else(|| DEFAULT_BROKER_NAME.to_string())
}

/// Deterministic trigger name.
pub fn trigger_name(function_name: &str) -> String {
    format!("{function_name}-trigger")
}

/// A rendered descriptor plus whether the reconciled object owns it (owned
/// descriptors cascade-delete with the function; shared ones survive).
#[derive(Debug, Clone)]
pub struct RenderedDoc {
    pub yaml: String,
    pub owned: bool,
}

pub struct TopologyRenderer {
    client: Option<Client>,
    config: OperatorConfig,
}

impl TopologyRenderer {
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        Self {
            client: Some(client),
            config,
        }
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            client: None,
            config: OperatorConfig::default(),
        }
    }

    fn render(&self, template: &str, params: &TemplateContext) -> Result<String> {
        TEMPLATES
            .render(template, params)
            .map_err(OperatorError::from)
    }

    fn broker_params(
        &self,
        broker_name: &str,
        namespace: &str,
        eventing: Option<&EventingSpec>,
    ) -> TemplateContext {
        let policy = eventing
            .and_then(|e| e.dlq.clone())
            .unwrap_or_default();
        let (cluster, cluster_namespace) = eventing
            .and_then(|e| e.rabbitmq_cluster_ref.as_ref())
            .map(|r| {
                (
                    r.name.clone(),
                    r.namespace.clone().unwrap_or_else(|| namespace.to_string()),
                )
            })
            .unwrap_or_else(|| ("rabbitmq".to_string(), namespace.to_string()));

        let mut params = TemplateContext::new();
        params.insert("broker_name", broker_name);
        params.insert("namespace", namespace);
        params.insert("rabbitmq_cluster", &cluster);
        params.insert("rabbitmq_namespace", &cluster_namespace);
        params.insert("retry_attempts", &policy.retry_attempts);
        params.insert("backoff_base_seconds", &policy.backoff_base_seconds);
        params.insert("dlq_url", &self.config.dlq_broker_url);
        params
    }

    fn dlq_params(
        &self,
        namespace: &str,
        eventing: Option<&EventingSpec>,
    ) -> TemplateContext {
        let policy = eventing
            .and_then(|e| e.dlq.clone())
            .unwrap_or_default();
        let (cluster, cluster_namespace) = eventing
            .and_then(|e| e.rabbitmq_cluster_ref.as_ref())
            .map(|r| {
                (
                    r.name.clone(),
                    r.namespace.clone().unwrap_or_else(|| namespace.to_string()),
                )
            })
            .unwrap_or_else(|| ("rabbitmq".to_string(), namespace.to_string()));

        let mut params = TemplateContext::new();
        params.insert("namespace", namespace);
        params.insert("dlq_exchange", &policy.exchange_name());
        params.insert("dlq_queue", &policy.queue_name());
        params.insert("routing_prefix", &policy.routing_prefix());
        params.insert("queue_type", policy.queue_type.as_str());
        params.insert("message_ttl_ms", &(policy.message_ttl_seconds * 1000));
        params.insert("max_length", &policy.max_length);
        params.insert("overflow", policy.overflow.as_str());
        params.insert("rabbitmq_cluster", &cluster);
        params.insert("rabbitmq_namespace", &cluster_namespace);
        params
    }

    /// Render the full descriptor set for a function.
    pub fn render_function_topology(
        &self,
        function: &LambdaFunction,
        image_ref: &str,
    ) -> Result<Vec<RenderedDoc>> {
        let name = function.name_any();
        let namespace = function.namespace().unwrap_or_else(|| "default".to_string());
        let broker = broker_name_for(function);
        let eventing = function.spec.eventing.as_ref();
        // A per-function broker cascades with the function; the shared one
        // outlives any single function.
        let per_function_broker = broker != DEFAULT_BROKER_NAME;

        let mut docs = Vec::new();

        docs.push(RenderedDoc {
            yaml: self.render("broker", &self.broker_params(&broker, &namespace, eventing))?,
            owned: per_function_broker,
        });
        docs.push(RenderedDoc {
            yaml: self.render("dlq", &self.dlq_params(&namespace, eventing))?,
            owned: false,
        });

        let mut params = TemplateContext::new();
        params.insert("trigger_name", &trigger_name(&name));
        params.insert("namespace", &namespace);
        params.insert("broker_name", &broker);
        params.insert("function_name", &name);
        let event_types: Vec<&str> = EventType::trigger_types()
            .iter()
            .map(|t| t.as_str())
            .collect();
        params.insert("event_types", &event_types);
        docs.push(RenderedDoc {
            yaml: self.render("trigger", &params)?,
            owned: true,
        });

        docs.push(RenderedDoc {
            yaml: self.render("service", &self.service_params(function, image_ref)?)?,
            owned: true,
        });

        let mut params = TemplateContext::new();
        params.insert("service_account", EVENTS_SERVICE_ACCOUNT);
        params.insert("namespace", &namespace);
        docs.push(RenderedDoc {
            yaml: self.render("rbac", &params)?,
            owned: false,
        });

        let mut params = TemplateContext::new();
        params.insert("source_name", EVENTS_SOURCE_NAME);
        params.insert("namespace", &namespace);
        params.insert("service_account", EVENTS_SERVICE_ACCOUNT);
        params.insert("broker_name", &broker);
        docs.push(RenderedDoc {
            yaml: self.render("api-source", &params)?,
            owned: false,
        });

        Ok(docs)
    }

    fn service_params(&self, function: &LambdaFunction, image_ref: &str) -> Result<TemplateContext> {
        let runtime = &function.spec.runtime;
        let resources = runtime.resources.clone().unwrap_or_default();

        let env: Vec<serde_json::Value> = runtime
            .env
            .iter()
            .flatten()
            .map(|(name, value)| json!({"name": name, "value": value}))
            .collect();

        let mut params = TemplateContext::new();
        params.insert("function_name", &function.name_any());
        params.insert(
            "namespace",
            &function.namespace().unwrap_or_else(|| "default".to_string()),
        );
        params.insert("image", image_ref);
        params.insert("timeout_seconds", &runtime.timeout_seconds);
        params.insert("env", &env);
        params.insert("cpu_request", "100m");
        params.insert("memory_request", "128Mi");
        params.insert("cpu_limit", &resources.cpu.as_deref().unwrap_or("1"));
        params.insert(
            "memory_limit",
            &resources.memory.as_deref().unwrap_or("512Mi"),
        );
        Ok(params)
    }

    /// Render the per-agent descriptor set: its own broker plus the DLQ
    /// wiring.
    pub fn render_agent_topology(&self, agent: &LambdaAgent) -> Result<Vec<RenderedDoc>> {
        let namespace = agent.namespace().unwrap_or_else(|| "default".to_string());
        let broker = agent.broker_name();
        let eventing = agent.spec.eventing.as_ref();

        Ok(vec![
            RenderedDoc {
                yaml: self.render("broker", &self.broker_params(&broker, &namespace, eventing))?,
                owned: true,
            },
            RenderedDoc {
                yaml: self.render("dlq", &self.dlq_params(&namespace, eventing))?,
                owned: false,
            },
        ])
    }

    /// Apply a function's topology with server-side apply.
    pub async fn apply_function_topology(
        &self,
        function: &LambdaFunction,
        image_ref: &str,
    ) -> Result<()> {
        let docs = self.render_function_topology(function, image_ref)?;
        let namespace = function.namespace().unwrap_or_else(|| "default".to_string());
        let owner = function.controller_owner_ref(&());
        self.apply_documents(&namespace, &docs, owner.as_ref()).await
    }

    pub async fn apply_agent_topology(&self, agent: &LambdaAgent) -> Result<()> {
        let docs = self.render_agent_topology(agent)?;
        let namespace = agent.namespace().unwrap_or_else(|| "default".to_string());
        let owner = agent.controller_owner_ref(&());
        self.apply_documents(&namespace, &docs, owner.as_ref()).await
    }

    async fn apply_documents(
        &self,
        namespace: &str,
        docs: &[RenderedDoc],
        owner: Option<&k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference>,
    ) -> Result<()> {
        let client = self
            .client
            .clone()
            .ok_or_else(|| OperatorError::Internal("renderer has no API client".to_string()))?;

        for doc in docs {
            for yaml in split_documents(&doc.yaml) {
                let mut object: DynamicObject = serde_yaml::from_str(&yaml)
                    .map_err(|e| OperatorError::Internal(format!("parse descriptor: {e}")))?;
                if doc.owned {
                    if let Some(owner) = owner {
                        object.metadata.owner_references = Some(vec![owner.clone()]);
                    }
                }

                let types = object.types.clone().ok_or_else(|| {
                    OperatorError::Internal("descriptor is missing apiVersion/kind".to_string())
                })?;
                let (group, version) = match types.api_version.split_once('/') {
                    Some((group, version)) => (group, version),
                    None => ("", types.api_version.as_str()),
                };
                let gvk = GroupVersionKind::gvk(group, version, &types.kind);
                let api_resource =
                    ApiResource::from_gvk_with_plural(&gvk, &plural_for(&types.kind));

                let name = object.name_any();
                let api: Api<DynamicObject> =
                    Api::namespaced_with(client.clone(), namespace, &api_resource);
                api.patch(
                    &name,
                    &PatchParams::apply(FIELD_MANAGER).force(),
                    &Patch::Apply(&object),
                )
                .await?;
                debug!(kind = %types.kind, name = %name, namespace, "applied event descriptor");
            }
        }
        Ok(())
    }
}

/// Split a rendered template into its `---`-separated documents.
fn split_documents(yaml: &str) -> Vec<String> {
    yaml.split("\n---")
        .map(|doc| doc.trim())
        .filter(|doc| !doc.is_empty())
        .map(|doc| doc.to_string())
        .collect()
}

/// Lowercase plural for a kind; handles the `-y` to `-ies` class.
fn plural_for(kind: &str) -> String {
    let lower = kind.to_ascii_lowercase();
    match lower.strip_suffix('y') {
        Some(stem) => format!("{stem}ies"),
        None => format!("{lower}s"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AgentSpec, FunctionSpec, InlineSource, Language, RuntimeSpec, SourceSpec,
    };

    fn test_function(broker_override: Option<&str>) -> LambdaFunction {
        let mut function = LambdaFunction::new(
            "echo",
            FunctionSpec {
                source: SourceSpec::Inline(InlineSource {
                    code: "def handler(e): return e".to_string(),
                }),
                runtime: RuntimeSpec {
                    language: Language::Python,
                    version: None,
                    handler: "handler".to_string(),
                    resources: None,
                    env: None,
                    timeout_seconds: 60,
                },
                eventing: broker_override.map(|name| EventingSpec {
                    broker_name: Some(name.to_string()),
                    rabbitmq_cluster_ref: None,
                    dlq: None,
                }),
            },
        );
        function.metadata.namespace = Some("default".to_string());
        function.metadata.uid = Some("uid-echo".to_string());
        function
    }

    fn kinds_and_names(docs: &[RenderedDoc]) -> Vec<(String, String)> {
        docs.iter()
            .flat_map(|doc| split_documents(&doc.yaml))
            .map(|yaml| {
                let value: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
                (
                    value["kind"].as_str().unwrap().to_string(),
                    value["metadata"]["name"].as_str().unwrap().to_string(),
                )
            })
            .collect()
    }

    #[test]
    fn function_topology_uses_deterministic_names() {
        let renderer = TopologyRenderer::for_tests();
        let docs = renderer
            .render_function_topology(&test_function(None), "localhost:5000/default/echo:abc")
            .unwrap();
        let rendered = kinds_and_names(&docs);

        assert!(rendered.contains(&("Broker".to_string(), "lambda-broker".to_string())));
        assert!(rendered.contains(&("Trigger".to_string(), "echo-trigger".to_string())));
        assert!(rendered.contains(&("Exchange".to_string(), "lambda-dlq-exchange".to_string())));
        assert!(rendered.contains(&("Queue".to_string(), "lambda-dlq-queue".to_string())));
        assert!(rendered.contains(&("Service".to_string(), "echo".to_string())));
        assert!(rendered.contains(&("ApiServerSource".to_string(), "lambda-events".to_string())));
    }

    #[test]
    fn broker_override_is_honored_and_owned() {
        let renderer = TopologyRenderer::for_tests();
        let docs = renderer
            .render_function_topology(&test_function(Some("payments-broker")), "img:tag")
            .unwrap();
        let broker_doc = &docs[0];
        assert!(broker_doc.yaml.contains("name: payments-broker"));
        assert!(broker_doc.owned, "per-function broker must cascade");

        let shared = renderer
            .render_function_topology(&test_function(None), "img:tag")
            .unwrap();
        assert!(!shared[0].owned, "shared broker must not cascade");
    }

    #[test]
    fn agent_brokers_are_per_agent() {
        let renderer = TopologyRenderer::for_tests();
        let mut agent = LambdaAgent::new(
            "support-bot",
            AgentSpec {
                description: None,
                eventing: None,
            },
        );
        agent.metadata.namespace = Some("default".to_string());
        let docs = renderer.render_agent_topology(&agent).unwrap();
        assert!(docs[0].yaml.contains("name: support-bot-broker"));
        assert!(docs[0].owned);
    }

    #[test]
    fn trigger_filters_on_the_bounded_invoke_types() {
        let renderer = TopologyRenderer::for_tests();
        let docs = renderer
            .render_function_topology(&test_function(None), "img:tag")
            .unwrap();
        let trigger = docs
            .iter()
            .find(|doc| doc.yaml.contains("kind: Trigger"))
            .unwrap();
        assert!(trigger.yaml.contains("io.knative.lambda.invoke.request"));
        assert!(trigger.yaml.contains("io.knative.lambda.invoke.async"));
        assert!(!trigger.yaml.contains("io.knative.lambda.lifecycle"));
    }

    #[test]
    fn dlq_queue_carries_the_policy_arguments() {
        let renderer = TopologyRenderer::for_tests();
        let docs = renderer
            .render_function_topology(&test_function(None), "img:tag")
            .unwrap();
        let dlq = docs.iter().find(|doc| doc.yaml.contains("kind: Queue")).unwrap();
        assert!(dlq.yaml.contains("x-message-ttl: 604800000"));
        assert!(dlq.yaml.contains("x-max-length: 100000"));
        assert!(dlq.yaml.contains("x-overflow: reject-publish"));
        assert!(dlq.yaml.contains("type: quorum"));
        assert!(dlq.yaml.contains("routingKey: io.knative.lambda.dlq.#"));
    }

    #[test]
    fn rendered_documents_parse_as_yaml() {
        let renderer = TopologyRenderer::for_tests();
        let docs = renderer
            .render_function_topology(&test_function(None), "img:tag")
            .unwrap();
        for doc in &docs {
            for yaml in split_documents(&doc.yaml) {
                let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
                assert!(parsed["apiVersion"].as_str().is_some());
                assert!(parsed["kind"].as_str().is_some());
            }
        }
    }

    #[test]
    fn plurals_handle_the_y_class() {
        assert_eq!(plural_for("Broker"), "brokers");
        assert_eq!(plural_for("Policy"), "policies");
        assert_eq!(plural_for("Queue"), "queues");
    }

    #[test]
    fn service_renders_runtime_env_and_timeout() {
        let renderer = TopologyRenderer::for_tests();
        let mut function = test_function(None);
        function.spec.runtime.timeout_seconds = 120;
        function.spec.runtime.env = Some(
            [("LOG_LEVEL".to_string(), "debug".to_string())]
                .into_iter()
                .collect(),
        );
        let docs = renderer
            .render_function_topology(&function, "localhost:5000/default/echo:abc")
            .unwrap();
        let service = docs
            .iter()
            .find(|doc| doc.yaml.lines().any(|line| line == "kind: Service"))
            .unwrap();
        assert!(service.yaml.contains("timeoutSeconds: 120"));
        assert!(service.yaml.contains("name: LOG_LEVEL"));
        assert!(service.yaml.contains("image: localhost:5000/default/echo:abc"));
    }
}
