//! # Agent Reconciler
//!
//! Agents skip the build pipeline entirely: reconciling one means
//! materializing its per-agent broker and the DLQ wiring, then reporting
//! Ready. Same error discipline as functions: permanent kinds park the
//! agent with a kind-tagged condition, transient kinds requeue with
//! backoff.

use std::sync::Arc;
use std::time::Duration;

use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{info, warn};

use crate::models::{Condition, LambdaAgent};
use crate::{metrics, OperatorError, Result};

use super::function::backoff_seconds;
use super::Ctx;

const REQUEUE_STEADY: Duration = Duration::from_secs(300);

pub async fn reconcile(agent: Arc<LambdaAgent>, ctx: Arc<Ctx>) -> Result<Action> {
    let name = agent.name_any();
    let namespace = agent.namespace().unwrap_or_else(|| "default".to_string());

    if agent.meta().deletion_timestamp.is_some() {
        info!(agent = %name, namespace = %namespace, "deletion observed, waiting for cascade");
        return Ok(Action::await_change());
    }

    match ctx.renderer.apply_agent_topology(&agent).await {
        Ok(()) => {
            patch_status(
                &ctx,
                &agent,
                json!({
                    "phase": "Ready",
                    "brokerName": agent.broker_name(),
                    "conditions": [Condition::new(
                        "Ready",
                        true,
                        "Reconciled",
                        "agent broker and DLQ wiring applied",
                    )],
                }),
            )
            .await?;
            info!(agent = %name, broker = %agent.broker_name(), "agent topology applied");
            Ok(Action::requeue(REQUEUE_STEADY))
        }
        Err(err) if err.is_permanent() => {
            warn!(agent = %name, kind = %err.kind(), "permanent agent failure: {err}");
            metrics::record_error("agent-reconcile", err.kind());
            patch_status(
                &ctx,
                &agent,
                json!({
                    "phase": "Failed",
                    "conditions": [Condition::new("Ready", false, err.kind().as_str(), err.to_string())],
                }),
            )
            .await?;
            Ok(Action::await_change())
        }
        Err(err) => {
            metrics::record_error("agent-reconcile", err.kind());
            Err(err)
        }
    }
}

pub fn error_policy(agent: Arc<LambdaAgent>, err: &OperatorError, ctx: Arc<Ctx>) -> Action {
    let key = format!("agent/{}/{}", agent.namespace().unwrap_or_default(), agent.name_any());
    let attempt = {
        let mut entry = ctx.backoffs.entry(key).or_insert(0);
        *entry += 1;
        *entry
    };
    warn!(
        agent = %agent.name_any(),
        kind = %err.kind(),
        attempt,
        "agent reconcile failed transiently: {err}"
    );
    Action::requeue(Duration::from_secs(backoff_seconds(attempt)))
}

async fn patch_status(ctx: &Ctx, agent: &LambdaAgent, status: serde_json::Value) -> Result<()> {
    let namespace = agent.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<LambdaAgent> = Api::namespaced(ctx.client.clone(), &namespace);
    api.patch_status(
        &agent.name_any(),
        &PatchParams::default(),
        &Patch::Merge(json!({ "status": status })),
    )
    .await?;
    Ok(())
}
