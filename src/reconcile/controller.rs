//! # Controller Wiring
//!
//! Both CRDs get a `kube` runtime controller: per-key serialized,
//! level-triggered reconciles with the error policies from the reconciler
//! modules. Shutdown is cooperative via the shared cancellation token.

use std::sync::Arc;

use futures::StreamExt;
use kube::api::Api;
use kube::runtime::watcher;
use kube::runtime::Controller;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::{LambdaAgent, LambdaFunction};

use super::{agent, function, Ctx};

/// Run both controllers until the token is cancelled.
pub async fn run(ctx: Arc<Ctx>, cancel: CancellationToken) {
    let functions: Api<LambdaFunction> = Api::all(ctx.client.clone());
    let agents: Api<LambdaAgent> = Api::all(ctx.client.clone());

    let function_cancel = cancel.clone();
    let function_controller = Controller::new(functions, watcher::Config::default())
        .graceful_shutdown_on(async move { function_cancel.cancelled().await })
        .run(function::reconcile, function::error_policy, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok((object, action)) => {
                    debug!(function = %object.name, requeue = ?action, "reconciled")
                }
                Err(err) => warn!("function controller error: {err}"),
            }
        });

    let agent_cancel = cancel.clone();
    let agent_controller = Controller::new(agents, watcher::Config::default())
        .graceful_shutdown_on(async move { agent_cancel.cancelled().await })
        .run(agent::reconcile, agent::error_policy, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok((object, action)) => {
                    debug!(agent = %object.name, requeue = ?action, "reconciled")
                }
                Err(err) => warn!("agent controller error: {err}"),
            }
        });

    info!("controllers started");
    tokio::join!(function_controller, agent_controller);
    info!("controllers stopped");
}

/// Refresh the per-namespace function phase gauge from a full list. Called
/// by the sweeper on its cadence; the gauge is observational, not control
/// state.
pub async fn refresh_function_gauges(ctx: &Ctx) {
    let api: Api<LambdaFunction> = Api::all(ctx.client.clone());
    let functions = match api.list(&Default::default()).await {
        Ok(list) => list,
        Err(err) => {
            warn!("function gauge refresh failed: {err}");
            return;
        }
    };

    crate::metrics::LAMBDAFUNCTIONS_TOTAL.reset();
    for function in &functions.items {
        let namespace = function.namespace().unwrap_or_else(|| "default".to_string());
        let phase = function
            .status
            .as_ref()
            .map(|s| s.phase)
            .unwrap_or_default();
        crate::metrics::LAMBDAFUNCTIONS_TOTAL
            .with_label_values(&[namespace.as_str(), phase.as_str()])
            .inc();
    }
}
