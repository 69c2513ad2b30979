//! # Function Phase Machine
//!
//! Drives `Pending -> Building -> Deploying -> Ready`, with `Failed` on any
//! permanent classification and `Deleting` once the deletion timestamp is
//! observed (the owner-reference cascade does the actual teardown; the
//! reconciler only waits).
//!
//! Reconciles are cheap in the steady state: a Ready function whose
//! generation is unchanged does no fetching and no hashing. Spec mutations
//! bump the generation, which forces the fetch+hash path; an unchanged
//! content hash there means "no rebuild", just a re-apply of the event
//! wiring.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{info, warn};

use crate::build::orchestrator::classify_build_failure;
use crate::metrics;
use crate::models::{Condition, ContextMetadata, EventType, FunctionPhase, LambdaFunction};
use crate::{OperatorError, Result};

use super::Ctx;

/// Requeue cadence while a build is in flight.
const REQUEUE_BUILDING: Duration = Duration::from_secs(10);
/// Requeue cadence for healthy, steady-state functions.
const REQUEUE_STEADY: Duration = Duration::from_secs(300);
/// Ceiling of the transient-error requeue backoff.
const ERROR_BACKOFF_CEILING_SECS: u64 = 600;

/// What this pass has to do, decided purely from the observed object.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Step {
    /// Deletion observed; wait for the cascade.
    Deleting,
    /// A build job is in flight; probe it.
    ProbeBuild { job_name: String },
    /// Ready and unchanged; nothing to recompute.
    Steady,
    /// Build finished; the topology still needs applying.
    Deploy { image_ref: String },
    /// Fetch, fabricate, store, submit.
    Pipeline,
}

pub(crate) fn next_step(function: &LambdaFunction) -> Step {
    if function.meta().deletion_timestamp.is_some() {
        return Step::Deleting;
    }
    let status = function.status.clone().unwrap_or_default();
    match status.phase {
        FunctionPhase::Building => match status.build_job_ref {
            Some(job_name) => Step::ProbeBuild { job_name },
            None => Step::Pipeline,
        },
        FunctionPhase::Deploying => match status.image_ref {
            Some(image_ref) => Step::Deploy { image_ref },
            None => Step::Pipeline,
        },
        FunctionPhase::Ready => {
            if status.observed_generation == function.meta().generation {
                Step::Steady
            } else {
                Step::Pipeline
            }
        }
        FunctionPhase::Pending | FunctionPhase::Failed | FunctionPhase::Deleting => Step::Pipeline,
    }
}

fn reconcile_key(function: &LambdaFunction) -> String {
    format!(
        "{}/{}",
        function.namespace().unwrap_or_default(),
        function.name_any()
    )
}

/// Requeue delay after `attempt` consecutive transient failures, capped at
/// the ten-minute ceiling.
pub(crate) fn backoff_seconds(attempt: u32) -> u64 {
    1u64.checked_shl(attempt.min(16))
        .unwrap_or(ERROR_BACKOFF_CEILING_SECS)
        .min(ERROR_BACKOFF_CEILING_SECS)
}

pub async fn reconcile(function: Arc<LambdaFunction>, ctx: Arc<Ctx>) -> Result<Action> {
    let started = Instant::now();
    metrics::WORKQUEUE_DEPTH.inc();
    let phase = function
        .status
        .as_ref()
        .map(|s| s.phase)
        .unwrap_or_default();

    let outcome = run(&function, &ctx).await;

    metrics::WORKQUEUE_DEPTH.dec();
    let elapsed = started.elapsed().as_secs_f64();
    match &outcome {
        Ok(_) => {
            ctx.backoffs.remove(&reconcile_key(&function));
            metrics::record_reconcile(phase.as_str(), "success", elapsed);
        }
        Err(err) => {
            metrics::record_reconcile(phase.as_str(), "error", elapsed);
            metrics::record_error("reconcile", err.kind());
        }
    }
    outcome
}

/// Transient errors bubble out of [`reconcile`] so the controller requeues
/// with backoff; this policy supplies the delay.
pub fn error_policy(function: Arc<LambdaFunction>, err: &OperatorError, ctx: Arc<Ctx>) -> Action {
    let key = reconcile_key(&function);
    let attempt = {
        let mut entry = ctx.backoffs.entry(key).or_insert(0);
        *entry += 1;
        *entry
    };
    let seconds = backoff_seconds(attempt);
    warn!(
        function = %function.name_any(),
        kind = %err.kind(),
        attempt,
        requeue_seconds = seconds,
        "reconcile failed transiently: {err}"
    );
    Action::requeue(Duration::from_secs(seconds))
}

async fn run(function: &LambdaFunction, ctx: &Ctx) -> Result<Action> {
    let name = function.name_any();
    let namespace = function.namespace().unwrap_or_else(|| "default".to_string());

    let result = match next_step(function) {
        Step::Deleting => {
            info!(function = %name, namespace = %namespace, "deletion observed, waiting for cascade");
            ctx.emitter
                .emit(EventType::LifecycleDeleted, &namespace, &name, json!({}))
                .await;
            return Ok(Action::await_change());
        }
        Step::Steady => return Ok(Action::requeue(REQUEUE_STEADY)),
        Step::ProbeBuild { job_name } => probe_build(function, ctx, &namespace, &name, &job_name).await,
        Step::Deploy { image_ref } => deploy(function, ctx, &namespace, &name, &image_ref).await,
        Step::Pipeline => pipeline(function, ctx, &namespace, &name).await,
    };

    match result {
        Ok(action) => Ok(action),
        // Permanent kinds stop here: Failed phase, kind-tagged condition,
        // no more retries until the spec changes.
        Err(err) if err.is_permanent() => fail(function, ctx, &namespace, &name, err).await,
        Err(err) => Err(err),
    }
}

/// Fetch, fabricate, store and submit; or short-circuit to deploy when the
/// content hash is unchanged and an image already exists.
async fn pipeline(
    function: &LambdaFunction,
    ctx: &Ctx,
    namespace: &str,
    name: &str,
) -> Result<Action> {
    let source = ctx.fetcher.fetch(function).await?;
    let fabricated =
        ctx.fabricator
            .fabricate(name, namespace, &function.spec.runtime, &source.bytes)?;

    let status = function.status.clone().unwrap_or_default();
    if status.last_content_hash.as_deref() == Some(fabricated.content_hash.as_str()) {
        if let Some(image_ref) = status.image_ref.clone() {
            info!(
                function = %name,
                content_hash = %fabricated.content_hash,
                "content unchanged, skipping rebuild"
            );
            return deploy(function, ctx, namespace, name, &image_ref).await;
        }
    }

    let store = ctx
        .stores
        .select(function.storage_annotation(), fabricated.archive.len())?;
    let meta = ContextMetadata::new(name, namespace, &fabricated.content_hash);
    let owner = function.controller_owner_ref(&());
    let key = format!("{namespace}/{name}/{}.tar.gz", fabricated.content_hash);
    let location = store
        .save(&key, &fabricated.archive, &meta, owner.as_ref())
        .await?;
    info!(
        function = %name,
        namespace = %namespace,
        backend = store.name(),
        content_hash = %fabricated.content_hash,
        "build context stored"
    );

    let job_name = ctx
        .orchestrator
        .submit(function, &fabricated.content_hash, &fabricated.image_tag, &location)
        .await?;

    patch_status(
        ctx,
        function,
        json!({
            "phase": "Building",
            "lastContentHash": fabricated.content_hash,
            "buildJobRef": job_name,
            "observedGeneration": function.meta().generation,
            "conditions": [Condition::new(
                "Ready",
                false,
                "Building",
                format!("build job {job_name} submitted"),
            )],
        }),
    )
    .await?;

    ctx.emitter
        .emit(
            EventType::LifecycleBuildStarted,
            namespace,
            name,
            json!({
                "contentHash": fabricated.content_hash,
                "imageTag": fabricated.image_tag,
                "buildJob": job_name,
            }),
        )
        .await;

    Ok(Action::requeue(REQUEUE_BUILDING))
}

async fn probe_build(
    function: &LambdaFunction,
    ctx: &Ctx,
    namespace: &str,
    name: &str,
    job_name: &str,
) -> Result<Action> {
    let build = ctx.orchestrator.get_build_status(namespace, job_name).await?;
    if !build.completed {
        return Ok(Action::requeue(REQUEUE_BUILDING));
    }

    let runtime = function.spec.runtime.language.as_str();
    metrics::BUILD_JOBS_ACTIVE
        .with_label_values(&[namespace])
        .dec();

    if build.success {
        let image_ref = build.image_uri.ok_or_else(|| {
            OperatorError::Internal("completed build reported no image reference".to_string())
        })?;
        metrics::record_build(runtime, "success", build.duration_seconds.unwrap_or(0.0));
        info!(function = %name, image = %image_ref, "build completed");

        ctx.emitter
            .emit(
                EventType::LifecycleBuildCompleted,
                namespace,
                name,
                json!({"imageRef": image_ref, "buildJob": job_name}),
            )
            .await;

        patch_status(
            ctx,
            function,
            json!({
                "phase": "Deploying",
                "imageRef": image_ref,
                "buildJobRef": null,
            }),
        )
        .await?;

        return deploy(function, ctx, namespace, name, &image_ref).await;
    }

    let message = build.error.unwrap_or_else(|| "Build job failed".to_string());
    metrics::record_build(runtime, "failure", build.duration_seconds.unwrap_or(0.0));
    ctx.emitter
        .emit(
            EventType::LifecycleBuildFailed,
            namespace,
            name,
            json!({"buildJob": job_name, "message": message}),
        )
        .await;
    // Permanent kinds (deps, Dockerfile, OOM) stop in `run`; timeouts and
    // pull throttling bubble out as transient for a backed-off retry.
    Err(classify_build_failure(&message))
}

async fn deploy(
    function: &LambdaFunction,
    ctx: &Ctx,
    namespace: &str,
    name: &str,
    image_ref: &str,
) -> Result<Action> {
    ctx.renderer.apply_function_topology(function, image_ref).await?;

    let was_ready = function
        .status
        .as_ref()
        .map(|s| s.phase == FunctionPhase::Ready)
        .unwrap_or(false);

    patch_status(
        ctx,
        function,
        json!({
            "phase": "Ready",
            "imageRef": image_ref,
            "observedGeneration": function.meta().generation,
            "conditions": [Condition::new(
                "Ready",
                true,
                "Reconciled",
                "function is built, deployed and event-wired",
            )],
        }),
    )
    .await?;

    if !was_ready {
        ctx.emitter
            .emit(
                EventType::LifecycleDeployed,
                namespace,
                name,
                json!({"imageRef": image_ref}),
            )
            .await;
        ctx.emitter
            .emit(
                EventType::LifecycleReady,
                namespace,
                name,
                json!({"imageRef": image_ref}),
            )
            .await;
        info!(function = %name, namespace = %namespace, "function ready");
    }

    Ok(Action::requeue(REQUEUE_STEADY))
}

/// Terminal handling for permanent failures: Failed phase, kind-tagged
/// condition, no further retries until the spec changes.
async fn fail(
    function: &LambdaFunction,
    ctx: &Ctx,
    namespace: &str,
    name: &str,
    err: OperatorError,
) -> Result<Action> {
    warn!(
        function = %name,
        namespace = %namespace,
        kind = %err.kind(),
        "permanent failure: {err}"
    );

    patch_status(
        ctx,
        function,
        json!({
            "phase": "Failed",
            "observedGeneration": function.meta().generation,
            "conditions": [Condition::new("Ready", false, err.kind().as_str(), err.to_string())],
        }),
    )
    .await?;

    ctx.emitter
        .emit(
            EventType::LifecycleFailed,
            namespace,
            name,
            json!({"reason": err.kind().as_str(), "message": err.to_string()}),
        )
        .await;

    Ok(Action::await_change())
}

async fn patch_status(
    ctx: &Ctx,
    function: &LambdaFunction,
    status: serde_json::Value,
) -> Result<()> {
    let namespace = function.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<LambdaFunction> = Api::namespaced(ctx.client.clone(), &namespace);
    api.patch_status(
        &function.name_any(),
        &PatchParams::default(),
        &Patch::Merge(json!({ "status": status })),
    )
    .await?;
    Ok(())
}
