//! # Blob Context Sweeper
//!
//! Inline contexts ride the owner-reference cascade; blob contexts cannot,
//! so a background task sweeps the blob backends on a fixed cadence,
//! deleting archives past the retention window unless a live Function still
//! references their content hash.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use kube::api::Api;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::context::store::ContextStore;

use crate::models::LambdaFunction;

use super::{controller, Ctx};

/// Run the sweep loop until cancelled.
pub async fn run(ctx: Arc<Ctx>, cancel: CancellationToken) {
    let interval = Duration::from_secs(ctx.config.sweep_interval_secs);
    let retention = chrono::Duration::seconds(ctx.config.sweep_retention_secs as i64);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("context sweeper stopping");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        controller::refresh_function_gauges(&ctx).await;

        // No listing means no deleting this round: deleting blindly could
        // take out contexts that are still referenced.
        let keep = match live_content_hashes(&ctx).await {
            Some(keep) => keep,
            None => continue,
        };
        for store in ctx.stores.blob_stores() {
            match store.sweep(retention, &keep).await {
                Ok(0) => {}
                Ok(deleted) => {
                    info!(backend = store.name(), deleted, "swept expired build contexts")
                }
                Err(err) => warn!(backend = store.name(), "context sweep failed: {err}"),
            }
        }
    }
}

/// Content hashes still referenced by any Function's status, or `None`
/// when the listing failed.
async fn live_content_hashes(ctx: &Ctx) -> Option<HashSet<String>> {
    let api: Api<LambdaFunction> = Api::all(ctx.client.clone());
    match api.list(&Default::default()).await {
        Ok(functions) => Some(
            functions
                .items
                .iter()
                .filter_map(|f| f.status.as_ref().and_then(|s| s.last_content_hash.clone()))
                .collect(),
        ),
        Err(err) => {
            warn!("listing functions for sweep failed, skipping this round: {err}");
            None
        }
    }
}
