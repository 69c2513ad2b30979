// Knative Lambda Operator - control process
// Run with: cargo run --bin operator

//! Starts the controllers, the blob-context sweeper and the health/metrics
//! server, and keeps them running until SIGTERM/ctrl-c.

use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use knative_lambda_operator::reconcile::{controller, sweeper, Ctx};
use knative_lambda_operator::{server, OperatorConfig};

#[derive(Parser, Debug)]
#[command(name = "operator", about = "Kubernetes operator for lambda functions")]
struct Args {
    /// Bind address of the health/metrics endpoint.
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional; deployments set the environment directly.
    let _ = dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = OperatorConfig::from_env();
    if let Some(addr) = args.metrics_addr {
        config.metrics_addr = addr;
    }

    info!("starting knative-lambda-operator");
    info!(
        push_registry = %config.build.default_registry,
        pull_registry = %config.build.pull_registry,
        broker = %config.broker_url,
        "build and eventing configuration loaded"
    );
    if let Some(s3) = &config.s3_context {
        info!(bucket = %s3.bucket, prefix = %s3.prefix, "s3 context backend configured");
    }
    if let Some(gcs) = &config.gcs_context {
        info!(bucket = %gcs.bucket, prefix = %gcs.prefix, "gcs context backend configured");
    }

    let client = Client::try_default().await?;
    let ctx = Arc::new(Ctx::new(client, config.clone())?);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                cancel.cancel();
            }
        });
    }

    let server_task = {
        let cancel = cancel.clone();
        let addr = config.metrics_addr.clone();
        tokio::spawn(async move {
            if let Err(err) = server::run(&addr, cancel).await {
                error!("metrics server exited: {err}");
            }
        })
    };

    let sweeper_task = tokio::spawn(sweeper::run(ctx.clone(), cancel.clone()));

    controller::run(ctx, cancel.clone()).await;

    cancel.cancel();
    let _ = tokio::join!(server_task, sweeper_task);
    info!("operator stopped");
    Ok(())
}
