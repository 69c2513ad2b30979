//! # Health and Metrics Endpoints
//!
//! A small HTTP surface next to the controllers: liveness, readiness and
//! the Prometheus registry.

use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{OperatorError, Result};

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics_endpoint() -> String {
    crate::metrics::gather()
}

pub fn router() -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(healthz))
        .route("/metrics", get(metrics_endpoint))
}

/// Serve until the token is cancelled.
pub async fn run(addr: &str, cancel: CancellationToken) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| OperatorError::ConfigError(format!("metrics address {addr:?}: {e}")))?;
    info!(%addr, "health/metrics server listening");

    axum::Server::bind(&addr)
        .serve(router().into_make_service())
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| OperatorError::Internal(format!("metrics server: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::ServiceExt;

    #[tokio::test]
    async fn healthz_responds_ok() {
        let response = router()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/healthz")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_the_registry() {
        crate::metrics::WORKQUEUE_DEPTH.set(0);
        let response = router()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/metrics")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("knative_lambda_operator_workqueue_depth"));
    }
}
