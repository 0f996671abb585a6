//! Metrics, health and debug endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info};
use tsproxy_events::ProxyMetrics;

use crate::proxy::Manager;

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub manager: Arc<Manager>,
    pub metrics: Arc<ProxyMetrics>,
}

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Always "ok" while the process is serving.
    pub status: String,

    pub service: String,

    pub version: String,

    /// Listeners currently bound.
    pub listeners: usize,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/healthz", get(healthz))
        .route("/debug/state", get(debug_state))
        .with_state(state)
}

async fn metrics(State(state): State<HttpState>) -> Response {
    match state.metrics.encode() {
        Ok(body) => ([(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn healthz(State(state): State<HttpState>) -> impl IntoResponse {
    let listeners = state.manager.snapshot().await.listener_count();
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "tsproxy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        listeners,
    })
}

async fn debug_state(State(state): State<HttpState>) -> impl IntoResponse {
    Json(state.manager.snapshot().await)
}

/// Serve the endpoints on `addr` until `shutdown` flips to true.
pub async fn serve(
    addr: SocketAddr,
    state: HttpState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics endpoint on {addr}"))?;
    info!(addr = %addr, "Metrics endpoint listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            info!("Metrics endpoint shutting down");
        })
        .await
        .context("Metrics endpoint failed")
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;

    fn state() -> HttpState {
        let metrics = Arc::new(ProxyMetrics::new());
        let manager = Manager::builder()
            .observer(metrics.clone())
            .worker_ids(metrics.worker_ids())
            .build();
        HttpState {
            manager: Arc::new(manager),
            metrics,
        }
    }

    async fn get_body(path: &str) -> (StatusCode, String) {
        let response = router(state())
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_healthz() {
        let (status, body) = get_body("/healthz").await;
        assert_eq!(status, StatusCode::OK);

        let health: HealthResponse = serde_json::from_str(&body).unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.service, "tsproxy");
        assert_eq!(health.listeners, 0);
    }

    #[tokio::test]
    async fn test_metrics() {
        let (status, body) = get_body("/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("tsproxy_worker_total"));
        assert!(body.contains("tsproxy_connection_total"));
    }

    #[tokio::test]
    async fn test_debug_state() {
        let (status, body) = get_body("/debug/state").await;
        assert_eq!(status, StatusCode::OK);

        let state: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert!(state["groups"].as_object().unwrap().is_empty());
        assert!(state["ports"].as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let (status, _) = get_body("/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
