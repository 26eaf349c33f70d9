//! Local HTTP diagnostics endpoint.
//!
//! Every program serves `GET /health` and `GET /debug/vars` (the live
//! [`Stats`] counters as JSON) on the configured address, `0.0.0.0:6060` by
//! default.  Failing to bind is logged and otherwise ignored so that several
//! programs can run on one machine.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::{routing::get, Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::DiagnosticsConfig;
use crate::stats::Stats;

#[derive(Clone)]
pub struct DiagnosticsState {
    program: &'static str,
    stats: Arc<Stats>,
    started: Instant,
}

impl DiagnosticsState {
    pub fn new(program: &'static str, stats: Arc<Stats>) -> Self {
        Self {
            program,
            stats,
            started: Instant::now(),
        }
    }
}

/// Axum handler for `GET /health`.
async fn health_handler(State(state): State<DiagnosticsState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "program": state.program,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started.elapsed().as_secs(),
    }))
}

/// Axum handler for `GET /debug/vars`.
async fn vars_handler(State(state): State<DiagnosticsState>) -> impl IntoResponse {
    Json(state.stats.snapshot())
}

async fn fallback() -> (axum::http::StatusCode, &'static str) {
    (axum::http::StatusCode::NOT_FOUND, "not found")
}

pub fn router(state: DiagnosticsState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/debug/vars", get(vars_handler))
        .fallback(fallback)
        .with_state(state)
}

/// Serve the diagnostics router in the background until `shutdown`.
///
/// Returns `None` when diagnostics are disabled.
pub fn spawn(
    config: &DiagnosticsConfig,
    program: &'static str,
    stats: Arc<Stats>,
    shutdown: CancellationToken,
) -> Option<JoinHandle<()>> {
    if !config.enabled {
        return None;
    }

    let addr = config.listen_address;
    let app = router(DiagnosticsState::new(program, stats));

    Some(tokio::spawn(async move {
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(%addr, error = %e, "diagnostics endpoint unavailable");
                return;
            }
        };
        info!(%addr, "diagnostics listening");

        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
        {
            warn!(error = %e, "diagnostics server failed");
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt; // for `oneshot`

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 10_000)
            .await
            .unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = router(DiagnosticsState::new("test-server", Stats::new()));
        let (status, json) = get_json(app, "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["program"], "test-server");
        assert!(json["version"].is_string());
        assert!(json["uptime_secs"].is_number());
    }

    #[tokio::test]
    async fn test_vars_reflect_counters() {
        let stats = Stats::new();
        stats.connection_established();
        stats.add_written(42);

        let app = router(DiagnosticsState::new("test-client", stats));
        let (status, json) = get_json(app, "/debug/vars").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["connections_established"], 1);
        assert_eq!(json["bytes_written"], 42);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let app = router(DiagnosticsState::new("test-client", Stats::new()));
        let (status, _) = get_json(app, "/debug/pprof").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_spawn_disabled() {
        let config = DiagnosticsConfig {
            enabled: false,
            ..DiagnosticsConfig::default()
        };
        assert!(spawn(&config, "test", Stats::new(), CancellationToken::new()).is_none());
    }

    #[tokio::test]
    async fn test_spawn_stops_on_shutdown() {
        let config = DiagnosticsConfig {
            enabled: true,
            listen_address: "127.0.0.1:0".parse().unwrap(),
        };
        let token = CancellationToken::new();
        let handle = spawn(&config, "test", Stats::new(), token.clone()).unwrap();
        token.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
