//! Thin JSON surface for the surrounding CRUD layer: controller
//! status plus the manual run/stop operations.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::clock::Clock;
use crate::host::HostApi;
use crate::manual::ManualError;
use crate::supervisor::Supervisor;

// ---------------------------------------------------------------------------
// App state shared across handlers
// ---------------------------------------------------------------------------

pub struct AppState<H: HostApi, C: Clock> {
    pub supervisor: Arc<Supervisor<H, C>>,
}

impl<H: HostApi, C: Clock> Clone for AppState<H, C> {
    fn clone(&self) -> Self {
        Self {
            supervisor: Arc::clone(&self.supervisor),
        }
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router<H: HostApi, C: Clock>(state: AppState<H, C>) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/manual/run", post(api_manual_run))
        .route("/api/manual/stop", post(api_manual_stop))
        .with_state(state)
}

async fn api_status<H: HostApi, C: Clock>(
    State(state): State<AppState<H, C>>,
) -> Response {
    match state.supervisor.status().await {
        Ok(status) => Json(serde_json::json!(status)).into_response(),
        Err(e) => {
            error!("status endpoint failed: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct ManualRunRequest {
    zone_id: i64,
    duration_seconds: i64,
}

async fn api_manual_run<H: HostApi, C: Clock>(
    State(state): State<AppState<H, C>>,
    Json(req): Json<ManualRunRequest>,
) -> Response {
    match state
        .supervisor
        .manual()
        .run_zone(req.zone_id, req.duration_seconds)
        .await
    {
        Ok(receipt) => (StatusCode::ACCEPTED, Json(serde_json::json!(receipt))).into_response(),
        Err(e) => manual_error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct ManualStopRequest {
    pump_id: i64,
}

async fn api_manual_stop<H: HostApi, C: Clock>(
    State(state): State<AppState<H, C>>,
    Json(req): Json<ManualStopRequest>,
) -> Response {
    match state.supervisor.manual().stop_pump(req.pump_id).await {
        Ok(receipt) => Json(serde_json::json!(receipt)).into_response(),
        Err(e) => manual_error_response(e),
    }
}

fn manual_error_response(e: ManualError) -> Response {
    let status = match &e {
        ManualError::ZoneNotFound(_) | ManualError::PumpNotFound(_) => StatusCode::NOT_FOUND,
        ManualError::DurationInvalid(_) => StatusCode::BAD_REQUEST,
        ManualError::ExecutorUnavailable => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve<H: HostApi, C: Clock>(supervisor: Arc<Supervisor<H, C>>) {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("failed to bind web port {port}: {e}");
            return;
        }
    };

    info!("api listening on http://{addr}");

    let state = AppState { supervisor };
    if let Err(e) = axum::serve(listener, router(state)).await {
        error!("web server error: {e}");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
