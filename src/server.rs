//! Local HTTP surface of a running engine.
//!
//! - `GET /health` liveness and version
//! - `GET /status` engine state, current posture and the latest blended result
//! - `POST /report` manual congestion report, `{"level": "High"}`
//!
//! # Architecture
//!
//! ```text
//! UI / scripts ──→ POST /report ──→ EngineHandle ──→ report store
//!              ←── GET /status  ←──  (watch channels)
//! ```

use crate::collector::context::LocationProvider;
use crate::core::blend::BlendedResult;
use crate::core::posture::PostureState;
use crate::core::record::UserReportRecord;
use crate::core::scoring::CongestionLevel;
use crate::engine::{EngineHandle, EngineState};
use crate::reports::store::ReportStore;
use crate::reports::submit::SubmitError;
use crate::stats::StatsSnapshot;
use axum::{
    extract::State,
    http::{HeaderValue, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to bind to (0 for random)
    pub port: u16,
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Engine status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub state: EngineState,
    pub posture: PostureState,
    /// Emission time of `result` (ms since epoch)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<BlendedResult>,
    pub stats: StatsSnapshot,
}

/// Manual report request
#[derive(Debug, Deserialize)]
pub struct ReportRequest {
    pub level: String,
}

/// Error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, error: String) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error,
            code: code.to_string(),
            retry_after_ms: None,
        }),
    )
}

/// GET /health
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /status
async fn status<S: ReportStore, L: LocationProvider>(
    State(handle): State<EngineHandle<S, L>>,
) -> Json<StatusResponse> {
    let latest = handle.latest();
    Json(StatusResponse {
        state: handle.state(),
        posture: handle.posture(),
        updated_at: latest.as_ref().map(|o| o.timestamp),
        result: latest.map(|o| o.result),
        stats: handle.stats().snapshot(),
    })
}

/// POST /report
async fn report<S: ReportStore, L: LocationProvider>(
    State(handle): State<EngineHandle<S, L>>,
    Json(request): Json<ReportRequest>,
) -> Result<Json<UserReportRecord>, ApiError> {
    let level: CongestionLevel = request
        .level
        .parse()
        .map_err(|e: String| api_error(StatusCode::BAD_REQUEST, "INVALID_LEVEL", e))?;

    match handle.submit_report(level).await {
        Ok(record) => Ok(Json(record)),
        Err(SubmitError::RateLimited { retry_after_ms }) => Err((
            StatusCode::TOO_MANY_REQUESTS,
            Json(ErrorResponse {
                error: "Please wait before reporting again".to_string(),
                code: "RATE_LIMITED".to_string(),
                retry_after_ms: Some(retry_after_ms),
            }),
        )),
        Err(e @ SubmitError::InvalidLevel(_)) => Err(api_error(
            StatusCode::BAD_REQUEST,
            "INVALID_LEVEL",
            e.to_string(),
        )),
        Err(SubmitError::Store(e)) => {
            tracing::error!("Failed to push report: {}", e);
            Err(api_error(
                StatusCode::BAD_GATEWAY,
                "STORE_ERROR",
                format!("Report store push failed: {e}"),
            ))
        }
    }
}

/// Run the HTTP server
pub async fn run<S: ReportStore, L: LocationProvider>(
    config: ServerConfig,
    handle: EngineHandle<S, L>,
) -> anyhow::Result<(SocketAddr, tokio::sync::oneshot::Sender<()>)> {
    let app = Router::new()
        .route("/health", get(health))
        .route("/status", get(status::<S, L>))
        .route("/report", post(report::<S, L>))
        .layer(
            CorsLayer::new()
                .allow_origin([
                    HeaderValue::from_static("http://localhost"),
                    HeaderValue::from_static("http://127.0.0.1"),
                ])
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(handle);

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    tracing::info!("CrowdSense server listening on http://{}", actual_addr);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Server shutdown signal received");
            })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok((actual_addr, shutdown_tx))
}
