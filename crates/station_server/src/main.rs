use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{FactorKind, VoterId},
    error::{ApiError, ErrorCode},
    protocol::{
        CastVoteRequest, CastVoteResponse, LedgerBlock, RegisterFingerprintRequest,
        RegisterFingerprintResponse, ScannerConnectRequest, ScannerStatusResponse,
        StationConfigResponse, VerifyRequest, VerifyResponse,
    },
};
use tracing::info;

mod api;
mod config;
mod ledger;

use api::{MatchPolicy, ScannerState, StationContext};
use config::load_settings;

#[derive(Clone)]
struct AppState {
    station: StationContext,
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerAudit {
    valid: bool,
    blocks: usize,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let station = StationContext::new(
        settings.registered_voters.iter().map(VoterId::new),
        MatchPolicy {
            similarity_threshold: settings.similarity_threshold,
            simulated_confidence: settings.simulated_confidence,
        },
        settings.scanner_port.clone(),
        ScannerState {
            connected: settings.scanner_connected,
            port: settings
                .scanner_connected
                .then(|| settings.scanner_port.clone()),
        },
    );
    info!(
        voters = settings.registered_voters.len(),
        threshold = settings.similarity_threshold,
        scanner_connected = settings.scanner_connected,
        "station configured"
    );

    let app = build_router(Arc::new(AppState { station }));

    let addr: SocketAddr = settings.bind_addr.parse()?;
    info!(%addr, "station server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/config", get(http_config))
        .route("/scanner/status", get(http_scanner_status))
        .route("/scanner/connect", post(http_connect_scanner))
        .route("/scanner/disconnect", post(http_disconnect_scanner))
        .route("/verify/:factor", post(http_verify))
        .route("/register", post(http_register_fingerprint))
        .route("/vote", post(http_cast_vote))
        .route("/ledger", get(http_ledger))
        .route("/ledger/verify", get(http_audit_ledger))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn http_config(State(state): State<Arc<AppState>>) -> Json<StationConfigResponse> {
    Json(api::station_config(&state.station).await)
}

async fn http_scanner_status(State(state): State<Arc<AppState>>) -> Json<ScannerStatusResponse> {
    Json(api::scanner_status(&state.station).await)
}

async fn http_connect_scanner(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ScannerConnectRequest>,
) -> Json<ScannerStatusResponse> {
    Json(api::connect_scanner(&state.station, req.port).await)
}

async fn http_disconnect_scanner(
    State(state): State<Arc<AppState>>,
) -> Json<ScannerStatusResponse> {
    Json(api::disconnect_scanner(&state.station).await)
}

async fn http_verify(
    State(state): State<Arc<AppState>>,
    Path(factor): Path<String>,
    Json(req): Json<VerifyRequest>,
) -> ApiResult<VerifyResponse> {
    let factor = FactorKind::from_path_segment(&factor).ok_or_else(|| {
        failure(ApiError::new(
            ErrorCode::NotFound,
            format!("unknown verification factor '{factor}'"),
        ))
    })?;
    api::verify_factor(&state.station, factor, req)
        .await
        .map(Json)
        .map_err(failure)
}

async fn http_register_fingerprint(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterFingerprintRequest>,
) -> ApiResult<RegisterFingerprintResponse> {
    api::register_fingerprint(&state.station, req)
        .await
        .map(Json)
        .map_err(failure)
}

async fn http_cast_vote(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CastVoteRequest>,
) -> ApiResult<CastVoteResponse> {
    api::cast_vote(&state.station, req)
        .await
        .map(Json)
        .map_err(failure)
}

async fn http_ledger(State(state): State<Arc<AppState>>) -> Json<Vec<LedgerBlock>> {
    Json(api::ledger_blocks(&state.station).await)
}

async fn http_audit_ledger(State(state): State<Arc<AppState>>) -> Json<LedgerAudit> {
    let (valid, blocks) = api::audit_ledger(&state.station).await;
    Json(LedgerAudit { valid, blocks })
}

fn failure(error: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match error.code {
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::DeviceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::AlreadyVoted => StatusCode::CONFLICT,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(error))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
