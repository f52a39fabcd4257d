use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};

use super::{ApiError, error_response, issuer_error};
use crate::{app_state::AppState, db::models::Authorization, ledger::CaptureOutcome};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ReleaseResponse {
    pub released: u64,
}

#[derive(Debug, Deserialize)]
pub struct CaptureParams {
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub currency: String,
}

/// GET /-/live
pub async fn live() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// GET /-/ready
pub async fn ready(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    state.issuer.ping().await.map_err(|e| {
        tracing::warn!(error = %e, "readiness check failed");
        error_response(StatusCode::SERVICE_UNAVAILABLE, "database unavailable")
    })?;
    Ok(Json(HealthResponse { status: "ok" }))
}

/// POST /dev/holds/release
pub async fn release_holds(State(state): State<AppState>) -> Result<Json<ReleaseResponse>, ApiError> {
    let released = state
        .issuer
        .release_expired_holds()
        .await
        .map_err(issuer_error)?;
    Ok(Json(ReleaseResponse { released }))
}

/// GET /dev/auths/{auth_id}
pub async fn get_auth(
    Path(auth_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Authorization>, ApiError> {
    let auth = state.issuer.get_auth(&auth_id).await.map_err(issuer_error)?;
    Ok(Json(auth))
}

/// POST /dev/auths/{auth_id}/capture?amount=&currency=
///
/// Omitted amount captures the full hold.
pub async fn capture_auth(
    Path(auth_id): Path<String>,
    Query(params): Query<CaptureParams>,
    State(state): State<AppState>,
) -> Result<Json<CaptureOutcome>, ApiError> {
    let outcome = state
        .issuer
        .capture_auth(&auth_id, params.amount, &params.currency)
        .await
        .map_err(issuer_error)?;
    Ok(Json(outcome))
}

/// POST /dev/auths/{auth_id}/reverse
pub async fn reverse_auth(
    Path(auth_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Authorization>, ApiError> {
    let auth = state
        .issuer
        .reverse_auth(&auth_id)
        .await
        .map_err(issuer_error)?;
    Ok(Json(auth))
}
