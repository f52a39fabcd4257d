use axum::{Json, extract::State};

use super::{ApiError, issuer_error};
use crate::{
    app_state::AppState,
    db::models::Authorization,
    issuer::models::{AuthorizationRequest, AuthorizationResponse, CaptureRequest, ReverseRequest},
    ledger::CaptureOutcome,
};

/// POST /authorizations
///
/// Declines are 200 responses; the approval code says what happened.
pub async fn authorize(
    State(state): State<AppState>,
    Json(req): Json<AuthorizationRequest>,
) -> Result<Json<AuthorizationResponse>, ApiError> {
    let response = state.issuer.authorize(req).await.map_err(issuer_error)?;
    Ok(Json(response))
}

/// POST /authorizations/capture
pub async fn capture(
    State(state): State<AppState>,
    Json(req): Json<CaptureRequest>,
) -> Result<Json<CaptureOutcome>, ApiError> {
    let outcome = state
        .issuer
        .capture_by_stan(req)
        .await
        .map_err(issuer_error)?;
    Ok(Json(outcome))
}

/// POST /authorizations/reverse
pub async fn reverse(
    State(state): State<AppState>,
    Json(req): Json<ReverseRequest>,
) -> Result<Json<Authorization>, ApiError> {
    let auth = state
        .issuer
        .reverse_by_stan(req)
        .await
        .map_err(issuer_error)?;
    Ok(Json(auth))
}
