use axum::{
    Json,
    extract::{Path, State},
};
use serde::{Deserialize, Serialize};

use super::{ApiError, issuer_error};
use crate::{
    app_state::AppState,
    crypto::DynamicCvv,
    db::models::{Card, CardStatus},
    issuer::models::CardLookup,
};

#[derive(Debug, Deserialize)]
pub struct StatusUpdate {
    pub status: CardStatus,
}

#[derive(Debug, Serialize)]
pub struct StaticCvvResponse {
    pub cvv2: String,
}

/// POST /cards/{card_id}/status
pub async fn set_status(
    Path(card_id): Path<String>,
    State(state): State<AppState>,
    Json(req): Json<StatusUpdate>,
) -> Result<Json<Card>, ApiError> {
    let card = state
        .issuer
        .set_card_status(&card_id, req.status)
        .await
        .map_err(issuer_error)?;
    Ok(Json(card))
}

/// POST /cards/cvv/dynamic
pub async fn dynamic_cvv(
    State(state): State<AppState>,
    Json(req): Json<CardLookup>,
) -> Result<Json<DynamicCvv>, ApiError> {
    let code = state
        .issuer
        .display_dynamic_cvv(req)
        .await
        .map_err(issuer_error)?;
    Ok(Json(code))
}

/// POST /cards/cvv/static
pub async fn static_cvv(
    State(state): State<AppState>,
    Json(req): Json<CardLookup>,
) -> Result<Json<StaticCvvResponse>, ApiError> {
    let cvv2 = state.issuer.static_cvv(req).await.map_err(issuer_error)?;
    Ok(Json(StaticCvvResponse { cvv2 }))
}
