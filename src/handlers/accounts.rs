use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};

use super::{ApiError, issuer_error};
use crate::{
    app_state::AppState,
    db::models::{Account, Transaction},
    issuer::models::{CardSummary, CreateAccount, IssuedCard},
};

/// POST /accounts
pub async fn create_account(
    State(state): State<AppState>,
    Json(req): Json<CreateAccount>,
) -> Result<(StatusCode, Json<Account>), ApiError> {
    let account = state.issuer.create_account(req).await.map_err(issuer_error)?;
    Ok((StatusCode::CREATED, Json(account)))
}

/// GET /accounts/{account_id}
pub async fn get_account(
    Path(account_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Account>, ApiError> {
    let account = state
        .issuer
        .get_account(&account_id)
        .await
        .map_err(issuer_error)?;
    Ok(Json(account))
}

/// POST /accounts/{account_id}/cards
///
/// The only response that ever carries the full PAN and CVV.
pub async fn issue_card(
    Path(account_id): Path<String>,
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<IssuedCard>), ApiError> {
    let card = state
        .issuer
        .issue_card(&account_id)
        .await
        .map_err(issuer_error)?;
    Ok((StatusCode::CREATED, Json(card)))
}

/// GET /accounts/{account_id}/cards
pub async fn list_cards(
    Path(account_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Vec<CardSummary>>, ApiError> {
    let cards = state
        .issuer
        .list_cards(&account_id)
        .await
        .map_err(issuer_error)?;
    Ok(Json(cards))
}

/// GET /accounts/{account_id}/transactions
pub async fn list_transactions(
    Path(account_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Vec<Transaction>>, ApiError> {
    let txs = state
        .issuer
        .list_transactions(&account_id)
        .await
        .map_err(issuer_error)?;
    Ok(Json(txs))
}
