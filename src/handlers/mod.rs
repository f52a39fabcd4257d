pub mod accounts;
pub mod admin;
pub mod authorizations;
pub mod cards;

use axum::{
    Json, Router,
    http::StatusCode,
    routing::{get, post},
};
use serde::Serialize;

use crate::app_state::AppState;
use crate::cardgen::PanError;
use crate::crypto::CvvError;
use crate::issuer::IssuerError;
use crate::ledger::LedgerError;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub status: String,
    pub reason: String,
}

pub type ApiError = (StatusCode, Json<ErrorBody>);

pub fn error_response(status: StatusCode, reason: &str) -> ApiError {
    (
        status,
        Json(ErrorBody {
            status: "ERROR".to_string(),
            reason: reason.to_string(),
        }),
    )
}

fn ledger_status(err: &LedgerError) -> StatusCode {
    match err {
        LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
        LedgerError::Conflict(_)
        | LedgerError::InvalidState(_)
        | LedgerError::CardClosed
        | LedgerError::IdempotencyMismatch { .. } => StatusCode::CONFLICT,
        LedgerError::InsufficientFunds
        | LedgerError::CurrencyMismatch { .. }
        | LedgerError::InvalidAmount(_) => StatusCode::UNPROCESSABLE_ENTITY,
        LedgerError::Timeout => StatusCode::SERVICE_UNAVAILABLE,
        LedgerError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Malformed input is a client error; a failed uniqueness lookup or running
/// out of fresh PANs is ours.
fn pan_status(err: &PanError) -> StatusCode {
    match err {
        PanError::ExistsCheck(source) => match source.downcast_ref::<LedgerError>() {
            Some(LedgerError::Timeout) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
        PanError::Exhausted { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    }
}

/// Internal failures are logged here and reported without detail.
pub fn issuer_error(err: IssuerError) -> ApiError {
    let status = match &err {
        IssuerError::Validation(_) | IssuerError::Expiry(_) => StatusCode::BAD_REQUEST,
        IssuerError::Pan(pan) => pan_status(pan),
        IssuerError::Cvv(CvvError::Key(_) | CvvError::Module(_)) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        IssuerError::Cvv(_) => StatusCode::BAD_REQUEST,
        IssuerError::CardNotFound | IssuerError::AuthNotFound(_) => StatusCode::NOT_FOUND,
        IssuerError::CardConflict { .. } => StatusCode::CONFLICT,
        IssuerError::Ledger(ledger) => ledger_status(ledger),
    };

    if status.is_server_error() {
        tracing::error!(error = %err, "request failed");
        return error_response(status, "internal error");
    }
    error_response(status, &err.to_string())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // Accounts
        .route("/accounts", post(accounts::create_account))
        .route("/accounts/{account_id}", get(accounts::get_account))
        .route(
            "/accounts/{account_id}/cards",
            post(accounts::issue_card).get(accounts::list_cards),
        )
        .route(
            "/accounts/{account_id}/transactions",
            get(accounts::list_transactions),
        )
        // Authorization workflow
        .route("/authorizations", post(authorizations::authorize))
        .route("/authorizations/capture", post(authorizations::capture))
        .route("/authorizations/reverse", post(authorizations::reverse))
        // Cards
        .route("/cards/{card_id}/status", post(cards::set_status))
        .route("/cards/cvv/dynamic", post(cards::dynamic_cvv))
        .route("/cards/cvv/static", post(cards::static_cvv))
        // Health and operator endpoints
        .route("/-/live", get(admin::live))
        .route("/-/ready", get(admin::ready))
        .route("/dev/holds/release", post(admin::release_holds))
        .route("/dev/auths/{auth_id}", get(admin::get_auth))
        .route("/dev/auths/{auth_id}/capture", post(admin::capture_auth))
        .route("/dev/auths/{auth_id}/reverse", post(admin::reverse_auth))
        .with_state(state)
}
