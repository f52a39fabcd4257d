//! Durable account, card, hold and transaction state.
//!
//! Every balance mutation happens inside one short database transaction.
//! Callers never see partial effects: an error before commit rolls the whole
//! operation back.

pub mod db_repository;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::models::{Account, AuthStatus, Authorization, Card, CardStatus, Transaction};

pub use db_repository::SqliteLedger;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("insufficient funds")]
    InsufficientFunds,

    #[error("stan {stan} was already used with a different amount or currency")]
    IdempotencyMismatch { stan: i64 },

    #[error("{0} already exists")]
    Conflict(&'static str),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("authorization is {0}, expected AUTHORIZED")]
    InvalidState(AuthStatus),

    #[error("card is closed")]
    CardClosed,

    #[error("currency mismatch: expected {expected}, got {got}")]
    CurrencyMismatch { expected: String, got: String },

    #[error("invalid amount: {0}")]
    InvalidAmount(i64),

    #[error("ledger operation timed out")]
    Timeout,

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub currency: String,
    pub available_balance: i64,
    pub core_account_id: Option<String>,
}

/// A card to persist. The plaintext PAN is hashed before it reaches the
/// database and is not stored.
#[derive(Debug, Clone)]
pub struct NewCard {
    pub card_id: String,
    pub account_id: String,
    pub bin: String,
    pub pan: String,
    pub expiry_yymm: String,
    pub pan_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HoldRequest {
    pub account_id: String,
    pub card_id: String,
    pub amount: i64,
    pub currency: String,
    pub approval_code: String,
    pub authorization_code: String,
    pub merchant_name: Option<String>,
    pub mcc: Option<String>,
    pub stan: Option<i64>,
    pub hold_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HoldOutcome {
    pub auth_id: String,
    pub approval_code: String,
    pub authorization_code: String,
    /// True when an earlier authorization with the same (card, STAN) was
    /// returned instead of placing a new hold.
    pub duplicate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureOutcome {
    pub auth_id: String,
    pub tx_id: String,
    pub captured: i64,
    pub remaining: i64,
    pub status: AuthStatus,
}

#[async_trait::async_trait]
pub trait LedgerRepository: Send + Sync {
    async fn create_account(&self, account: NewAccount) -> Result<Account, LedgerError>;

    async fn get_account(&self, account_id: &str) -> Result<Account, LedgerError>;

    /// Fails with [`LedgerError::Conflict`] when the PAN hash is taken.
    async fn create_card(&self, card: NewCard) -> Result<Card, LedgerError>;

    async fn pan_exists(&self, pan: &str) -> Result<bool, LedgerError>;

    async fn find_card_for_authorization(
        &self,
        pan: &str,
        expiry_yymm: &str,
    ) -> Result<Option<Card>, LedgerError>;

    async fn update_card_status(
        &self,
        card_id: &str,
        status: CardStatus,
    ) -> Result<Card, LedgerError>;

    async fn list_cards(&self, account_id: &str) -> Result<Vec<Card>, LedgerError>;

    /// Place a hold, or replay the earlier result for a repeated (card, STAN).
    async fn create_auth_and_hold(&self, request: HoldRequest) -> Result<HoldOutcome, LedgerError>;

    async fn get_auth(&self, auth_id: &str) -> Result<Option<Authorization>, LedgerError>;

    async fn find_auth_by_card_stan(
        &self,
        card_id: &str,
        stan: i64,
    ) -> Result<Option<Authorization>, LedgerError>;

    /// `amount <= 0` captures everything still held. An empty `currency`
    /// accepts the authorization's currency.
    async fn capture_auth(
        &self,
        auth_id: &str,
        amount: i64,
        currency: &str,
    ) -> Result<CaptureOutcome, LedgerError>;

    async fn reverse_auth(&self, auth_id: &str) -> Result<Authorization, LedgerError>;

    /// Reverse up to `batch_size` expired holds, oldest first. Returns how
    /// many were released.
    async fn release_expired_holds(&self, batch_size: u32) -> Result<u64, LedgerError>;

    async fn list_transactions(&self, account_id: &str) -> Result<Vec<Transaction>, LedgerError>;

    async fn ping(&self) -> Result<(), LedgerError>;
}
