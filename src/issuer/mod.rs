//! Card issuance and the authorization workflow.

pub mod models;

use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cardgen::{self, PanError, mask_pan, random_digits};
use crate::crypto::cvv::{self, CvvError, CvvProvider, DEFAULT_DCVV_STEP, DynamicCvv};
use crate::db::models::{Account, AuthStatus, Authorization, Card, CardStatus, Transaction};
use crate::expiry::{self, ExpiryCalculator, ExpiryError};
use crate::ledger::{CaptureOutcome, HoldRequest, LedgerError, LedgerRepository, NewAccount, NewCard};
use crate::retry::{RetryError, retry_bounded};

use models::{
    ApprovalCode, AuthorizationRequest, AuthorizationResponse, CaptureRequest, CardLookup,
    CardSummary, CreateAccount, IssuedCard, ReverseRequest,
};

pub const DEFAULT_BIN: &str = "421234";
pub const DEFAULT_PRODUCT: &str = "debit";
pub const DEFAULT_SERVICE_CODE: &str = "101";

/// Inserts attempted per issuance before a PAN conflict becomes fatal.
const CARD_INSERT_ATTEMPTS: usize = 5;
const UNIQUE_PAN_RETRIES: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum IssuerError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Pan(#[from] PanError),

    #[error(transparent)]
    Expiry(#[from] ExpiryError),

    #[error(transparent)]
    Cvv(#[from] CvvError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("could not create a unique card after {attempts} attempts")]
    CardConflict { attempts: usize },

    #[error("card not found")]
    CardNotFound,

    #[error("no authorization for stan {0}")]
    AuthNotFound(i64),
}

#[derive(Debug, Clone)]
pub struct IssuerSettings {
    pub bin: String,
    pub card_product: String,
    pub service_code: String,
    pub dcvv_step: Duration,
    pub hold_ttl: Duration,
    pub reissue_window_days: u32,
    pub sweep_batch_size: u32,
}

impl Default for IssuerSettings {
    fn default() -> Self {
        Self {
            bin: DEFAULT_BIN.to_string(),
            card_product: DEFAULT_PRODUCT.to_string(),
            service_code: DEFAULT_SERVICE_CODE.to_string(),
            dcvv_step: DEFAULT_DCVV_STEP,
            hold_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            reissue_window_days: 30,
            sweep_batch_size: 500,
        }
    }
}

/// Accept the wire form (YYMM) or the printed form (MM/YY).
fn resolve_expiry(input: &str) -> Result<String, ExpiryError> {
    let input = input.trim();
    if input.contains('/') {
        return expiry::parse_card_face(input);
    }
    expiry::validate_yymm(input)?;
    Ok(input.to_string())
}

fn validate_currency(currency: &str) -> Result<String, IssuerError> {
    if currency.len() != 3 || !currency.bytes().all(|b| b.is_ascii_alphabetic()) {
        return Err(IssuerError::Validation(format!(
            "currency must be a 3-letter code (got {:?})",
            currency
        )));
    }
    Ok(currency.to_ascii_uppercase())
}

pub struct IssuerService {
    ledger: Arc<dyn LedgerRepository>,
    cvv: Arc<dyn CvvProvider>,
    expiry: ExpiryCalculator,
    settings: IssuerSettings,
}

impl IssuerService {
    pub fn new(
        ledger: Arc<dyn LedgerRepository>,
        cvv: Arc<dyn CvvProvider>,
        expiry: ExpiryCalculator,
        settings: IssuerSettings,
    ) -> Self {
        Self {
            ledger,
            cvv,
            expiry,
            settings,
        }
    }

    pub async fn create_account(&self, req: CreateAccount) -> Result<Account, IssuerError> {
        if req.balance < 0 {
            return Err(IssuerError::Validation("balance must not be negative".into()));
        }
        let currency = validate_currency(&req.currency)?;
        let account = self
            .ledger
            .create_account(NewAccount {
                currency,
                available_balance: req.balance,
                core_account_id: None,
            })
            .await?;
        Ok(account)
    }

    pub async fn get_account(&self, account_id: &str) -> Result<Account, IssuerError> {
        Ok(self.ledger.get_account(account_id).await?)
    }

    pub async fn list_transactions(&self, account_id: &str) -> Result<Vec<Transaction>, IssuerError> {
        self.ledger.get_account(account_id).await?;
        Ok(self.ledger.list_transactions(account_id).await?)
    }

    fn issuing_bin(&self) -> &str {
        match cardgen::validate_bin(&self.settings.bin) {
            Ok(()) => &self.settings.bin,
            Err(e) => {
                warn!(bin = %self.settings.bin, error = %e, "configured BIN is invalid, using default");
                DEFAULT_BIN
            }
        }
    }

    /// Issue a card with a fresh PAN. Conflicting inserts are retried with a
    /// newly generated PAN.
    pub async fn issue_card(&self, account_id: &str) -> Result<IssuedCard, IssuerError> {
        self.ledger.get_account(account_id).await?;

        let now = Utc::now();
        let years = self
            .expiry
            .years_for_product(&self.settings.card_product, 0);
        let expiry_yymm = self.expiry.yymm(&now, years);
        let bin = self.issuing_bin();

        let expiry_ref = expiry_yymm.as_str();
        let attempt = || self.try_create_card(account_id, bin, expiry_ref);

        let created = retry_bounded(CARD_INSERT_ATTEMPTS, attempt, |c: &Option<(Card, String)>| {
            ready(Ok(c.is_some()))
        })
        .await;
        let (card, pan) = match created {
            Ok(Some(created)) => created,
            Ok(None) | Err(RetryError::Exhausted { .. }) => {
                return Err(IssuerError::CardConflict {
                    attempts: CARD_INSERT_ATTEMPTS,
                });
            }
            Err(RetryError::Failed(e)) => return Err(e),
        };

        info!(card_id = %card.card_id, account_id, pan = %mask_pan(&pan), expiry = %expiry_yymm, "card issued");
        Ok(IssuedCard {
            card_id: card.card_id,
            account_id: card.account_id,
            pan,
            cvv: random_digits(3),
            expiry: self.expiry.mmyy(&now, years),
            card_face: self.expiry.card_face(&now, years),
            status: card.status,
        })
    }

    /// One issuance attempt. `Ok(None)` means the PAN lost an insert race.
    async fn try_create_card(
        &self,
        account_id: &str,
        bin: &str,
        expiry_yymm: &str,
    ) -> Result<Option<(Card, String)>, IssuerError> {
        let pan = cardgen::generate_unique_pan(
            bin,
            cardgen::DEFAULT_PAN_LENGTH,
            "",
            UNIQUE_PAN_RETRIES,
            |candidate: &str| {
                let candidate = candidate.to_string();
                async move { self.ledger.pan_exists(&candidate).await }
            },
        )
        .await?;

        let created = self
            .ledger
            .create_card(NewCard {
                card_id: Uuid::new_v4().to_string(),
                account_id: account_id.to_string(),
                bin: bin.to_string(),
                pan: pan.clone(),
                expiry_yymm: expiry_yymm.to_string(),
                pan_token: None,
            })
            .await;

        match created {
            Ok(card) => Ok(Some((card, pan))),
            Err(LedgerError::Conflict(_)) => {
                debug!(pan = %mask_pan(&pan), "PAN taken at insert, regenerating");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list_cards(&self, account_id: &str) -> Result<Vec<CardSummary>, IssuerError> {
        self.ledger.get_account(account_id).await?;
        let now = Utc::now();

        self.ledger
            .list_cards(account_id)
            .await?
            .into_iter()
            .map(|card| -> Result<CardSummary, IssuerError> {
                let yymm = card.expiry_yymm.clone();
                Ok(CardSummary {
                    card_face: format!("{}/{}", &yymm[2..], &yymm[..2]),
                    expired: self.expiry.is_expired(&yymm, &now)?,
                    reissue_due: self.expiry.reissue_due(
                        &yymm,
                        &now,
                        self.settings.reissue_window_days,
                    )?,
                    card,
                })
            })
            .collect()
    }

    pub async fn set_card_status(
        &self,
        card_id: &str,
        status: CardStatus,
    ) -> Result<Card, IssuerError> {
        Ok(self.ledger.update_card_status(card_id, status).await?)
    }

    async fn lookup_card(&self, pan: &str, expiry: &str) -> Result<Card, IssuerError> {
        let yymm = resolve_expiry(expiry)?;
        self.ledger
            .find_card_for_authorization(pan, &yymm)
            .await?
            .ok_or(IssuerError::CardNotFound)
    }

    /// Declines come back as `Ok` with a non-approved code; only
    /// infrastructure failures are errors.
    pub async fn authorize(
        &self,
        req: AuthorizationRequest,
    ) -> Result<AuthorizationResponse, IssuerError> {
        let masked = mask_pan(&req.pan);
        let decline = |code: ApprovalCode, reason: &str| -> Result<AuthorizationResponse, IssuerError> {
            info!(pan = %masked, stan = ?req.stan, code = code.code(), reason, "authorization declined");
            Ok(AuthorizationResponse::declined(code))
        };

        if req.amount <= 0 {
            return decline(ApprovalCode::InvalidAmount, "non-positive amount");
        }
        let Ok(currency) = validate_currency(&req.currency) else {
            return decline(ApprovalCode::DoNotHonor, "malformed currency");
        };
        let pan = cardgen::normalize_pan(&req.pan);
        if cardgen::validate_pan(&pan).is_err() {
            return decline(ApprovalCode::InvalidCard, "malformed PAN");
        }
        let Ok(yymm) = resolve_expiry(&req.expiry) else {
            return decline(ApprovalCode::InvalidCard, "malformed expiry");
        };

        let Some(card) = self.ledger.find_card_for_authorization(&pan, &yymm).await? else {
            return decline(ApprovalCode::InvalidCard, "card not found");
        };
        if let Some(code) = ApprovalCode::for_card_status(card.status) {
            return decline(code, card.status.as_str());
        }
        let now = Utc::now();
        if self.expiry.is_expired(&card.expiry_yymm, &now)? {
            return decline(ApprovalCode::ExpiredCard, "card expired");
        }

        let hold_expires_at = match req.hold_expires_at {
            Some(at) => at,
            None => {
                let ttl = chrono::Duration::from_std(self.settings.hold_ttl)
                    .map_err(|e| IssuerError::Validation(format!("hold ttl: {}", e)))?;
                now + ttl
            }
        };

        let hold = self
            .ledger
            .create_auth_and_hold(HoldRequest {
                account_id: card.account_id.clone(),
                card_id: card.card_id.clone(),
                amount: req.amount,
                currency,
                approval_code: ApprovalCode::Approved.code().to_string(),
                authorization_code: random_digits(6),
                merchant_name: req.merchant.name.clone(),
                mcc: req.merchant.mcc.clone(),
                stan: req.stan,
                hold_expires_at: Some(hold_expires_at),
            })
            .await;

        match hold {
            Ok(outcome) => {
                info!(
                    pan = %masked,
                    card_id = %card.card_id,
                    auth_id = %outcome.auth_id,
                    stan = ?req.stan,
                    duplicate = outcome.duplicate,
                    "authorization approved"
                );
                Ok(AuthorizationResponse {
                    approval_code: ApprovalCode::Approved,
                    authorization_code: Some(outcome.authorization_code),
                    auth_id: Some(outcome.auth_id),
                    duplicate: outcome.duplicate,
                })
            }
            Err(LedgerError::InsufficientFunds) => {
                decline(ApprovalCode::InsufficientFunds, "insufficient funds")
            }
            Err(LedgerError::IdempotencyMismatch { .. }) => {
                decline(ApprovalCode::DuplicateTransmission, "stan reused with different parameters")
            }
            Err(LedgerError::CurrencyMismatch { .. }) => {
                decline(ApprovalCode::DoNotHonor, "currency differs from account")
            }
            Err(LedgerError::InvalidAmount(_)) => {
                decline(ApprovalCode::InvalidAmount, "invalid amount")
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn open_auth_by_stan(
        &self,
        pan: &str,
        expiry: &str,
        stan: i64,
    ) -> Result<Authorization, IssuerError> {
        let card = self.lookup_card(pan, expiry).await?;
        let auth = self
            .ledger
            .find_auth_by_card_stan(&card.card_id, stan)
            .await?
            .ok_or(IssuerError::AuthNotFound(stan))?;
        if auth.status != AuthStatus::Authorized {
            return Err(LedgerError::InvalidState(auth.status).into());
        }
        Ok(auth)
    }

    pub async fn capture_by_stan(&self, req: CaptureRequest) -> Result<CaptureOutcome, IssuerError> {
        let auth = self.open_auth_by_stan(&req.pan, &req.expiry, req.stan).await?;
        Ok(self
            .ledger
            .capture_auth(&auth.auth_id, req.amount, &req.currency)
            .await?)
    }

    pub async fn reverse_by_stan(&self, req: ReverseRequest) -> Result<Authorization, IssuerError> {
        let auth = self.open_auth_by_stan(&req.pan, &req.expiry, req.stan).await?;
        Ok(self.ledger.reverse_auth(&auth.auth_id).await?)
    }

    pub async fn get_auth(&self, auth_id: &str) -> Result<Authorization, IssuerError> {
        self.ledger
            .get_auth(auth_id)
            .await?
            .ok_or(LedgerError::NotFound("authorization").into())
    }

    pub async fn capture_auth(
        &self,
        auth_id: &str,
        amount: i64,
        currency: &str,
    ) -> Result<CaptureOutcome, IssuerError> {
        Ok(self.ledger.capture_auth(auth_id, amount, currency).await?)
    }

    pub async fn reverse_auth(&self, auth_id: &str) -> Result<Authorization, IssuerError> {
        Ok(self.ledger.reverse_auth(auth_id).await?)
    }

    pub async fn release_expired_holds(&self) -> Result<u64, IssuerError> {
        Ok(self
            .ledger
            .release_expired_holds(self.settings.sweep_batch_size)
            .await?)
    }

    /// Static card verification value for a known card.
    pub async fn static_cvv(&self, req: CardLookup) -> Result<String, IssuerError> {
        let card = self.lookup_card(&req.pan, &req.expiry).await?;
        let pan_no_cd = cvv::strip_check_digit(&req.pan)?;
        Ok(self
            .cvv
            .compute_cvv2(&pan_no_cd, &card.expiry_yymm, &self.settings.service_code, 3)?)
    }

    /// Time-windowed code for display, with seconds until it rotates.
    pub async fn display_dynamic_cvv(&self, req: CardLookup) -> Result<DynamicCvv, IssuerError> {
        let card = self.lookup_card(&req.pan, &req.expiry).await?;
        let pan_no_cd = cvv::strip_check_digit(&req.pan)?;
        Ok(self.cvv.compute_display_dcvv(
            &pan_no_cd,
            &card.expiry_yymm,
            &self.settings.service_code,
            self.settings.dcvv_step,
            3,
        )?)
    }

    pub async fn ping(&self) -> Result<(), IssuerError> {
        Ok(self.ledger.ping().await?)
    }
}
