use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use sqlx::SqlitePool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    CaptureOutcome, HoldOutcome, HoldRequest, LedgerError, LedgerRepository, NewAccount, NewCard,
};
use crate::cardgen::{last_n, normalize_pan};
use crate::crypto::PanHasher;
use crate::db::models::{Account, AuthStatus, Authorization, Card, CardStatus, Transaction};
use crate::db::{self, queries};

/// Upper bound for a single ledger transaction.
pub const OP_TIMEOUT: Duration = Duration::from_secs(3);
pub const SWEEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Columns of `auths`, for `RETURNING` clauses.
const AUTH_RETURNING: &str = "auth_id, account_id, card_id, amount, currency, status, \
                              approval_code, authorization_code, stan, merchant_name, mcc, \
                              hold_expires_at, created_at";

const CARD_RETURNING: &str = "card_id, account_id, bin, last4, expiry_yymm, status, pan_hash, \
                              pan_token, created_at, updated_at";

async fn within<T, F>(limit: Duration, op: F) -> Result<T, LedgerError>
where
    F: Future<Output = Result<T, LedgerError>>,
{
    match tokio::time::timeout(limit, op).await {
        Ok(result) => result,
        Err(_) => {
            warn!(?limit, "ledger operation timed out, rolled back");
            Err(LedgerError::Timeout)
        }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_foreign_key_violation())
}

/// SQLite-backed ledger.
///
/// SQLite has no row locks, so each transaction opens with a write statement.
/// That takes the database write lock before anything is read, which gives
/// the same exclusion `SELECT ... FOR UPDATE` would.
pub struct SqliteLedger {
    pool: SqlitePool,
    hasher: PanHasher,
}

impl SqliteLedger {
    pub fn new(pool: SqlitePool, hasher: PanHasher) -> Self {
        Self { pool, hasher }
    }

    async fn insert_account(&self, account: NewAccount) -> Result<Account, LedgerError> {
        if account.available_balance < 0 {
            return Err(LedgerError::InvalidAmount(account.available_balance));
        }
        let account_id = Uuid::new_v4().to_string();
        let core_account_id = account.core_account_id.unwrap_or_else(|| account_id.clone());

        let created = sqlx::query_as::<_, Account>(
            "INSERT INTO accounts (account_id, core_account_id, currency, available_balance, hold_balance)
             VALUES (?, ?, ?, ?, 0)
             RETURNING account_id, core_account_id, currency, available_balance, hold_balance,
                       created_at, updated_at",
        )
        .bind(&account_id)
        .bind(&core_account_id)
        .bind(account.currency.to_uppercase())
        .bind(account.available_balance)
        .fetch_one(&self.pool)
        .await?;

        info!(account_id = %created.account_id, currency = %created.currency, "account created");
        Ok(created)
    }

    async fn insert_card(&self, card: NewCard) -> Result<Card, LedgerError> {
        let pan = normalize_pan(&card.pan);
        let pan_hash = self.hasher.hash(&pan);

        let result = sqlx::query_as::<_, Card>(&format!(
            "INSERT INTO cards (card_id, account_id, bin, last4, expiry_yymm, status, pan_hash, pan_token)
             VALUES (?, ?, ?, ?, ?, 'ISSUED', ?, ?)
             RETURNING {CARD_RETURNING}"
        ))
        .bind(&card.card_id)
        .bind(&card.account_id)
        .bind(&card.bin)
        .bind(last_n(&pan, 4))
        .bind(&card.expiry_yymm)
        .bind(&pan_hash)
        .bind(&card.pan_token)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(created) => {
                info!(card_id = %created.card_id, account_id = %created.account_id, last4 = %created.last4, "card created");
                Ok(created)
            }
            Err(e) if is_unique_violation(&e) => Err(LedgerError::Conflict("card")),
            Err(e) if is_foreign_key_violation(&e) => Err(LedgerError::NotFound("account")),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_card_status(&self, card_id: &str, status: CardStatus) -> Result<Card, LedgerError> {
        // Closed cards only accept CLOSED again.
        let updated = sqlx::query_as::<_, Card>(&format!(
            "UPDATE cards SET status = ?1, updated_at = ?2
              WHERE card_id = ?3 AND (status <> 'CLOSED' OR ?1 = 'CLOSED')
             RETURNING {CARD_RETURNING}"
        ))
        .bind(status.as_str())
        .bind(db::now())
        .bind(card_id)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(card) => {
                info!(card_id, status = %card.status, "card status changed");
                Ok(card)
            }
            None => match queries::get_card(&self.pool, card_id).await? {
                Some(_) => Err(LedgerError::CardClosed),
                None => Err(LedgerError::NotFound("card")),
            },
        }
    }

    async fn hold(&self, req: HoldRequest) -> Result<HoldOutcome, LedgerError> {
        if req.amount <= 0 {
            return Err(LedgerError::InvalidAmount(req.amount));
        }
        let currency = req.currency.to_uppercase();
        let auth_id = Uuid::new_v4().to_string();
        let hold_expires_at = req.hold_expires_at.map(db::timestamp);

        let mut tx = self.pool.begin().await?;

        if let Some(stan) = req.stan {
            // Insert first: the partial unique index decides which request owns the STAN.
            let inserted: Option<(String,)> = sqlx::query_as(
                "INSERT INTO auths (auth_id, account_id, card_id, amount, currency, status,
                                    approval_code, authorization_code, stan, merchant_name, mcc,
                                    hold_expires_at)
                 VALUES (?, ?, ?, ?, ?, 'AUTHORIZED', ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (card_id, stan) WHERE stan IS NOT NULL DO NOTHING
                 RETURNING auth_id",
            )
            .bind(&auth_id)
            .bind(&req.account_id)
            .bind(&req.card_id)
            .bind(req.amount)
            .bind(&currency)
            .bind(&req.approval_code)
            .bind(&req.authorization_code)
            .bind(stan)
            .bind(&req.merchant_name)
            .bind(&req.mcc)
            .bind(&hold_expires_at)
            .fetch_optional(&mut *tx)
            .await?;

            if inserted.is_none() {
                let existing = queries::get_auth_by_card_stan(&mut *tx, &req.card_id, stan)
                    .await?
                    .ok_or(LedgerError::NotFound("authorization"))?;

                if existing.amount != req.amount || !existing.currency.eq_ignore_ascii_case(&currency)
                {
                    warn!(card_id = %req.card_id, stan, "stan replayed with different parameters");
                    return Err(LedgerError::IdempotencyMismatch { stan });
                }

                tx.commit().await?;
                debug!(auth_id = %existing.auth_id, stan, "authorization replayed");
                return Ok(HoldOutcome {
                    auth_id: existing.auth_id,
                    approval_code: existing.approval_code,
                    authorization_code: existing.authorization_code,
                    duplicate: true,
                });
            }
        }

        let moved = sqlx::query(
            "UPDATE accounts
                SET available_balance = available_balance - ?1,
                    hold_balance      = hold_balance + ?1,
                    updated_at        = ?2
              WHERE account_id = ?3 AND currency = ?4 AND available_balance >= ?1",
        )
        .bind(req.amount)
        .bind(db::now())
        .bind(&req.account_id)
        .bind(&currency)
        .execute(&mut *tx)
        .await?;

        if moved.rows_affected() == 0 {
            let account = queries::get_account(&mut *tx, &req.account_id)
                .await?
                .ok_or(LedgerError::NotFound("account"))?;
            if account.currency != currency {
                return Err(LedgerError::CurrencyMismatch {
                    expected: account.currency,
                    got: currency,
                });
            }
            debug!(account_id = %req.account_id, amount = req.amount, "insufficient funds");
            return Err(LedgerError::InsufficientFunds);
        }

        if req.stan.is_none() {
            sqlx::query(
                "INSERT INTO auths (auth_id, account_id, card_id, amount, currency, status,
                                    approval_code, authorization_code, merchant_name, mcc,
                                    hold_expires_at)
                 VALUES (?, ?, ?, ?, ?, 'AUTHORIZED', ?, ?, ?, ?, ?)",
            )
            .bind(&auth_id)
            .bind(&req.account_id)
            .bind(&req.card_id)
            .bind(req.amount)
            .bind(&currency)
            .bind(&req.approval_code)
            .bind(&req.authorization_code)
            .bind(&req.merchant_name)
            .bind(&req.mcc)
            .bind(&hold_expires_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        info!(auth_id = %auth_id, account_id = %req.account_id, amount = req.amount, stan = ?req.stan, "hold placed");
        Ok(HoldOutcome {
            auth_id,
            approval_code: req.approval_code,
            authorization_code: req.authorization_code,
            duplicate: false,
        })
    }

    async fn capture(
        &self,
        auth_id: &str,
        amount: i64,
        currency: &str,
    ) -> Result<CaptureOutcome, LedgerError> {
        let mut tx = self.pool.begin().await?;

        // No-op write claims the row before it is inspected.
        let auth = sqlx::query_as::<_, Authorization>(&format!(
            "UPDATE auths SET status = status WHERE auth_id = ? RETURNING {AUTH_RETURNING}"
        ))
        .bind(auth_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(LedgerError::NotFound("authorization"))?;

        if auth.status != AuthStatus::Authorized {
            return Err(LedgerError::InvalidState(auth.status));
        }
        if !currency.is_empty() && !auth.currency.eq_ignore_ascii_case(currency) {
            return Err(LedgerError::CurrencyMismatch {
                expected: auth.currency,
                got: currency.to_uppercase(),
            });
        }
        let held = auth.amount - queries::captured_total(&mut *tx, &auth.auth_id).await?;
        let amount = if amount <= 0 { held } else { amount };
        if amount > held {
            return Err(LedgerError::InvalidAmount(amount));
        }

        let now = db::now();
        sqlx::query(
            "UPDATE accounts SET hold_balance = hold_balance - ?, updated_at = ? WHERE account_id = ?",
        )
        .bind(amount)
        .bind(&now)
        .bind(&auth.account_id)
        .execute(&mut *tx)
        .await?;

        let tx_id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO transactions (tx_id, account_id, card_id, auth_id, amount, currency, status, posted_at)
             VALUES (?, ?, ?, ?, ?, ?, 'CAPTURED', ?)",
        )
        .bind(&tx_id)
        .bind(&auth.account_id)
        .bind(&auth.card_id)
        .bind(&auth.auth_id)
        .bind(amount)
        .bind(&auth.currency)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        // The authorized amount never changes; a partial capture leaves the
        // authorization open and its captures record what is no longer held.
        let remaining = held - amount;
        let status = if remaining == 0 {
            sqlx::query("UPDATE auths SET status = 'CAPTURED' WHERE auth_id = ?")
                .bind(&auth.auth_id)
                .execute(&mut *tx)
                .await?;
            AuthStatus::Captured
        } else {
            AuthStatus::Authorized
        };

        tx.commit().await?;

        info!(auth_id, tx_id = %tx_id, captured = amount, remaining, "authorization captured");
        Ok(CaptureOutcome {
            auth_id: auth.auth_id,
            tx_id,
            captured: amount,
            remaining,
            status,
        })
    }

    async fn reverse(&self, auth_id: &str) -> Result<Authorization, LedgerError> {
        let mut tx = self.pool.begin().await?;

        let mut auth = sqlx::query_as::<_, Authorization>(&format!(
            "UPDATE auths SET status = status WHERE auth_id = ? RETURNING {AUTH_RETURNING}"
        ))
        .bind(auth_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(LedgerError::NotFound("authorization"))?;

        if auth.status != AuthStatus::Authorized {
            return Err(LedgerError::InvalidState(auth.status));
        }
        let held = auth.amount - queries::captured_total(&mut *tx, &auth.auth_id).await?;

        sqlx::query(
            "UPDATE accounts
                SET hold_balance      = hold_balance - ?1,
                    available_balance = available_balance + ?1,
                    updated_at        = ?2
              WHERE account_id = ?3",
        )
        .bind(held)
        .bind(db::now())
        .bind(&auth.account_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE auths SET status = 'REVERSED' WHERE auth_id = ?")
            .bind(&auth.auth_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        auth.status = AuthStatus::Reversed;
        info!(auth_id, released = held, "authorization reversed");
        Ok(auth)
    }

    async fn sweep(&self, batch_size: u32) -> Result<u64, LedgerError> {
        let mut tx = self.pool.begin().await?;

        // Claiming and flipping in one statement means a concurrent sweeper
        // only ever sees rows this one has not taken.
        let released: Vec<(String, String, i64)> = sqlx::query_as(
            "UPDATE auths SET status = 'REVERSED'
              WHERE auth_id IN (
                    SELECT auth_id FROM auths
                     WHERE status = 'AUTHORIZED'
                       AND hold_expires_at IS NOT NULL
                       AND hold_expires_at <= ?
                     ORDER BY hold_expires_at, rowid
                     LIMIT ?)
             RETURNING auth_id, account_id, amount",
        )
        .bind(db::now())
        .bind(i64::from(batch_size))
        .fetch_all(&mut *tx)
        .await?;

        if released.is_empty() {
            tx.commit().await?;
            return Ok(0);
        }

        // Partially captured holds only give back what is still held.
        let mut per_account: BTreeMap<String, i64> = BTreeMap::new();
        for (auth_id, account_id, amount) in &released {
            let held = amount - queries::captured_total(&mut *tx, auth_id).await?;
            *per_account.entry(account_id.clone()).or_default() += held;
        }

        let now = db::now();
        for (account_id, total) in &per_account {
            sqlx::query(
                "UPDATE accounts
                    SET hold_balance      = hold_balance - ?1,
                        available_balance = available_balance + ?1,
                        updated_at        = ?2
                  WHERE account_id = ?3",
            )
            .bind(total)
            .bind(&now)
            .bind(account_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        let count = released.len() as u64;
        info!(count, accounts = per_account.len(), "expired holds released");
        Ok(count)
    }
}

#[async_trait::async_trait]
impl LedgerRepository for SqliteLedger {
    async fn create_account(&self, account: NewAccount) -> Result<Account, LedgerError> {
        within(OP_TIMEOUT, self.insert_account(account)).await
    }

    async fn get_account(&self, account_id: &str) -> Result<Account, LedgerError> {
        within(OP_TIMEOUT, async {
            queries::get_account(&self.pool, account_id)
                .await
                .map_err(LedgerError::from)
                .and_then(|account| account.ok_or(LedgerError::NotFound("account")))
        })
        .await
    }

    async fn create_card(&self, card: NewCard) -> Result<Card, LedgerError> {
        within(OP_TIMEOUT, self.insert_card(card)).await
    }

    async fn pan_exists(&self, pan: &str) -> Result<bool, LedgerError> {
        let pan_hash = self.hasher.hash(pan);
        within(OP_TIMEOUT, async {
            queries::pan_hash_exists(&self.pool, &pan_hash).await.map_err(LedgerError::from)
        })
        .await
    }

    async fn find_card_for_authorization(
        &self,
        pan: &str,
        expiry_yymm: &str,
    ) -> Result<Option<Card>, LedgerError> {
        let pan_hash = self.hasher.hash(pan);
        within(OP_TIMEOUT, async {
            queries::get_card_by_hash(&self.pool, &pan_hash, expiry_yymm)
                .await
                .map_err(LedgerError::from)
        })
        .await
    }

    async fn update_card_status(
        &self,
        card_id: &str,
        status: CardStatus,
    ) -> Result<Card, LedgerError> {
        within(OP_TIMEOUT, self.set_card_status(card_id, status)).await
    }

    async fn list_cards(&self, account_id: &str) -> Result<Vec<Card>, LedgerError> {
        within(OP_TIMEOUT, async {
            queries::list_cards(&self.pool, account_id)
                .await
                .map_err(LedgerError::from)
        })
        .await
    }

    async fn create_auth_and_hold(&self, request: HoldRequest) -> Result<HoldOutcome, LedgerError> {
        within(OP_TIMEOUT, self.hold(request)).await
    }

    async fn get_auth(&self, auth_id: &str) -> Result<Option<Authorization>, LedgerError> {
        within(OP_TIMEOUT, async {
            queries::get_auth(&self.pool, auth_id)
                .await
                .map_err(LedgerError::from)
        })
        .await
    }

    async fn find_auth_by_card_stan(
        &self,
        card_id: &str,
        stan: i64,
    ) -> Result<Option<Authorization>, LedgerError> {
        within(OP_TIMEOUT, async {
            queries::get_auth_by_card_stan(&self.pool, card_id, stan)
                .await
                .map_err(LedgerError::from)
        })
        .await
    }

    async fn capture_auth(
        &self,
        auth_id: &str,
        amount: i64,
        currency: &str,
    ) -> Result<CaptureOutcome, LedgerError> {
        within(OP_TIMEOUT, self.capture(auth_id, amount, currency)).await
    }

    async fn reverse_auth(&self, auth_id: &str) -> Result<Authorization, LedgerError> {
        within(OP_TIMEOUT, self.reverse(auth_id)).await
    }

    async fn release_expired_holds(&self, batch_size: u32) -> Result<u64, LedgerError> {
        within(SWEEP_TIMEOUT, self.sweep(batch_size)).await
    }

    async fn list_transactions(&self, account_id: &str) -> Result<Vec<Transaction>, LedgerError> {
        within(OP_TIMEOUT, async {
            queries::list_transactions(&self.pool, account_id).await.map_err(LedgerError::from)
        })
        .await
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        within(OP_TIMEOUT, async {
            sqlx::query("SELECT 1")
                .execute(&self.pool)
                .await
                .map(|_| ())
                .map_err(LedgerError::from)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cardgen::generate_pan;
    use crate::crypto::SecretKey;
    use chrono::Duration as ChronoDuration;
    use chrono::Utc;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn ledger() -> (SqliteLedger, TempDir) {
        let (pool, dir) = db::test_pool().await;
        let hasher = PanHasher::new(&SecretKey::from_bytes(b"test-pan-hash-key").unwrap()).unwrap();
        (SqliteLedger::new(pool, hasher), dir)
    }

    async fn seed(ledger: &SqliteLedger, balance: i64) -> (Account, Card, String) {
        let account = ledger
            .create_account(NewAccount {
                currency: "usd".to_string(),
                available_balance: balance,
                core_account_id: None,
            })
            .await
            .unwrap();
        let pan = generate_pan("421234", "").unwrap();
        let card = ledger
            .create_card(NewCard {
                card_id: Uuid::new_v4().to_string(),
                account_id: account.account_id.clone(),
                bin: "421234".to_string(),
                pan: pan.clone(),
                expiry_yymm: "3012".to_string(),
                pan_token: None,
            })
            .await
            .unwrap();
        (account, card, pan)
    }

    fn hold_request(account: &Account, card: &Card, amount: i64, stan: Option<i64>) -> HoldRequest {
        HoldRequest {
            account_id: account.account_id.clone(),
            card_id: card.card_id.clone(),
            amount,
            currency: "USD".to_string(),
            approval_code: "00".to_string(),
            authorization_code: format!("{:06}", amount % 1_000_000),
            merchant_name: Some("Corner Shop".to_string()),
            mcc: Some("5411".to_string()),
            stan,
            hold_expires_at: None,
        }
    }

    async fn balances(ledger: &SqliteLedger, account_id: &str) -> (i64, i64) {
        let account = ledger.get_account(account_id).await.unwrap();
        (account.available_balance, account.hold_balance)
    }

    async fn auth_count(ledger: &SqliteLedger) -> i64 {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM auths")
            .fetch_one(&ledger.pool)
            .await
            .unwrap();
        n
    }

    #[tokio::test]
    async fn test_create_and_get_account() {
        let (ledger, _dir) = ledger().await;
        let (account, _, _) = seed(&ledger, 10_000).await;

        assert_eq!(account.currency, "USD");
        assert_eq!(account.core_account_id.as_deref(), Some(account.account_id.as_str()));
        assert_eq!(balances(&ledger, &account.account_id).await, (10_000, 0));

        assert!(matches!(
            ledger.get_account("missing").await,
            Err(LedgerError::NotFound("account"))
        ));
        assert!(matches!(
            ledger
                .create_account(NewAccount {
                    currency: "USD".into(),
                    available_balance: -1,
                    core_account_id: None,
                })
                .await,
            Err(LedgerError::InvalidAmount(-1))
        ));
    }

    #[tokio::test]
    async fn test_card_is_stored_by_hash_only() {
        let (ledger, _dir) = ledger().await;
        let (account, card, pan) = seed(&ledger, 0).await;

        assert_eq!(card.status, CardStatus::Issued);
        assert_eq!(card.last4, &pan[12..]);
        assert_eq!(card.pan_hash, ledger.hasher.hash(&pan));
        assert!(!card.pan_hash.contains(&pan));

        assert!(ledger.pan_exists(&pan).await.unwrap());
        let found = ledger
            .find_card_for_authorization(&pan, "3012")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.card_id, card.card_id);
        assert!(ledger.find_card_for_authorization(&pan, "3011").await.unwrap().is_none());

        let cards = ledger.list_cards(&account.account_id).await.unwrap();
        assert_eq!(cards.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_pan_is_a_conflict() {
        let (ledger, _dir) = ledger().await;
        let (account, _, pan) = seed(&ledger, 0).await;

        let again = ledger
            .create_card(NewCard {
                card_id: Uuid::new_v4().to_string(),
                account_id: account.account_id.clone(),
                bin: "421234".into(),
                pan: pan.clone(),
                expiry_yymm: "3101".into(),
                pan_token: None,
            })
            .await;
        assert!(matches!(again, Err(LedgerError::Conflict("card"))));

        let orphan = ledger
            .create_card(NewCard {
                card_id: Uuid::new_v4().to_string(),
                account_id: "missing".into(),
                bin: "421234".into(),
                pan: generate_pan("421234", "").unwrap(),
                expiry_yymm: "3101".into(),
                pan_token: None,
            })
            .await;
        assert!(matches!(orphan, Err(LedgerError::NotFound("account"))));
    }

    #[tokio::test]
    async fn test_card_status_changes_and_closed_is_final() {
        let (ledger, _dir) = ledger().await;
        let (_, card, _) = seed(&ledger, 0).await;

        let frozen = ledger
            .update_card_status(&card.card_id, CardStatus::Frozen)
            .await
            .unwrap();
        assert_eq!(frozen.status, CardStatus::Frozen);

        ledger
            .update_card_status(&card.card_id, CardStatus::Closed)
            .await
            .unwrap();
        assert!(matches!(
            ledger.update_card_status(&card.card_id, CardStatus::Active).await,
            Err(LedgerError::CardClosed)
        ));
        assert!(matches!(
            ledger.update_card_status("missing", CardStatus::Active).await,
            Err(LedgerError::NotFound("card"))
        ));
    }

    #[tokio::test]
    async fn test_hold_moves_funds() {
        let (ledger, _dir) = ledger().await;
        let (account, card, _) = seed(&ledger, 1_000).await;

        let outcome = ledger
            .create_auth_and_hold(hold_request(&account, &card, 300, None))
            .await
            .unwrap();
        assert!(!outcome.duplicate);
        assert_eq!(outcome.approval_code, "00");
        assert_eq!(balances(&ledger, &account.account_id).await, (700, 300));

        let auth = ledger.get_auth(&outcome.auth_id).await.unwrap().unwrap();
        assert_eq!(auth.status, AuthStatus::Authorized);
        assert_eq!(auth.amount, 300);
        assert_eq!(auth.stan, None);
    }

    #[tokio::test]
    async fn test_insufficient_funds_persists_nothing() {
        let (ledger, _dir) = ledger().await;
        let (account, card, _) = seed(&ledger, 100).await;

        for stan in [None, Some(7)] {
            let result = ledger
                .create_auth_and_hold(hold_request(&account, &card, 101, stan))
                .await;
            assert!(matches!(result, Err(LedgerError::InsufficientFunds)));
        }
        assert_eq!(balances(&ledger, &account.account_id).await, (100, 0));
        assert_eq!(auth_count(&ledger).await, 0);

        // The rolled-back STAN is free for a later, fundable request.
        let outcome = ledger
            .create_auth_and_hold(hold_request(&account, &card, 100, Some(7)))
            .await
            .unwrap();
        assert!(!outcome.duplicate);
    }

    #[tokio::test]
    async fn test_hold_rejects_other_currency_and_bad_amount() {
        let (ledger, _dir) = ledger().await;
        let (account, card, _) = seed(&ledger, 1_000).await;

        let mut req = hold_request(&account, &card, 10, None);
        req.currency = "EUR".into();
        assert!(matches!(
            ledger.create_auth_and_hold(req).await,
            Err(LedgerError::CurrencyMismatch { .. })
        ));
        assert!(matches!(
            ledger
                .create_auth_and_hold(hold_request(&account, &card, 0, None))
                .await,
            Err(LedgerError::InvalidAmount(0))
        ));
        assert_eq!(balances(&ledger, &account.account_id).await, (1_000, 0));
    }

    #[tokio::test]
    async fn test_stan_replay_is_idempotent() {
        let (ledger, _dir) = ledger().await;
        let (account, card, _) = seed(&ledger, 1_000).await;

        let first = ledger
            .create_auth_and_hold(hold_request(&account, &card, 250, Some(42)))
            .await
            .unwrap();

        let mut replay = hold_request(&account, &card, 250, Some(42));
        replay.authorization_code = "999999".into();
        let second = ledger.create_auth_and_hold(replay).await.unwrap();

        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(second.auth_id, first.auth_id);
        assert_eq!(second.approval_code, first.approval_code);
        assert_eq!(second.authorization_code, first.authorization_code);
        assert_eq!(balances(&ledger, &account.account_id).await, (750, 250));

        let conflict = ledger
            .create_auth_and_hold(hold_request(&account, &card, 251, Some(42)))
            .await;
        assert!(matches!(
            conflict,
            Err(LedgerError::IdempotencyMismatch { stan: 42 })
        ));
        assert_eq!(balances(&ledger, &account.account_id).await, (750, 250));
        assert_eq!(auth_count(&ledger).await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_holds_never_overdraw() {
        let (ledger, _dir) = ledger().await;
        let (account, card, _) = seed(&ledger, 1_000).await;
        let ledger = Arc::new(ledger);

        let mut handles = Vec::new();
        for _ in 0..25 {
            let ledger = ledger.clone();
            let req = hold_request(&account, &card, 100, None);
            handles.push(tokio::spawn(async move { ledger.create_auth_and_hold(req).await }));
        }

        let mut approved = 0;
        let mut declined = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => approved += 1,
                Err(LedgerError::InsufficientFunds) => declined += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(approved, 10);
        assert_eq!(declined, 15);
        assert_eq!(balances(&ledger, &account.account_id).await, (0, 1_000));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicate_stan_holds_once() {
        let (ledger, _dir) = ledger().await;
        let (account, card, _) = seed(&ledger, 1_000).await;
        let ledger = Arc::new(ledger);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let ledger = ledger.clone();
            let req = hold_request(&account, &card, 100, Some(77));
            handles.push(tokio::spawn(async move { ledger.create_auth_and_hold(req).await }));
        }

        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(outcomes.iter().filter(|o| !o.duplicate).count(), 1);
        assert!(outcomes.iter().all(|o| o.auth_id == outcomes[0].auth_id));
        assert_eq!(balances(&ledger, &account.account_id).await, (900, 100));
    }

    #[tokio::test]
    async fn test_full_capture() {
        let (ledger, _dir) = ledger().await;
        let (account, card, _) = seed(&ledger, 1_000).await;
        let hold = ledger
            .create_auth_and_hold(hold_request(&account, &card, 400, Some(1)))
            .await
            .unwrap();

        let captured = ledger.capture_auth(&hold.auth_id, 0, "usd").await.unwrap();
        assert_eq!(captured.captured, 400);
        assert_eq!(captured.remaining, 0);
        assert_eq!(captured.status, AuthStatus::Captured);
        assert_eq!(balances(&ledger, &account.account_id).await, (600, 0));

        let txs = ledger.list_transactions(&account.account_id).await.unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].amount, 400);
        assert_eq!(txs[0].status, "CAPTURED");
        assert_eq!(txs[0].auth_id.as_deref(), Some(hold.auth_id.as_str()));
        assert!(txs[0].posted_at.is_some());

        assert!(matches!(
            ledger.capture_auth(&hold.auth_id, 0, "USD").await,
            Err(LedgerError::InvalidState(AuthStatus::Captured))
        ));
    }

    #[tokio::test]
    async fn test_partial_capture_keeps_remainder_on_hold() {
        let (ledger, _dir) = ledger().await;
        let (account, card, _) = seed(&ledger, 1_000).await;
        let hold = ledger
            .create_auth_and_hold(hold_request(&account, &card, 400, None))
            .await
            .unwrap();

        let partial = ledger.capture_auth(&hold.auth_id, 150, "USD").await.unwrap();
        assert_eq!(partial.status, AuthStatus::Authorized);
        assert_eq!(partial.remaining, 250);
        assert_eq!(balances(&ledger, &account.account_id).await, (600, 250));

        let auth = ledger.get_auth(&hold.auth_id).await.unwrap().unwrap();
        assert_eq!(auth.status, AuthStatus::Authorized);
        assert_eq!(auth.amount, 400);

        assert!(matches!(
            ledger.capture_auth(&hold.auth_id, 251, "USD").await,
            Err(LedgerError::InvalidAmount(251))
        ));

        let rest = ledger.capture_auth(&hold.auth_id, 0, "").await.unwrap();
        assert_eq!(rest.captured, 250);
        assert_eq!(rest.status, AuthStatus::Captured);
        assert_eq!(balances(&ledger, &account.account_id).await, (600, 0));
        assert_eq!(ledger.list_transactions(&account.account_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stan_replay_after_partial_capture() {
        let (ledger, _dir) = ledger().await;
        let (account, card, _) = seed(&ledger, 1_000).await;
        let first = ledger
            .create_auth_and_hold(hold_request(&account, &card, 400, Some(42)))
            .await
            .unwrap();
        ledger.capture_auth(&first.auth_id, 150, "USD").await.unwrap();
        assert_eq!(balances(&ledger, &account.account_id).await, (600, 250));

        let replay = ledger
            .create_auth_and_hold(hold_request(&account, &card, 400, Some(42)))
            .await
            .unwrap();
        assert!(replay.duplicate);
        assert_eq!(replay.auth_id, first.auth_id);
        assert_eq!(balances(&ledger, &account.account_id).await, (600, 250));

        assert!(matches!(
            ledger
                .create_auth_and_hold(hold_request(&account, &card, 250, Some(42)))
                .await,
            Err(LedgerError::IdempotencyMismatch { stan: 42 })
        ));
    }

    #[tokio::test]
    async fn test_reverse_after_partial_capture_releases_remainder() {
        let (ledger, _dir) = ledger().await;
        let (account, card, _) = seed(&ledger, 1_000).await;
        let hold = ledger
            .create_auth_and_hold(hold_request(&account, &card, 400, None))
            .await
            .unwrap();
        ledger.capture_auth(&hold.auth_id, 150, "USD").await.unwrap();

        let reversed = ledger.reverse_auth(&hold.auth_id).await.unwrap();
        assert_eq!(reversed.status, AuthStatus::Reversed);
        assert_eq!(reversed.amount, 400);
        assert_eq!(balances(&ledger, &account.account_id).await, (850, 0));
    }

    #[tokio::test]
    async fn test_sweep_after_partial_capture_releases_remainder() {
        let (ledger, _dir) = ledger().await;
        let (account, card, _) = seed(&ledger, 1_000).await;
        let mut req = hold_request(&account, &card, 400, None);
        req.hold_expires_at = Some(Utc::now() - ChronoDuration::minutes(1));
        let hold = ledger.create_auth_and_hold(req).await.unwrap();
        ledger.capture_auth(&hold.auth_id, 100, "USD").await.unwrap();

        assert_eq!(ledger.release_expired_holds(500).await.unwrap(), 1);
        assert_eq!(balances(&ledger, &account.account_id).await, (900, 0));
    }

    #[tokio::test]
    async fn test_capture_validation() {
        let (ledger, _dir) = ledger().await;
        let (account, card, _) = seed(&ledger, 1_000).await;
        let hold = ledger
            .create_auth_and_hold(hold_request(&account, &card, 100, None))
            .await
            .unwrap();

        assert!(matches!(
            ledger.capture_auth(&hold.auth_id, 101, "USD").await,
            Err(LedgerError::InvalidAmount(101))
        ));
        assert!(matches!(
            ledger.capture_auth(&hold.auth_id, 50, "EUR").await,
            Err(LedgerError::CurrencyMismatch { .. })
        ));
        assert!(matches!(
            ledger.capture_auth("missing", 0, "USD").await,
            Err(LedgerError::NotFound("authorization"))
        ));
        assert_eq!(balances(&ledger, &account.account_id).await, (900, 100));
        assert!(ledger.list_transactions(&account.account_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reversal_restores_funds() {
        let (ledger, _dir) = ledger().await;
        let (account, card, _) = seed(&ledger, 1_000).await;
        let hold = ledger
            .create_auth_and_hold(hold_request(&account, &card, 300, None))
            .await
            .unwrap();

        let reversed = ledger.reverse_auth(&hold.auth_id).await.unwrap();
        assert_eq!(reversed.status, AuthStatus::Reversed);
        assert_eq!(balances(&ledger, &account.account_id).await, (1_000, 0));

        assert!(matches!(
            ledger.reverse_auth(&hold.auth_id).await,
            Err(LedgerError::InvalidState(AuthStatus::Reversed))
        ));
        assert!(matches!(
            ledger.capture_auth(&hold.auth_id, 0, "USD").await,
            Err(LedgerError::InvalidState(AuthStatus::Reversed))
        ));
    }

    #[tokio::test]
    async fn test_sweep_releases_expired_holds_oldest_first() {
        let (ledger, _dir) = ledger().await;
        let (account, card, _) = seed(&ledger, 1_000).await;
        let (other, other_card, _) = seed(&ledger, 500).await;
        let now = Utc::now();

        let mut oldest = hold_request(&account, &card, 100, None);
        oldest.hold_expires_at = Some(now - ChronoDuration::hours(2));
        let mut older = hold_request(&other, &other_card, 50, None);
        older.hold_expires_at = Some(now - ChronoDuration::hours(1));
        let mut live = hold_request(&account, &card, 200, None);
        live.hold_expires_at = Some(now + ChronoDuration::hours(1));
        let open_ended = hold_request(&account, &card, 10, None);

        let oldest = ledger.create_auth_and_hold(oldest).await.unwrap();
        let older = ledger.create_auth_and_hold(older).await.unwrap();
        let live = ledger.create_auth_and_hold(live).await.unwrap();
        ledger.create_auth_and_hold(open_ended).await.unwrap();

        assert_eq!(ledger.release_expired_holds(1).await.unwrap(), 1);
        let status = |id: String| {
            let ledger = &ledger;
            async move { ledger.get_auth(&id).await.unwrap().unwrap().status }
        };
        assert_eq!(status(oldest.auth_id.clone()).await, AuthStatus::Reversed);
        assert_eq!(status(older.auth_id.clone()).await, AuthStatus::Authorized);

        assert_eq!(ledger.release_expired_holds(500).await.unwrap(), 1);
        assert_eq!(status(older.auth_id).await, AuthStatus::Reversed);
        assert_eq!(status(live.auth_id).await, AuthStatus::Authorized);
        assert_eq!(ledger.release_expired_holds(500).await.unwrap(), 0);

        assert_eq!(balances(&ledger, &account.account_id).await, (790, 210));
        assert_eq!(balances(&ledger, &other.account_id).await, (500, 0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sweepers_do_not_double_release() {
        let (ledger, _dir) = ledger().await;
        let (account, card, _) = seed(&ledger, 10_000).await;
        let past = Utc::now() - ChronoDuration::minutes(5);
        for _ in 0..40 {
            let mut req = hold_request(&account, &card, 10, None);
            req.hold_expires_at = Some(past);
            ledger.create_auth_and_hold(req).await.unwrap();
        }
        let ledger = Arc::new(ledger);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                let mut total = 0;
                loop {
                    let n = ledger.release_expired_holds(7).await.unwrap();
                    if n == 0 {
                        break total;
                    }
                    total += n;
                }
            }));
        }

        let mut released = 0;
        for handle in handles {
            released += handle.await.unwrap();
        }
        assert_eq!(released, 40);
        assert_eq!(balances(&ledger, &account.account_id).await, (10_000, 0));
    }

    #[tokio::test]
    async fn test_ping() {
        let (ledger, _dir) = ledger().await;
        ledger.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_slow_operation_times_out() {
        let slow = within(Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        });
        assert!(matches!(slow.await, Err(LedgerError::Timeout)));

        let (ledger, _dir) = ledger().await;
        let (account, _, _) = seed(&ledger, 10).await;
        let fast = within(Duration::from_millis(500), ledger.get_account(&account.account_id));
        assert_eq!(fast.await.unwrap().available_balance, 10);
    }
}
