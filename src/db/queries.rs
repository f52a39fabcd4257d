use sqlx::SqliteExecutor;

use crate::db::models::{Account, Authorization, Card, Transaction};

const CARD_COLUMNS: &str = "card_id, account_id, bin, last4, expiry_yymm, status, pan_hash, \
                            pan_token, created_at, updated_at";

const AUTH_COLUMNS: &str = "auth_id, account_id, card_id, amount, currency, status, \
                            approval_code, authorization_code, stan, merchant_name, mcc, \
                            hold_expires_at, created_at";

pub async fn get_account<'e, E: SqliteExecutor<'e>>(
    executor: E,
    account_id: &str,
) -> Result<Option<Account>, sqlx::Error> {
    sqlx::query_as::<_, Account>(
        "SELECT account_id, core_account_id, currency, available_balance, hold_balance,
                created_at, updated_at
           FROM accounts WHERE account_id = ?",
    )
    .bind(account_id)
    .fetch_optional(executor)
    .await
}

pub async fn get_card<'e, E: SqliteExecutor<'e>>(
    executor: E,
    card_id: &str,
) -> Result<Option<Card>, sqlx::Error> {
    sqlx::query_as::<_, Card>(&format!("SELECT {CARD_COLUMNS} FROM cards WHERE card_id = ?"))
        .bind(card_id)
        .fetch_optional(executor)
        .await
}

pub async fn get_card_by_hash<'e, E: SqliteExecutor<'e>>(
    executor: E,
    pan_hash: &str,
    expiry_yymm: &str,
) -> Result<Option<Card>, sqlx::Error> {
    sqlx::query_as::<_, Card>(&format!(
        "SELECT {CARD_COLUMNS} FROM cards WHERE pan_hash = ? AND expiry_yymm = ?"
    ))
    .bind(pan_hash)
    .bind(expiry_yymm)
    .fetch_optional(executor)
    .await
}

pub async fn pan_hash_exists<'e, E: SqliteExecutor<'e>>(
    executor: E,
    pan_hash: &str,
) -> Result<bool, sqlx::Error> {
    let row: (i64,) = sqlx::query_as("SELECT EXISTS (SELECT 1 FROM cards WHERE pan_hash = ?)")
        .bind(pan_hash)
        .fetch_one(executor)
        .await?;

    Ok(row.0 != 0)
}

pub async fn list_cards<'e, E: SqliteExecutor<'e>>(
    executor: E,
    account_id: &str,
) -> Result<Vec<Card>, sqlx::Error> {
    sqlx::query_as::<_, Card>(&format!(
        "SELECT {CARD_COLUMNS} FROM cards WHERE account_id = ? ORDER BY created_at, rowid"
    ))
    .bind(account_id)
    .fetch_all(executor)
    .await
}

pub async fn get_auth<'e, E: SqliteExecutor<'e>>(
    executor: E,
    auth_id: &str,
) -> Result<Option<Authorization>, sqlx::Error> {
    sqlx::query_as::<_, Authorization>(&format!(
        "SELECT {AUTH_COLUMNS} FROM auths WHERE auth_id = ?"
    ))
    .bind(auth_id)
    .fetch_optional(executor)
    .await
}

pub async fn get_auth_by_card_stan<'e, E: SqliteExecutor<'e>>(
    executor: E,
    card_id: &str,
    stan: i64,
) -> Result<Option<Authorization>, sqlx::Error> {
    sqlx::query_as::<_, Authorization>(&format!(
        "SELECT {AUTH_COLUMNS} FROM auths WHERE card_id = ? AND stan = ?"
    ))
    .bind(card_id)
    .bind(stan)
    .fetch_optional(executor)
    .await
}

/// Newest first.
pub async fn list_transactions<'e, E: SqliteExecutor<'e>>(
    executor: E,
    account_id: &str,
) -> Result<Vec<Transaction>, sqlx::Error> {
    sqlx::query_as::<_, Transaction>(
        "SELECT tx_id, account_id, card_id, auth_id, amount, currency, status, posted_at, created_at
           FROM transactions
          WHERE account_id = ?
          ORDER BY created_at DESC, rowid DESC",
    )
    .bind(account_id)
    .fetch_all(executor)
    .await
}

/// Total captured so far against one authorization.
pub async fn captured_total<'e, E: SqliteExecutor<'e>>(
    executor: E,
    auth_id: &str,
) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COALESCE(SUM(amount), 0) FROM transactions
          WHERE auth_id = ? AND status = 'CAPTURED'",
    )
    .bind(auth_id)
    .fetch_one(executor)
    .await?;

    Ok(row.0)
}
