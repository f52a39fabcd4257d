use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::issuer::IssuerService;

/// Background task releasing expired holds. A failed sweep is logged and the
/// next tick tries again.
pub async fn run_hold_sweeper(issuer: Arc<IssuerService>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        match issuer.release_expired_holds().await {
            Ok(0) => tracing::trace!("no expired holds"),
            Ok(released) => tracing::info!(released, "released expired holds"),
            Err(e) => tracing::error!(error = %e, "hold sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::crypto::{HmacCvvProvider, PanHasher, SecretKey};
    use crate::db;
    use crate::expiry::ExpiryCalculator;
    use crate::issuer::IssuerSettings;
    use crate::issuer::models::{ApprovalCode, AuthorizationRequest, CreateAccount, Merchant};
    use crate::ledger::SqliteLedger;

    #[tokio::test]
    async fn test_sweeper_releases_expired_holds() {
        let (pool, _dir) = db::test_pool().await;
        let hasher = PanHasher::new(&SecretKey::from_bytes(b"test-pan-hash-key").unwrap()).unwrap();
        let issuer = Arc::new(IssuerService::new(
            Arc::new(SqliteLedger::new(pool, hasher)),
            Arc::new(HmacCvvProvider::new(SecretKey::from_bytes(b"sweeper-key").unwrap())),
            ExpiryCalculator::default(),
            IssuerSettings::default(),
        ));

        let account = issuer
            .create_account(CreateAccount {
                balance: 500,
                currency: "USD".to_string(),
            })
            .await
            .unwrap();
        let card = issuer.issue_card(&account.account_id).await.unwrap();
        let resp = issuer
            .authorize(AuthorizationRequest {
                pan: card.pan,
                expiry: card.card_face,
                amount: 125,
                currency: "USD".to_string(),
                merchant: Merchant::default(),
                stan: Some(1),
                hold_expires_at: Some(Utc::now() - chrono::Duration::seconds(1)),
            })
            .await
            .unwrap();
        assert_eq!(resp.approval_code, ApprovalCode::Approved);

        let task = tokio::spawn(run_hold_sweeper(issuer.clone(), Duration::from_millis(20)));
        let mut released = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let account = issuer.get_account(&account.account_id).await.unwrap();
            if account.hold_balance == 0 {
                assert_eq!(account.available_balance, 500);
                released = true;
                break;
            }
        }
        task.abort();
        assert!(released);
    }
}
