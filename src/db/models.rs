use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} status: {value}")]
pub struct UnknownStatus {
    kind: &'static str,
    value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CardStatus {
    Issued,
    Active,
    Frozen,
    Lost,
    Stolen,
    Closed,
}

impl CardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CardStatus::Issued => "ISSUED",
            CardStatus::Active => "ACTIVE",
            CardStatus::Frozen => "FROZEN",
            CardStatus::Lost => "LOST",
            CardStatus::Stolen => "STOLEN",
            CardStatus::Closed => "CLOSED",
        }
    }

    /// Whether the card may take new authorizations.
    pub fn can_authorize(&self) -> bool {
        matches!(self, CardStatus::Issued | CardStatus::Active)
    }
}

impl FromStr for CardStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ISSUED" => Ok(CardStatus::Issued),
            "ACTIVE" => Ok(CardStatus::Active),
            "FROZEN" => Ok(CardStatus::Frozen),
            "LOST" => Ok(CardStatus::Lost),
            "STOLEN" => Ok(CardStatus::Stolen),
            "CLOSED" => Ok(CardStatus::Closed),
            _ => Err(UnknownStatus {
                kind: "card",
                value: s.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for CardStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for CardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthStatus {
    Authorized,
    Captured,
    Reversed,
}

impl AuthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthStatus::Authorized => "AUTHORIZED",
            AuthStatus::Captured => "CAPTURED",
            AuthStatus::Reversed => "REVERSED",
        }
    }
}

impl FromStr for AuthStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AUTHORIZED" => Ok(AuthStatus::Authorized),
            "CAPTURED" => Ok(AuthStatus::Captured),
            "REVERSED" => Ok(AuthStatus::Reversed),
            _ => Err(UnknownStatus {
                kind: "auth",
                value: s.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for AuthStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for AuthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    pub account_id: String,
    pub core_account_id: Option<String>,
    pub currency: String,
    pub available_balance: i64,
    pub hold_balance: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Card {
    pub card_id: String,
    pub account_id: String,
    pub bin: String,
    pub last4: String,
    pub expiry_yymm: String,
    #[sqlx(try_from = "String")]
    pub status: CardStatus,
    #[serde(skip)]
    pub pan_hash: String,
    pub pan_token: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Authorization {
    pub auth_id: String,
    pub account_id: String,
    pub card_id: String,
    pub amount: i64,
    pub currency: String,
    #[sqlx(try_from = "String")]
    pub status: AuthStatus,
    pub approval_code: String,
    pub authorization_code: String,
    pub stan: Option<i64>,
    pub merchant_name: Option<String>,
    pub mcc: Option<String>,
    pub hold_expires_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Transaction {
    pub tx_id: String,
    pub account_id: String,
    pub card_id: String,
    pub auth_id: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    pub posted_at: Option<String>,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_card_status_round_trip() {
        for status in [
            CardStatus::Issued,
            CardStatus::Active,
            CardStatus::Frozen,
            CardStatus::Lost,
            CardStatus::Stolen,
            CardStatus::Closed,
        ] {
            assert_eq!(status.as_str().parse::<CardStatus>().unwrap(), status);
        }
        assert_eq!("frozen".parse::<CardStatus>().unwrap(), CardStatus::Frozen);
        assert!("melted".parse::<CardStatus>().is_err());
    }

    #[test]
    fn test_only_issued_and_active_cards_authorize() {
        assert!(CardStatus::Issued.can_authorize());
        assert!(CardStatus::Active.can_authorize());
        assert!(!CardStatus::Frozen.can_authorize());
        assert!(!CardStatus::Closed.can_authorize());
    }

    #[test]
    fn test_auth_status_parsing_is_exact() {
        assert_eq!(
            AuthStatus::try_from("CAPTURED".to_string()).unwrap(),
            AuthStatus::Captured
        );
        let err = AuthStatus::try_from("captured".to_string()).unwrap_err();
        assert_eq!(err.to_string(), "unknown auth status: captured");
    }

    #[test]
    fn test_status_serializes_upper_case() {
        assert_eq!(
            serde_json::to_string(&CardStatus::Stolen).unwrap(),
            "\"STOLEN\""
        );
        assert_eq!(
            serde_json::from_str::<CardStatus>("\"LOST\"").unwrap(),
            CardStatus::Lost
        );
    }
}
