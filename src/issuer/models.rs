use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

use crate::db::models::{Card, CardStatus};

/// ISO 8583 style response codes (DE39).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalCode {
    Approved,
    DoNotHonor,
    InvalidAmount,
    InvalidCard,
    LostCard,
    StolenCard,
    InsufficientFunds,
    ExpiredCard,
    DuplicateTransmission,
}

impl ApprovalCode {
    pub fn code(&self) -> &'static str {
        match self {
            ApprovalCode::Approved => "00",
            ApprovalCode::DoNotHonor => "05",
            ApprovalCode::InvalidAmount => "13",
            ApprovalCode::InvalidCard => "14",
            ApprovalCode::LostCard => "41",
            ApprovalCode::StolenCard => "43",
            ApprovalCode::InsufficientFunds => "51",
            ApprovalCode::ExpiredCard => "54",
            ApprovalCode::DuplicateTransmission => "94",
        }
    }

    /// Decline code for a card that exists but may not transact.
    pub fn for_card_status(status: CardStatus) -> Option<Self> {
        if status.can_authorize() {
            return None;
        }
        match status {
            CardStatus::Lost => Some(ApprovalCode::LostCard),
            CardStatus::Stolen => Some(ApprovalCode::StolenCard),
            _ => Some(ApprovalCode::DoNotHonor),
        }
    }
}

impl Serialize for ApprovalCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAccount {
    pub balance: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Merchant {
    pub name: Option<String>,
    pub mcc: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    pub pan: String,
    /// YYMM as carried in DE14, or the printed "MM/YY".
    pub expiry: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub merchant: Merchant,
    pub stan: Option<i64>,
    pub hold_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorizationResponse {
    pub approval_code: ApprovalCode,
    pub authorization_code: Option<String>,
    pub auth_id: Option<String>,
    pub duplicate: bool,
}

impl AuthorizationResponse {
    pub fn declined(code: ApprovalCode) -> Self {
        Self {
            approval_code: code,
            authorization_code: None,
            auth_id: None,
            duplicate: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureRequest {
    pub pan: String,
    pub expiry: String,
    pub stan: i64,
    /// Zero or absent captures the full hold.
    #[serde(default)]
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReverseRequest {
    pub pan: String,
    pub expiry: String,
    pub stan: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardLookup {
    pub pan: String,
    pub expiry: String,
}

/// Returned once at issuance; the plaintext PAN and CVV are not kept.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedCard {
    pub card_id: String,
    pub account_id: String,
    pub pan: String,
    pub cvv: String,
    /// MMYY
    pub expiry: String,
    pub card_face: String,
    pub status: CardStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct CardSummary {
    #[serde(flatten)]
    pub card: Card,
    pub card_face: String,
    pub expired: bool,
    pub reissue_due: bool,
}
