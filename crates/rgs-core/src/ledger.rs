use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::money::{Currency, MinorAmount};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    PlayerCashless,
    OperatorLiability,
    DeviceEscrow,
    SystemSettlement,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Locked,
    Suspended,
    Closed,
}

/// A ledger account (§3 `LedgerAccount`).
///
/// `(player_id, currency)` is unique among `player_cashless` accounts; that
/// invariant is enforced by `rgs-storage`, not by this type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerAccount {
    pub account_id: String,
    pub player_id: Option<String>,
    pub account_type: AccountType,
    pub status: AccountStatus,
    pub currency: Currency,
    pub available_minor: MinorAmount,
    pub pending_minor: MinorAmount,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set while `EftFraudLockout` (§4.E invariant 5) is active.
    pub eft_locked_until: Option<DateTime<Utc>>,
    pub consecutive_denied_eft: u32,
}

impl LedgerAccount {
    pub fn is_eft_locked(&self, now: DateTime<Utc>) -> bool {
        matches!(self.eft_locked_until, Some(t) if now < t)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
    TransferToDevice,
    TransferToAccount,
    GameplayDebit,
    GameplayCredit,
    ManualAdjustment,
}

impl TransactionType {
    /// Whether this operation class is subject to EFT fraud lockout (§4.E invariant 5).
    pub fn is_eft(&self) -> bool {
        matches!(
            self,
            TransactionType::Deposit
                | TransactionType::Withdrawal
                | TransactionType::TransferToDevice
                | TransactionType::TransferToAccount
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Accepted,
    Denied,
    Pending,
    Unresolved,
    Reversed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub transaction_id: String,
    pub idempotency_key: String,
    pub account_id: String,
    pub transaction_type: TransactionType,
    pub status: TransactionStatus,
    pub amount_minor: MinorAmount,
    pub currency: Currency,
    pub authorization_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
    /// Present only for `unresolved` partial transfers (§4.E invariant 4).
    pub transferred_minor: Option<MinorAmount>,
    pub counterparty_account_id: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostingDirection {
    Debit,
    Credit,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Posting {
    pub posting_id: String,
    pub transaction_id: String,
    pub account_id: String,
    pub direction: PostingDirection,
    pub amount_minor: MinorAmount,
}

impl Posting {
    /// Signed contribution of this posting to the double-entry sum.
    pub fn signed_amount(&self) -> i64 {
        match self.direction {
            PostingDirection::Debit => -self.amount_minor.0,
            PostingDirection::Credit => self.amount_minor.0,
        }
    }
}

/// `(scope, key) -> cached response` envelope for at-most-once execution (§3, §4.E).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdempotencyEnvelope {
    pub scope: String,
    pub key: String,
    pub request_fingerprint: String,
    pub response_payload: serde_json::Value,
    pub result_code: crate::result::ResultCode,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
