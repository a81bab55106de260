//! Request/response DTOs shared by the RPC and REST front ends. Each
//! carries enough to both build the domain request and compute its
//! idempotency fingerprint (§3 `IdempotencyEnvelope`, §4.E invariant 3).

use rgs_core::{Actor, Currency, Money};
use serde::{Deserialize, Serialize};

fn fingerprint(value: &impl Serialize) -> String {
    rgs_core::request_fingerprint(&serde_json::to_value(value).expect("DTOs are always representable as JSON"))
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LoginParams {
    pub actor_id: String,
    pub actor_type: rgs_core::ActorType,
    pub password: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct TokenPairView {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: chrono::DateTime<chrono::Utc>,
    pub refresh_expires_at: chrono::DateTime<chrono::Utc>,
}

impl From<rgs_identity::TokenPair> for TokenPairView {
    fn from(p: rgs_identity::TokenPair) -> Self {
        Self {
            access_token: p.access_token,
            refresh_token: p.refresh_token,
            access_expires_at: p.access_expires_at,
            refresh_expires_at: p.refresh_expires_at,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RefreshParams {
    pub refresh_token: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SimpleLedgerParams {
    pub idempotency_key: String,
    pub account_id: String,
    pub amount_minor: i64,
    pub currency: String,
    #[serde(default)]
    pub authorization_id: Option<String>,
}

impl SimpleLedgerParams {
    pub fn into_request(self, actor: Actor) -> rgs_ledger::SimpleLedgerRequest {
        let fp = fingerprint(&self);
        rgs_ledger::SimpleLedgerRequest {
            idempotency_key: self.idempotency_key,
            request_fingerprint: fp,
            account_id: self.account_id,
            amount_minor: rgs_core::MinorAmount(self.amount_minor),
            currency: Currency::new(self.currency),
            authorization_id: self.authorization_id,
            actor,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TransferParams {
    pub idempotency_key: String,
    pub source_account_id: String,
    pub destination_account_id: String,
    pub requested_minor: i64,
    pub currency: String,
    #[serde(default)]
    pub authorization_id: Option<String>,
    #[serde(default)]
    pub max_destination_accept_minor: Option<i64>,
}

impl TransferParams {
    pub fn into_request(self, actor: Actor) -> rgs_ledger::TransferRequest {
        let fp = fingerprint(&self);
        rgs_ledger::TransferRequest {
            idempotency_key: self.idempotency_key,
            request_fingerprint: fp,
            source_account_id: self.source_account_id,
            destination_account_id: self.destination_account_id,
            requested_minor: rgs_core::MinorAmount(self.requested_minor),
            currency: Currency::new(self.currency),
            authorization_id: self.authorization_id,
            max_destination_accept_minor: self.max_destination_accept_minor.map(rgs_core::MinorAmount),
            actor,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TransactionIdParams {
    pub transaction_id: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PlaceWagerParams {
    pub idempotency_key: String,
    pub wager_id: String,
    pub player_id: String,
    pub game_id: String,
    pub account_id: String,
    pub stake_minor: i64,
    pub currency: String,
}

impl PlaceWagerParams {
    pub fn into_request(self, actor: Actor) -> rgs_wagering::PlaceWagerRequest {
        let fp = fingerprint(&self);
        rgs_wagering::PlaceWagerRequest {
            idempotency_key: self.idempotency_key,
            request_fingerprint: fp,
            wager_id: self.wager_id,
            player_id: self.player_id,
            game_id: self.game_id,
            account_id: self.account_id,
            stake: Money::new(self.stake_minor, self.currency),
            actor,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SettleWagerParams {
    pub idempotency_key: String,
    pub wager_id: String,
    pub payout_minor: i64,
    pub currency: String,
    #[serde(default)]
    pub outcome_ref: Option<String>,
}

impl SettleWagerParams {
    pub fn into_request(self, actor: Actor) -> rgs_wagering::SettleWagerRequest {
        let fp = fingerprint(&self);
        rgs_wagering::SettleWagerRequest {
            idempotency_key: self.idempotency_key,
            request_fingerprint: fp,
            wager_id: self.wager_id,
            payout: Money::new(self.payout_minor, self.currency),
            outcome_ref: self.outcome_ref,
            actor,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CancelWagerParams {
    pub idempotency_key: String,
    pub wager_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

impl CancelWagerParams {
    pub fn into_request(self, actor: Actor) -> rgs_wagering::CancelWagerRequest {
        let fp = fingerprint(&self);
        rgs_wagering::CancelWagerRequest {
            idempotency_key: self.idempotency_key,
            request_fingerprint: fp,
            wager_id: self.wager_id,
            reason: self.reason,
            actor,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GenerateReportParams {
    pub report_type: rgs_reporting::ReportType,
    pub interval: rgs_reporting::ReportInterval,
    pub format: rgs_reporting::ReportFormat,
    #[serde(default)]
    pub account_id: Option<String>,
}

impl GenerateReportParams {
    pub fn into_request(self, operator_id: String) -> rgs_reporting::GenerateReportRequest {
        rgs_reporting::GenerateReportRequest {
            report_type: self.report_type,
            interval: self.interval,
            format: self.format,
            operator_id,
            account_id: self.account_id,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProposeConfigChangeParams {
    pub namespace: String,
    pub key: String,
    pub proposed_value: serde_json::Value,
    pub reason: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ChangeIdParams {
    pub change_id: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RejectConfigChangeParams {
    pub change_id: String,
    pub reason: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct VerifyAuditChainParams {
    pub partition_day: chrono::NaiveDate,
}

#[derive(Clone, Debug, Serialize)]
pub struct VerifyAuditChainView {
    pub valid: bool,
    pub first_mismatch_id: Option<String>,
}

impl From<rgs_audit::VerifyOutcome> for VerifyAuditChainView {
    fn from(o: rgs_audit::VerifyOutcome) -> Self {
        Self { valid: o.valid, first_mismatch_id: o.first_mismatch_id }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SubmitIngestionParams {
    pub boundary_id: String,
    pub record: rgs_core::ingestion::IngestionRecord,
}
