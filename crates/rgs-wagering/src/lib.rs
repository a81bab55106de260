//! The wager state machine (component F): `PlaceWager` → `pending` →
//! `SettleWager`/`CancelWager` → terminal (§3 `Wager`, §4.F).
//!
//! The debit/credit against the player's ledger account and the wager
//! row's own state transition are not a single storage transaction —
//! they're ordered so that the ledger call (which carries its own
//! idempotency envelope) always runs before the wager row is written,
//! the same "side effect first, record second" discipline the ledger
//! crate itself uses for the audit chain.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rgs_audit::AuditChain;
use rgs_core::audit::{AuditDraft, AuditResult as AuditOutcome};
use rgs_core::ledger::IdempotencyEnvelope;
use rgs_core::money::Money;
use rgs_core::wager::{Wager, WagerStatus};
use rgs_core::{Actor, Clock, Currency, MinorAmount, RgsError, RgsResult};
use rgs_ledger::{LedgerService, SimpleLedgerRequest};
use rgs_storage::{composite_key, decode, encode, Backend, KvTree};
use tokio::sync::Mutex as AsyncMutex;
use tracing::info;

pub struct PlaceWagerRequest {
    pub idempotency_key: String,
    pub request_fingerprint: String,
    pub wager_id: String,
    pub player_id: String,
    pub game_id: String,
    pub account_id: String,
    pub stake: Money,
    pub actor: Actor,
}

pub struct SettleWagerRequest {
    pub idempotency_key: String,
    pub request_fingerprint: String,
    pub wager_id: String,
    pub payout: Money,
    pub outcome_ref: Option<String>,
    pub actor: Actor,
}

pub struct CancelWagerRequest {
    pub idempotency_key: String,
    pub request_fingerprint: String,
    pub wager_id: String,
    pub reason: Option<String>,
    pub actor: Actor,
}

pub struct WageringService {
    wagers: Arc<dyn KvTree>,
    envelopes: Arc<dyn KvTree>,
    ledger: Arc<LedgerService>,
    audit: Arc<AuditChain>,
    clock: Arc<dyn Clock>,
    wager_locks: dashmap::DashMap<String, Arc<AsyncMutex<()>>>,
    envelope_ttl: chrono::Duration,
}

impl WageringService {
    pub fn new(
        backend: &Backend,
        ledger: Arc<LedgerService>,
        audit: Arc<AuditChain>,
        clock: Arc<dyn Clock>,
    ) -> RgsResult<Self> {
        Ok(Self {
            wagers: backend.open_tree("wagers")?,
            envelopes: backend.open_tree("wagering_idempotency")?,
            ledger,
            audit,
            clock,
            wager_locks: dashmap::DashMap::new(),
            envelope_ttl: chrono::Duration::hours(24),
        })
    }

    fn lock_for(&self, wager_id: &str) -> Arc<AsyncMutex<()>> {
        self.wager_locks
            .entry(wager_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn get_wager(&self, wager_id: &str) -> RgsResult<Option<Wager>> {
        match self.wagers.get(wager_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_wager(&self, wager: &Wager) -> RgsResult<()> {
        self.wagers.insert(wager.wager_id.as_bytes(), encode(wager)?).map_err(RgsError::from)
    }

    fn envelope_key(op: &str, wager_id: &str) -> Vec<u8> {
        composite_key(&[op.as_bytes(), wager_id.as_bytes()])
    }

    fn lookup_envelope(&self, op: &str, wager_id: &str) -> RgsResult<Option<IdempotencyEnvelope>> {
        match self.envelopes.get(&Self::envelope_key(op, wager_id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn store_envelope(&self, op: &str, wager_id: &str, fingerprint: &str, wager: &Wager, now: DateTime<Utc>) -> RgsResult<()> {
        let envelope = IdempotencyEnvelope {
            scope: op.to_string(),
            key: wager_id.to_string(),
            request_fingerprint: fingerprint.to_string(),
            response_payload: serde_json::to_value(wager).map_err(|e| RgsError::Internal(e.to_string()))?,
            result_code: rgs_core::ResultCode::Ok,
            created_at: now,
            expires_at: now + self.envelope_ttl,
        };
        self.envelopes
            .insert(&Self::envelope_key(op, wager_id), encode(&envelope)?)
            .map_err(RgsError::from)
    }

    async fn audit(&self, actor: &Actor, wager_id: &str, action: &str, result: AuditOutcome, reason: Option<String>, after: Option<serde_json::Value>) -> RgsResult<()> {
        let now = self.clock.now();
        self.audit
            .append(
                now.date_naive(),
                AuditDraft {
                    occurred_at: now,
                    actor: actor.clone(),
                    object_type: "wager".to_string(),
                    object_id: wager_id.to_string(),
                    action: action.to_string(),
                    before_state: None,
                    after_state: after,
                    result,
                    reason,
                },
            )
            .await
            .map(|_| ())
            .map_err(|e| RgsError::AuditUnavailable(e.to_string()))
    }

    /// `PlaceWager` (§4.F): debits `stake` and writes the wager row.
    /// Idempotent by `(operation="place", wager_id)`.
    pub async fn place_wager(&self, req: PlaceWagerRequest) -> RgsResult<Wager> {
        let lock = self.lock_for(&req.wager_id);
        let _permit = lock.lock().await;

        if let Some(env) = self.lookup_envelope("place", &req.wager_id)? {
            if env.request_fingerprint != req.request_fingerprint {
                return Err(RgsError::IdempotencyFingerprintMismatch);
            }
            return serde_json::from_value(env.response_payload).map_err(|e| RgsError::Internal(e.to_string()));
        }

        let now = self.clock.now();
        let debit = SimpleLedgerRequest {
            idempotency_key: format!("wager-place:{}", req.wager_id),
            request_fingerprint: req.request_fingerprint.clone(),
            account_id: req.account_id.clone(),
            amount_minor: req.stake.amount_minor,
            currency: req.stake.currency.clone(),
            authorization_id: Some(req.wager_id.clone()),
            actor: req.actor.clone(),
        };
        self.ledger.gameplay_debit(debit).await?;

        let wager = Wager {
            wager_id: req.wager_id.clone(),
            player_id: req.player_id,
            game_id: req.game_id,
            stake: req.stake,
            status: WagerStatus::Pending,
            payout: None,
            outcome_ref: None,
            placed_at: now,
            settled_at: None,
            canceled_at: None,
            cancel_reason: None,
        };
        self.put_wager(&wager)?;
        self.store_envelope("place", &req.wager_id, &req.request_fingerprint, &wager, now)?;

        let after = serde_json::to_value(&wager).map_err(|e| RgsError::Internal(e.to_string()))?;
        self.audit(&req.actor, &req.wager_id, "place_wager", AuditOutcome::Ok, None, Some(after)).await?;
        info!(wager_id = %wager.wager_id, "wager placed");
        Ok(wager)
    }

    /// `SettleWager` (§4.F): credits `payout` (may be zero) and transitions
    /// `pending` → `settled`. Idempotent by `(operation="settle", wager_id)`.
    pub async fn settle_wager(&self, req: SettleWagerRequest) -> RgsResult<Wager> {
        let lock = self.lock_for(&req.wager_id);
        let _permit = lock.lock().await;

        if let Some(env) = self.lookup_envelope("settle", &req.wager_id)? {
            if env.request_fingerprint != req.request_fingerprint {
                return Err(RgsError::IdempotencyFingerprintMismatch);
            }
            return serde_json::from_value(env.response_payload).map_err(|e| RgsError::Internal(e.to_string()));
        }

        let mut wager = self
            .get_wager(&req.wager_id)?
            .ok_or_else(|| RgsError::Invalid("wager not found".to_string()))?;
        if wager.status != WagerStatus::Pending {
            self.audit(&req.actor, &req.wager_id, "settle_wager", AuditOutcome::Denied, Some("wager not pending".to_string()), None).await?;
            return Err(RgsError::Denied("wager not pending".to_string()));
        }

        let now = self.clock.now();
        if req.payout.amount_minor.0 > 0 {
            let account_id = self.player_account_id(&wager.player_id, &req.payout.currency)?;
            let credit = SimpleLedgerRequest {
                idempotency_key: format!("wager-settle:{}", req.wager_id),
                request_fingerprint: req.request_fingerprint.clone(),
                account_id,
                amount_minor: req.payout.amount_minor,
                currency: req.payout.currency.clone(),
                authorization_id: Some(req.wager_id.clone()),
                actor: req.actor.clone(),
            };
            self.ledger.gameplay_credit(credit).await?;
        }

        wager.status = WagerStatus::Settled;
        wager.payout = Some(req.payout);
        wager.outcome_ref = req.outcome_ref;
        wager.settled_at = Some(now);
        self.put_wager(&wager)?;
        self.store_envelope("settle", &req.wager_id, &req.request_fingerprint, &wager, now)?;

        let after = serde_json::to_value(&wager).map_err(|e| RgsError::Internal(e.to_string()))?;
        self.audit(&req.actor, &req.wager_id, "settle_wager", AuditOutcome::Ok, None, Some(after)).await?;
        info!(wager_id = %wager.wager_id, "wager settled");
        Ok(wager)
    }

    /// `CancelWager` (§4.F): refunds `stake` and transitions `pending` →
    /// `canceled`. Denied if the wager is not `pending`. Idempotent by
    /// `(operation="cancel", wager_id)`.
    pub async fn cancel_wager(&self, req: CancelWagerRequest) -> RgsResult<Wager> {
        let lock = self.lock_for(&req.wager_id);
        let _permit = lock.lock().await;

        if let Some(env) = self.lookup_envelope("cancel", &req.wager_id)? {
            if env.request_fingerprint != req.request_fingerprint {
                return Err(RgsError::IdempotencyFingerprintMismatch);
            }
            return serde_json::from_value(env.response_payload).map_err(|e| RgsError::Internal(e.to_string()));
        }

        let mut wager = self
            .get_wager(&req.wager_id)?
            .ok_or_else(|| RgsError::Invalid("wager not found".to_string()))?;
        if wager.status != WagerStatus::Pending {
            self.audit(&req.actor, &req.wager_id, "cancel_wager", AuditOutcome::Denied, Some("wager not pending".to_string()), None).await?;
            return Err(RgsError::Denied("wager not pending".to_string()));
        }

        let now = self.clock.now();
        let account_id = self.player_account_id(&wager.player_id, &wager.stake.currency)?;
        let refund = SimpleLedgerRequest {
            idempotency_key: format!("wager-cancel:{}", req.wager_id),
            request_fingerprint: req.request_fingerprint.clone(),
            account_id,
            amount_minor: wager.stake.amount_minor,
            currency: wager.stake.currency.clone(),
            authorization_id: Some(req.wager_id.clone()),
            actor: req.actor.clone(),
        };
        self.ledger.gameplay_credit(refund).await?;

        wager.status = WagerStatus::Canceled;
        wager.canceled_at = Some(now);
        wager.cancel_reason = req.reason;
        self.put_wager(&wager)?;
        self.store_envelope("cancel", &req.wager_id, &req.request_fingerprint, &wager, now)?;

        let after = serde_json::to_value(&wager).map_err(|e| RgsError::Internal(e.to_string()))?;
        self.audit(&req.actor, &req.wager_id, "cancel_wager", AuditOutcome::Ok, None, Some(after)).await?;
        Ok(wager)
    }

    pub fn get_wager_by_id(&self, wager_id: &str) -> RgsResult<Option<Wager>> {
        self.get_wager(wager_id)
    }

    /// `Wager` doesn't carry its ledger account id directly (§3 only
    /// lists `player_id`); settlement and cancellation resolve it
    /// through the player's canonical cashless account for the
    /// currency, unique by construction (§4.E `OpenAccount`).
    fn player_account_id(&self, player_id: &str, currency: &Currency) -> RgsResult<String> {
        self.ledger
            .find_player_account(player_id, currency)?
            .map(|a| a.account_id)
            .ok_or_else(|| RgsError::Invalid("no ledger account for player".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rgs_core::ledger::AccountType;
    use rgs_core::{ActorType, FakeClock};

    async fn new_services() -> (WageringService, Arc<LedgerService>, String, Arc<FakeClock>) {
        let backend = Backend::in_memory();
        let clock = Arc::new(FakeClock::new(chrono::Utc::now()));
        let audit = Arc::new(AuditChain::new(&backend, clock.clone()).unwrap());
        let ledger = Arc::new(
            LedgerService::new(&backend, audit.clone(), clock.clone(), rgs_ledger::LedgerConfig::default(), false)
                .unwrap(),
        );
        let account = ledger
            .open_account(Some("player-1".to_string()), AccountType::PlayerCashless, Currency::new("USD"))
            .unwrap();
        ledger
            .deposit(SimpleLedgerRequest {
                idempotency_key: "seed-deposit".to_string(),
                request_fingerprint: "fp-seed".to_string(),
                account_id: account.account_id.clone(),
                amount_minor: MinorAmount(10_000),
                currency: Currency::new("USD"),
                authorization_id: None,
                actor: Actor::new("operator-1", ActorType::Operator),
            })
            .await
            .unwrap();
        let wagering = WageringService::new(&backend, ledger.clone(), audit, clock.clone()).unwrap();
        (wagering, ledger, account.account_id, clock)
    }

    fn place_req(wager_id: &str, account_id: &str, stake: i64) -> PlaceWagerRequest {
        PlaceWagerRequest {
            idempotency_key: format!("place-{wager_id}"),
            request_fingerprint: format!("fp-{wager_id}"),
            wager_id: wager_id.to_string(),
            player_id: "player-1".to_string(),
            game_id: "game-1".to_string(),
            account_id: account_id.to_string(),
            stake: Money::new(stake, "USD"),
            actor: Actor::new("player-1", ActorType::Player),
        }
    }

    #[tokio::test]
    async fn place_then_settle_credits_payout() {
        let (wagering, ledger, account_id, _clock) = new_services().await;

        let wager = wagering.place_wager(place_req("wager-1", &account_id, 500)).await.unwrap();
        assert_eq!(wager.status, WagerStatus::Pending);
        let balance = ledger.get_balance(&account_id).unwrap();
        assert_eq!(balance.available_minor, MinorAmount(9_500));

        let settled = wagering
            .settle_wager(SettleWagerRequest {
                idempotency_key: "settle-wager-1".to_string(),
                request_fingerprint: "fp-settle-1".to_string(),
                wager_id: "wager-1".to_string(),
                payout: Money::new(1_200, "USD"),
                outcome_ref: Some("spin-outcome-42".to_string()),
                actor: Actor::new("player-1", ActorType::Player),
            })
            .await
            .unwrap();
        assert_eq!(settled.status, WagerStatus::Settled);
        let balance = ledger.get_balance(&account_id).unwrap();
        assert_eq!(balance.available_minor, MinorAmount(9_500 + 1_200));
    }

    #[tokio::test]
    async fn cancel_refunds_stake_and_is_denied_once_settled() {
        let (wagering, ledger, account_id, _clock) = new_services().await;

        wagering.place_wager(place_req("wager-2", &account_id, 500)).await.unwrap();
        let canceled = wagering
            .cancel_wager(CancelWagerRequest {
                idempotency_key: "cancel-wager-2".to_string(),
                request_fingerprint: "fp-cancel-2".to_string(),
                wager_id: "wager-2".to_string(),
                reason: Some("player requested".to_string()),
                actor: Actor::new("player-1", ActorType::Player),
            })
            .await
            .unwrap();
        assert_eq!(canceled.status, WagerStatus::Canceled);
        let balance = ledger.get_balance(&account_id).unwrap();
        assert_eq!(balance.available_minor, MinorAmount(10_000));

        let err = wagering
            .cancel_wager(CancelWagerRequest {
                idempotency_key: "cancel-wager-2b".to_string(),
                request_fingerprint: "fp-cancel-2b".to_string(),
                wager_id: "wager-2".to_string(),
                reason: None,
                actor: Actor::new("player-1", ActorType::Player),
            })
            .await
            .unwrap_err();
        assert_eq!(err.wire_reason(), "wager not pending");
    }

    #[tokio::test]
    async fn place_wager_is_idempotent_by_wager_id() {
        let (wagering, ledger, account_id, _clock) = new_services().await;

        let first = wagering.place_wager(place_req("wager-3", &account_id, 500)).await.unwrap();
        let second = wagering.place_wager(place_req("wager-3", &account_id, 500)).await.unwrap();
        assert_eq!(first.wager_id, second.wager_id);
        let balance = ledger.get_balance(&account_id).unwrap();
        assert_eq!(balance.available_minor, MinorAmount(9_500));
    }
}
