//! The account ledger and posting engine (component E): balances, the
//! double-entry posting engine, the durable idempotency envelope cache,
//! and EFT fraud lockout (§3, §4.E).
//!
//! Every state-changing call computes its new account/transaction state
//! first, appends the audit record, and only then persists the domain
//! rows — an audit-store failure therefore never leaves an orphaned
//! balance change behind, at the cost of the inverse failure mode (a
//! crash between the audit append and the domain write) being accepted
//! as out of scope for a single-process simulation of atomicity.

use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use rgs_audit::AuditChain;
use rgs_core::audit::{AuditDraft, AuditResult as AuditOutcome};
use rgs_core::ledger::{
    AccountStatus, AccountType, IdempotencyEnvelope, LedgerAccount, LedgerTransaction, Posting,
    PostingDirection, TransactionStatus, TransactionType,
};
use rgs_core::{Actor, Clock, Currency, MinorAmount, RgsError, RgsResult};
use rgs_storage::{composite_key, decode, encode, Backend, KvTree};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

#[derive(Clone, Debug)]
pub struct LedgerConfig {
    pub eft_lockout_threshold: u32,
    pub eft_lockout_ttl: ChronoDuration,
    pub idempotency_envelope_ttl: ChronoDuration,
    pub idempotency_cleanup_interval: std::time::Duration,
    pub idempotency_cleanup_batch: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            eft_lockout_threshold: 3,
            eft_lockout_ttl: ChronoDuration::minutes(30),
            idempotency_envelope_ttl: ChronoDuration::hours(24),
            idempotency_cleanup_interval: std::time::Duration::from_secs(600),
            idempotency_cleanup_batch: 1000,
        }
    }
}

/// Counters exposed for the reporting/observability ambient stack.
#[derive(Default)]
pub struct IdempotencyCounters {
    pub deleted_total: AtomicU64,
    pub expired_queued: AtomicU64,
    pub last_run_epoch: AtomicI64,
}

/// Everything a caller gets back from a successful posting operation.
#[derive(Clone, Debug, Serialize, serde::Deserialize)]
pub struct LedgerOutcome {
    pub transaction: LedgerTransaction,
    pub postings: Vec<Posting>,
    pub account: LedgerAccount,
}

pub struct LedgerService {
    accounts: Arc<dyn KvTree>,
    player_currency_index: Arc<dyn KvTree>,
    transactions: Arc<dyn KvTree>,
    idempotency: Arc<dyn KvTree>,
    memory_idempotency_cache: DashMap<(String, String), IdempotencyEnvelope>,
    account_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    audit: Arc<AuditChain>,
    clock: Arc<dyn Clock>,
    config: LedgerConfig,
    strict_production: bool,
    pub idempotency_counters: IdempotencyCounters,
}

/// A request to move money between two accounts where the destination's
/// capacity to accept the full amount is not guaranteed (§4.E invariant 4):
/// a device cash box or an escrow account with its own ceiling. `None`
/// means "accept the full amount", the common case for account-to-account
/// transfers.
#[derive(Clone, Debug)]
pub struct TransferRequest {
    pub idempotency_key: String,
    pub request_fingerprint: String,
    pub source_account_id: String,
    pub destination_account_id: String,
    pub requested_minor: MinorAmount,
    pub currency: Currency,
    pub authorization_id: Option<String>,
    pub max_destination_accept_minor: Option<MinorAmount>,
    pub actor: Actor,
}

#[derive(Clone, Debug)]
pub struct SimpleLedgerRequest {
    pub idempotency_key: String,
    pub request_fingerprint: String,
    pub account_id: String,
    pub amount_minor: MinorAmount,
    pub currency: Currency,
    pub authorization_id: Option<String>,
    pub actor: Actor,
}

impl LedgerService {
    pub fn new(
        backend: &Backend,
        audit: Arc<AuditChain>,
        clock: Arc<dyn Clock>,
        config: LedgerConfig,
        strict_production: bool,
    ) -> RgsResult<Self> {
        Ok(Self {
            accounts: backend.open_tree("ledger_accounts")?,
            player_currency_index: backend.open_tree("ledger_player_currency_index")?,
            transactions: backend.open_tree("ledger_transactions")?,
            idempotency: backend.open_tree("ledger_idempotency")?,
            memory_idempotency_cache: DashMap::new(),
            account_locks: DashMap::new(),
            audit,
            clock,
            config,
            strict_production,
            idempotency_counters: IdempotencyCounters::default(),
        })
    }

    fn lock_for(&self, account_id: &str) -> Arc<AsyncMutex<()>> {
        self.account_locks
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn get_account(&self, account_id: &str) -> RgsResult<LedgerAccount> {
        match self.accounts.get(account_id.as_bytes())? {
            Some(bytes) => Ok(decode(&bytes)?),
            None => Err(RgsError::Invalid("account not found".to_string())),
        }
    }

    fn put_account(&self, account: &LedgerAccount) -> RgsResult<()> {
        self.accounts
            .insert(account.account_id.as_bytes(), encode(account)?)
            .map_err(RgsError::from)
    }

    fn put_transaction(&self, txn: &LedgerTransaction, postings: &[Posting]) -> RgsResult<()> {
        let bytes = encode(&(txn.clone(), postings.to_vec()))?;
        self.transactions
            .insert(txn.transaction_id.as_bytes(), bytes)
            .map_err(RgsError::from)
    }

    /// `OpenAccount` (supplemented — the nine listed ledger operations
    /// assume accounts already exist; something has to create them).
    pub fn open_account(
        &self,
        player_id: Option<String>,
        account_type: AccountType,
        currency: Currency,
    ) -> RgsResult<LedgerAccount> {
        if account_type == AccountType::PlayerCashless {
            if let Some(pid) = &player_id {
                let idx_key = composite_key(&[pid.as_bytes(), currency.0.as_bytes()]);
                if self.player_currency_index.contains_key(&idx_key) {
                    return Err(RgsError::Invalid(
                        "a player_cashless account already exists for this player and currency"
                            .to_string(),
                    ));
                }
            }
        }
        let now = self.clock.now();
        let account = LedgerAccount {
            account_id: rgs_core::new_id(),
            player_id: player_id.clone(),
            account_type,
            status: AccountStatus::Active,
            currency: currency.clone(),
            available_minor: MinorAmount::ZERO,
            pending_minor: MinorAmount::ZERO,
            created_at: now,
            updated_at: now,
            eft_locked_until: None,
            consecutive_denied_eft: 0,
        };
        self.put_account(&account)?;
        if account_type == AccountType::PlayerCashless {
            if let Some(pid) = &player_id {
                let idx_key = composite_key(&[pid.as_bytes(), currency.0.as_bytes()]);
                self.player_currency_index.insert(&idx_key, account.account_id.as_bytes().to_vec())?;
            }
        }
        Ok(account)
    }

    /// Resolve a player's canonical `player_cashless` account for
    /// `currency`, the one `(player_id, currency)` pair enforces as
    /// unique (§3 `LedgerAccount`). Used by subsystems that only know a
    /// player id — wagering, for instance — and need the account id.
    pub fn find_player_account(&self, player_id: &str, currency: &Currency) -> RgsResult<Option<LedgerAccount>> {
        let idx_key = composite_key(&[player_id.as_bytes(), currency.0.as_bytes()]);
        match self.player_currency_index.get(&idx_key)? {
            Some(bytes) => {
                let account_id = String::from_utf8_lossy(&bytes).to_string();
                Ok(Some(self.get_account(&account_id)?))
            }
            None => Ok(None),
        }
    }

    /// Idempotent lookup-or-create for the shared counterparty accounts
    /// (`system_settlement`, `operator_liability`, `device_escrow`) that
    /// every posting operation needs one of per currency.
    fn get_or_create_system_account(
        &self,
        account_type: AccountType,
        currency: &Currency,
    ) -> RgsResult<LedgerAccount> {
        let marker_key = composite_key(&[
            b"system",
            format!("{:?}", account_type).as_bytes(),
            currency.0.as_bytes(),
        ]);
        if let Some(bytes) = self.player_currency_index.get(&marker_key)? {
            let account_id = String::from_utf8_lossy(&bytes).to_string();
            return self.get_account(&account_id);
        }
        let account = self.open_account(None, account_type, currency.clone())?;
        self.player_currency_index
            .insert(&marker_key, account.account_id.as_bytes().to_vec())?;
        Ok(account)
    }

    pub fn get_balance(&self, account_id: &str) -> RgsResult<LedgerAccount> {
        self.get_account(account_id)
    }

    /// All accounts, optionally filtered by type (supplemented — needed
    /// by reporting's cashless-liability-summary, which aggregates over
    /// every account of a given type rather than one at a time).
    pub fn list_accounts(&self, account_type: Option<AccountType>) -> RgsResult<Vec<LedgerAccount>> {
        let mut out = Vec::new();
        for (_, bytes) in self.accounts.scan()? {
            let account: LedgerAccount = decode(&bytes)?;
            if account_type.map_or(true, |t| account.account_type == t) {
                out.push(account);
            }
        }
        Ok(out)
    }

    /// `ListTransactions` (§4.E), ordered by `occurred_at` ascending —
    /// same "scan then sort" pattern the audit chain uses (§4.B).
    pub fn list_transactions(&self, account_id: &str) -> RgsResult<Vec<LedgerTransaction>> {
        let mut out = Vec::new();
        for (_, bytes) in self.transactions.scan()? {
            let (txn, _postings): (LedgerTransaction, Vec<Posting>) = decode(&bytes)?;
            if txn.account_id == account_id || txn.counterparty_account_id.as_deref() == Some(account_id) {
                out.push(txn);
            }
        }
        out.sort_by_key(|t| t.occurred_at);
        Ok(out)
    }

    async fn audit(
        &self,
        actor: &Actor,
        object_id: &str,
        action: &str,
        result: AuditOutcome,
        reason: Option<String>,
        after_state: Option<serde_json::Value>,
    ) -> RgsResult<()> {
        let now = self.clock.now();
        self.audit
            .append(
                now.date_naive(),
                AuditDraft {
                    occurred_at: now,
                    actor: actor.clone(),
                    object_type: "ledger_transaction".to_string(),
                    object_id: object_id.to_string(),
                    action: action.to_string(),
                    before_state: None,
                    after_state,
                    result,
                    reason,
                },
            )
            .await
            .map(|_| ())
            .map_err(|e| RgsError::AuditUnavailable(e.to_string()))
    }

    // ── Idempotency envelope cache (§4.E, §9) ──────────────────────────────

    fn envelope_key(scope: &str, key: &str) -> Vec<u8> {
        composite_key(&[scope.as_bytes(), key.as_bytes()])
    }

    fn lookup_envelope(&self, scope: &str, key: &str) -> RgsResult<Option<IdempotencyEnvelope>> {
        if !self.strict_production {
            if let Some(env) = self.memory_idempotency_cache.get(&(scope.to_string(), key.to_string())) {
                return Ok(Some(env.clone()));
            }
        }
        match self.idempotency.get(&Self::envelope_key(scope, key))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn store_envelope(&self, env: &IdempotencyEnvelope) -> RgsResult<()> {
        self.idempotency
            .insert(&Self::envelope_key(&env.scope, &env.key), encode(env)?)?;
        if !self.strict_production {
            self.memory_idempotency_cache
                .insert((env.scope.clone(), env.key.clone()), env.clone());
        }
        Ok(())
    }

    fn replay<T: DeserializeOwned>(env: &IdempotencyEnvelope) -> RgsResult<T> {
        use rgs_core::ResultCode;
        match env.result_code {
            ResultCode::Ok => serde_json::from_value(env.response_payload.clone())
                .map_err(|e| RgsError::Internal(e.to_string())),
            ResultCode::Denied => Err(RgsError::Denied(
                env.response_payload["reason"].as_str().unwrap_or("denied").to_string(),
            )),
            ResultCode::Invalid => Err(RgsError::Invalid(
                env.response_payload["reason"].as_str().unwrap_or("invalid").to_string(),
            )),
            ResultCode::Error => Err(RgsError::Internal("replayed error outcome".to_string())),
        }
    }

    /// Run `f` under the `(scope, key, request_fingerprint)` idempotency
    /// contract (§4.E invariant 3): a repeat call with the same
    /// fingerprint replays the original outcome; a repeat with a
    /// different fingerprint is `INVALID`. Transient internal errors are
    /// not cached, so the caller may safely retry.
    async fn with_idempotency<T, F, Fut>(
        &self,
        scope: &str,
        key: &str,
        fingerprint: &str,
        f: F,
    ) -> RgsResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = RgsResult<T>>,
    {
        if let Some(env) = self.lookup_envelope(scope, key)? {
            if env.request_fingerprint != fingerprint {
                return Err(RgsError::IdempotencyFingerprintMismatch);
            }
            return Self::replay(&env);
        }

        let now = self.clock.now();
        let outcome = f().await;
        let (result_code, payload) = match &outcome {
            Ok(value) => (
                rgs_core::ResultCode::Ok,
                serde_json::to_value(value).map_err(|e| RgsError::Internal(e.to_string()))?,
            ),
            Err(e @ RgsError::Denied(_)) => {
                (rgs_core::ResultCode::Denied, serde_json::json!({ "reason": e.wire_reason() }))
            }
            Err(e @ RgsError::Invalid(_)) => {
                (rgs_core::ResultCode::Invalid, serde_json::json!({ "reason": e.wire_reason() }))
            }
            Err(_) => return outcome, // transient — do not cache, allow retry
        };

        let envelope = IdempotencyEnvelope {
            scope: scope.to_string(),
            key: key.to_string(),
            request_fingerprint: fingerprint.to_string(),
            response_payload: payload,
            result_code,
            created_at: now,
            expires_at: now + self.config.idempotency_envelope_ttl,
        };
        self.store_envelope(&envelope)?;
        outcome
    }

    /// Delete expired envelopes in bounded batches (§4.E, §9 scheduling model).
    pub fn cleanup_expired_envelopes(&self) -> RgsResult<usize> {
        let now = self.clock.now();
        let mut deleted = 0usize;
        let mut remaining_expired = 0usize;
        for (key, bytes) in self.idempotency.scan()? {
            let env: IdempotencyEnvelope = decode(&bytes)?;
            if now >= env.expires_at {
                if deleted < self.config.idempotency_cleanup_batch {
                    self.idempotency.remove(&key)?;
                    self.memory_idempotency_cache.remove(&(env.scope, env.key));
                    deleted += 1;
                } else {
                    remaining_expired += 1;
                }
            }
        }
        self.idempotency_counters.deleted_total.fetch_add(deleted as u64, Ordering::Relaxed);
        self.idempotency_counters.expired_queued.store(remaining_expired as u64, Ordering::Relaxed);
        self.idempotency_counters.last_run_epoch.store(now.timestamp(), Ordering::Relaxed);
        Ok(deleted)
    }

    pub fn spawn_idempotency_cleaner(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = self.config.idempotency_cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.cleanup_expired_envelopes() {
                    warn!(error = %e, "idempotency envelope cleanup failed");
                }
            }
        })
    }

    // ── EFT fraud lockout (§4.E invariant 5) ───────────────────────────────

    fn check_eft_lockout(&self, account: &LedgerAccount, now: DateTime<Utc>) -> RgsResult<()> {
        if account.is_eft_locked(now) {
            return Err(RgsError::Denied("account locked for suspected EFT fraud".to_string()));
        }
        Ok(())
    }

    fn record_eft_denial(&self, account: &mut LedgerAccount, now: DateTime<Utc>) {
        account.consecutive_denied_eft += 1;
        if account.consecutive_denied_eft >= self.config.eft_lockout_threshold {
            account.eft_locked_until = Some(now + self.config.eft_lockout_ttl);
        }
    }

    fn record_eft_success(&self, account: &mut LedgerAccount) {
        account.consecutive_denied_eft = 0;
        account.eft_locked_until = None;
    }

    // ── Posting primitives ──────────────────────────────────────────────────

    fn build_postings(
        transaction_id: &str,
        debit_account: &str,
        credit_account: &str,
        amount: MinorAmount,
    ) -> Vec<Posting> {
        vec![
            Posting {
                posting_id: rgs_core::new_id(),
                transaction_id: transaction_id.to_string(),
                account_id: debit_account.to_string(),
                direction: PostingDirection::Debit,
                amount_minor: amount,
            },
            Posting {
                posting_id: rgs_core::new_id(),
                transaction_id: transaction_id.to_string(),
                account_id: credit_account.to_string(),
                direction: PostingDirection::Credit,
                amount_minor: amount,
            },
        ]
    }

    fn assert_balanced(postings: &[Posting]) -> RgsResult<()> {
        let sum: i64 = postings.iter().map(|p| p.signed_amount()).sum();
        if sum != 0 {
            return Err(RgsError::Internal("postings do not sum to zero".to_string()));
        }
        Ok(())
    }

    /// Deposit (§4.E): credits the player account from `system_settlement`.
    pub async fn deposit(&self, req: SimpleLedgerRequest) -> RgsResult<LedgerOutcome> {
        self.credit_op(req, TransactionType::Deposit, AccountType::SystemSettlement, true)
            .await
    }

    /// Withdraw (§4.E): debits the player account into `system_settlement`.
    pub async fn withdraw(&self, req: SimpleLedgerRequest) -> RgsResult<LedgerOutcome> {
        self.debit_op(req, TransactionType::Withdrawal, AccountType::SystemSettlement, true)
            .await
    }

    /// GameplayDebit (§4.E): debits the player account into `operator_liability`.
    pub async fn gameplay_debit(&self, req: SimpleLedgerRequest) -> RgsResult<LedgerOutcome> {
        self.debit_op(req, TransactionType::GameplayDebit, AccountType::OperatorLiability, false)
            .await
    }

    /// GameplayCredit (§4.E): credits the player account from `operator_liability`.
    pub async fn gameplay_credit(&self, req: SimpleLedgerRequest) -> RgsResult<LedgerOutcome> {
        self.credit_op(req, TransactionType::GameplayCredit, AccountType::OperatorLiability, false)
            .await
    }

    /// ManualAdjustment (§4.E): operator-initiated signed adjustment
    /// against `operator_liability`. A positive amount credits the
    /// account; a negative amount debits it (still bound by the
    /// non-negative balance invariant).
    pub async fn manual_adjustment(&self, req: SimpleLedgerRequest) -> RgsResult<LedgerOutcome> {
        if req.amount_minor.0 >= 0 {
            self.credit_op(req, TransactionType::ManualAdjustment, AccountType::OperatorLiability, false)
                .await
        } else {
            let magnitude = SimpleLedgerRequest {
                amount_minor: MinorAmount(-req.amount_minor.0),
                ..req
            };
            self.debit_op(magnitude, TransactionType::ManualAdjustment, AccountType::OperatorLiability, false)
                .await
        }
    }

    async fn credit_op(
        &self,
        req: SimpleLedgerRequest,
        txn_type: TransactionType,
        counterparty_type: AccountType,
        is_eft: bool,
    ) -> RgsResult<LedgerOutcome> {
        let scope = format!("ledger.{:?}", txn_type);
        let actor = req.actor.clone();
        let account_id = req.account_id.clone();
        self.with_idempotency(&scope, &req.idempotency_key, &req.request_fingerprint, || async {
            let lock = self.lock_for(&account_id);
            let _permit = lock.lock().await;
            let now = self.clock.now();

            let mut account = self.get_account(&account_id)?;
            if req.amount_minor.0 <= 0 {
                self.audit(&actor, &account_id, "invalid_amount", AuditOutcome::Invalid, Some("amount_minor must be positive".to_string()), None).await?;
                return Err(RgsError::Invalid("amount_minor must be positive".to_string()));
            }
            if account.currency != req.currency {
                self.audit(&actor, &account_id, "currency_mismatch", AuditOutcome::Invalid, Some("currency mismatch".to_string()), None).await?;
                return Err(RgsError::Invalid("currency mismatch".to_string()));
            }
            if is_eft {
                if let Err(e) = self.check_eft_lockout(&account, now) {
                    self.audit(&actor, &account_id, "eft_locked", AuditOutcome::Denied, Some(e.wire_reason()), None).await?;
                    return Err(e);
                }
            }

            let counterparty = self.get_or_create_system_account(counterparty_type, &req.currency)?;
            let txn_id = rgs_core::new_id();
            let postings = Self::build_postings(&txn_id, &counterparty.account_id, &account_id, req.amount_minor);
            Self::assert_balanced(&postings)?;

            account.available_minor = account
                .available_minor
                .checked_add(req.amount_minor)
                .ok_or_else(|| RgsError::Internal("balance overflow".to_string()))?;
            account.updated_at = now;
            if is_eft {
                self.record_eft_success(&mut account);
            }

            let txn = LedgerTransaction {
                transaction_id: txn_id,
                idempotency_key: req.idempotency_key.clone(),
                account_id: account_id.clone(),
                transaction_type: txn_type,
                status: TransactionStatus::Accepted,
                amount_minor: req.amount_minor,
                currency: req.currency.clone(),
                authorization_id: req.authorization_id.clone(),
                occurred_at: now,
                recorded_at: now,
                transferred_minor: None,
                counterparty_account_id: Some(counterparty.account_id.clone()),
            };

            let after = serde_json::to_value(&account).map_err(|e| RgsError::Internal(e.to_string()))?;
            self.audit(&actor, &txn.transaction_id, "credit", AuditOutcome::Ok, None, Some(after)).await?;

            self.put_account(&account)?;
            self.put_transaction(&txn, &postings)?;

            Ok(LedgerOutcome { transaction: txn, postings, account })
        })
        .await
    }

    async fn debit_op(
        &self,
        req: SimpleLedgerRequest,
        txn_type: TransactionType,
        counterparty_type: AccountType,
        is_eft: bool,
    ) -> RgsResult<LedgerOutcome> {
        let scope = format!("ledger.{:?}", txn_type);
        let actor = req.actor.clone();
        let account_id = req.account_id.clone();
        self.with_idempotency(&scope, &req.idempotency_key, &req.request_fingerprint, || async {
            let lock = self.lock_for(&account_id);
            let _permit = lock.lock().await;
            let now = self.clock.now();

            let mut account = self.get_account(&account_id)?;
            if req.amount_minor.0 <= 0 {
                self.audit(&actor, &account_id, "invalid_amount", AuditOutcome::Invalid, Some("amount_minor must be positive".to_string()), None).await?;
                return Err(RgsError::Invalid("amount_minor must be positive".to_string()));
            }
            if account.currency != req.currency {
                self.audit(&actor, &account_id, "currency_mismatch", AuditOutcome::Invalid, Some("currency mismatch".to_string()), None).await?;
                return Err(RgsError::Invalid("currency mismatch".to_string()));
            }
            if is_eft {
                if let Err(e) = self.check_eft_lockout(&account, now) {
                    self.audit(&actor, &account_id, "eft_locked", AuditOutcome::Denied, Some(e.wire_reason()), None).await?;
                    return Err(e);
                }
            }

            if account.available_minor.checked_sub(req.amount_minor).map_or(true, |v| v.0 < 0) {
                if is_eft {
                    self.record_eft_denial(&mut account, now);
                    self.put_account(&account)?;
                }
                self.audit(&actor, &account_id, "insufficient_funds", AuditOutcome::Denied, Some("insufficient funds".to_string()), None).await?;
                return Err(RgsError::Denied("insufficient funds".to_string()));
            }

            let counterparty = self.get_or_create_system_account(counterparty_type, &req.currency)?;
            let txn_id = rgs_core::new_id();
            let postings = Self::build_postings(&txn_id, &account_id, &counterparty.account_id, req.amount_minor);
            Self::assert_balanced(&postings)?;

            account.available_minor = account
                .available_minor
                .checked_sub(req.amount_minor)
                .ok_or_else(|| RgsError::Internal("balance underflow".to_string()))?;
            account.updated_at = now;
            if is_eft {
                self.record_eft_success(&mut account);
            }

            let txn = LedgerTransaction {
                transaction_id: txn_id,
                idempotency_key: req.idempotency_key.clone(),
                account_id: account_id.clone(),
                transaction_type: txn_type,
                status: TransactionStatus::Accepted,
                amount_minor: req.amount_minor,
                currency: req.currency.clone(),
                authorization_id: req.authorization_id.clone(),
                occurred_at: now,
                recorded_at: now,
                transferred_minor: None,
                counterparty_account_id: Some(counterparty.account_id.clone()),
            };

            let after = serde_json::to_value(&account).map_err(|e| RgsError::Internal(e.to_string()))?;
            self.audit(&actor, &txn.transaction_id, "debit", AuditOutcome::Ok, None, Some(after)).await?;

            self.put_account(&account)?;
            self.put_transaction(&txn, &postings)?;

            Ok(LedgerOutcome { transaction: txn, postings, account })
        })
        .await
    }

    /// TransferToDevice / TransferToAccount (§4.E): debits `source`,
    /// credits `destination` up to `max_destination_accept_minor` (when
    /// set). A shortfall marks the transaction `unresolved` with the
    /// residue recorded in `transferred_minor` rather than rejecting the
    /// whole transfer.
    async fn transfer(&self, req: TransferRequest, txn_type: TransactionType) -> RgsResult<LedgerOutcome> {
        let scope = format!("ledger.{:?}", txn_type);
        let actor = req.actor.clone();
        let (first, second) = if req.source_account_id <= req.destination_account_id {
            (req.source_account_id.clone(), req.destination_account_id.clone())
        } else {
            (req.destination_account_id.clone(), req.source_account_id.clone())
        };
        self.with_idempotency(&scope, &req.idempotency_key, &req.request_fingerprint, || async {
            let lock_a = self.lock_for(&first);
            let _permit_a = lock_a.lock().await;
            let lock_b = self.lock_for(&second);
            let _permit_b = if first != second { Some(lock_b.lock().await) } else { None };
            let now = self.clock.now();

            let mut source = self.get_account(&req.source_account_id)?;
            let mut destination = self.get_account(&req.destination_account_id)?;
            if req.requested_minor.0 <= 0 {
                self.audit(&actor, &req.source_account_id, "invalid_amount", AuditOutcome::Invalid, Some("requested_minor must be positive".to_string()), None).await?;
                return Err(RgsError::Invalid("requested_minor must be positive".to_string()));
            }
            if source.currency != req.currency || destination.currency != req.currency {
                self.audit(&actor, &req.source_account_id, "currency_mismatch", AuditOutcome::Invalid, Some("currency mismatch".to_string()), None).await?;
                return Err(RgsError::Invalid("currency mismatch".to_string()));
            }
            if let Err(e) = self.check_eft_lockout(&source, now) {
                self.audit(&actor, &req.source_account_id, "eft_locked", AuditOutcome::Denied, Some(e.wire_reason()), None).await?;
                return Err(e);
            }

            let transferred = match req.max_destination_accept_minor {
                Some(cap) if cap < req.requested_minor => cap,
                _ => req.requested_minor,
            };

            if source.available_minor.checked_sub(transferred).map_or(true, |v| v.0 < 0) {
                self.record_eft_denial(&mut source, now);
                self.put_account(&source)?;
                self.audit(&actor, &req.source_account_id, "insufficient_funds", AuditOutcome::Denied, Some("insufficient funds".to_string()), None).await?;
                return Err(RgsError::Denied("insufficient funds".to_string()));
            }

            let txn_id = rgs_core::new_id();
            let postings = Self::build_postings(&txn_id, &req.source_account_id, &req.destination_account_id, transferred);
            Self::assert_balanced(&postings)?;

            source.available_minor = source.available_minor.checked_sub(transferred).expect("checked above");
            source.updated_at = now;
            self.record_eft_success(&mut source);

            destination.available_minor = destination
                .available_minor
                .checked_add(transferred)
                .ok_or_else(|| RgsError::Internal("balance overflow".to_string()))?;
            destination.updated_at = now;

            let status = if transferred.0 < req.requested_minor.0 {
                TransactionStatus::Unresolved
            } else {
                TransactionStatus::Accepted
            };

            let txn = LedgerTransaction {
                transaction_id: txn_id,
                idempotency_key: req.idempotency_key.clone(),
                account_id: req.source_account_id.clone(),
                transaction_type: txn_type,
                status,
                amount_minor: req.requested_minor,
                currency: req.currency.clone(),
                authorization_id: req.authorization_id.clone(),
                occurred_at: now,
                recorded_at: now,
                transferred_minor: if status == TransactionStatus::Unresolved { Some(transferred) } else { None },
                counterparty_account_id: Some(req.destination_account_id.clone()),
            };

            let after = serde_json::to_value(&source).map_err(|e| RgsError::Internal(e.to_string()))?;
            let reason = if status == TransactionStatus::Unresolved {
                Some("partial transfer: destination could not accept the full amount".to_string())
            } else {
                None
            };
            self.audit(&actor, &txn.transaction_id, "transfer", AuditOutcome::Ok, reason, Some(after)).await?;

            self.put_account(&source)?;
            self.put_account(&destination)?;
            self.put_transaction(&txn, &postings)?;

            Ok(LedgerOutcome { transaction: txn, postings, account: source })
        })
        .await
    }

    pub async fn transfer_to_device(&self, req: TransferRequest) -> RgsResult<LedgerOutcome> {
        self.transfer(req, TransactionType::TransferToDevice).await
    }

    pub async fn transfer_to_account(&self, req: TransferRequest) -> RgsResult<LedgerOutcome> {
        self.transfer(req, TransactionType::TransferToAccount).await
    }

    /// Manual reconciliation op for an `unresolved` partial transfer
    /// (§4.E invariant 4): refunds the undelivered residue back to the
    /// source account and marks the transaction `reversed`.
    pub async fn resolve_partial_transfer(&self, actor: &Actor, transaction_id: &str) -> RgsResult<LedgerOutcome> {
        let bytes = self
            .transactions
            .get(transaction_id.as_bytes())?
            .ok_or_else(|| RgsError::Invalid("transaction not found".to_string()))?;
        let (mut txn, postings): (LedgerTransaction, Vec<Posting>) = decode(&bytes)?;
        if txn.status != TransactionStatus::Unresolved {
            return Err(RgsError::Invalid("transaction is not unresolved".to_string()));
        }
        let transferred = txn.transferred_minor.unwrap_or(MinorAmount::ZERO);
        let residue = txn
            .amount_minor
            .checked_sub(transferred)
            .ok_or_else(|| RgsError::Internal("residue underflow".to_string()))?;

        let lock = self.lock_for(&txn.account_id);
        let _permit = lock.lock().await;
        let mut source = self.get_account(&txn.account_id)?;
        source.available_minor = source
            .available_minor
            .checked_add(residue)
            .ok_or_else(|| RgsError::Internal("balance overflow".to_string()))?;
        source.updated_at = self.clock.now();

        txn.status = TransactionStatus::Reversed;
        let after = serde_json::to_value(&source).map_err(|e| RgsError::Internal(e.to_string()))?;
        self.audit(actor, transaction_id, "resolve_partial_transfer", AuditOutcome::Ok, None, Some(after)).await?;

        self.put_account(&source)?;
        self.put_transaction(&txn, &postings)?;
        Ok(LedgerOutcome { transaction: txn, postings, account: source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rgs_core::{ActorType, FakeClock};

    fn new_service() -> (Arc<LedgerService>, Arc<FakeClock>) {
        let backend = Backend::in_memory();
        let clock = Arc::new(FakeClock::new(chrono::Utc::now()));
        let audit = Arc::new(AuditChain::new(&backend, clock.clone()).unwrap());
        let service = LedgerService::new(&backend, audit, clock.clone(), LedgerConfig::default(), false).unwrap();
        (Arc::new(service), clock)
    }

    fn actor() -> Actor {
        Actor::new("operator-1", ActorType::Operator)
    }

    fn req(account_id: &str, amount: i64, key: &str) -> SimpleLedgerRequest {
        SimpleLedgerRequest {
            idempotency_key: key.to_string(),
            request_fingerprint: format!("fp-{key}"),
            account_id: account_id.to_string(),
            amount_minor: MinorAmount(amount),
            currency: Currency::new("USD"),
            authorization_id: None,
            actor: actor(),
        }
    }

    #[tokio::test]
    async fn deposit_then_withdraw_roundtrips_balance() {
        let (service, _clock) = new_service();
        let account = service
            .open_account(Some("player-1".to_string()), AccountType::PlayerCashless, Currency::new("USD"))
            .unwrap();

        let outcome = service.deposit(req(&account.account_id, 5_000, "dep-1")).await.unwrap();
        assert_eq!(outcome.account.available_minor, MinorAmount(5_000));

        let outcome = service.withdraw(req(&account.account_id, 2_000, "wd-1")).await.unwrap();
        assert_eq!(outcome.account.available_minor, MinorAmount(3_000));
    }

    #[tokio::test]
    async fn withdraw_below_zero_is_denied() {
        let (service, _clock) = new_service();
        let account = service
            .open_account(Some("player-1".to_string()), AccountType::PlayerCashless, Currency::new("USD"))
            .unwrap();

        let err = service.withdraw(req(&account.account_id, 100, "wd-1")).await.unwrap_err();
        assert_eq!(err.wire_reason(), "insufficient funds");
    }

    #[tokio::test]
    async fn postings_always_sum_to_zero() {
        let (service, _clock) = new_service();
        let account = service
            .open_account(Some("player-1".to_string()), AccountType::PlayerCashless, Currency::new("USD"))
            .unwrap();
        let outcome = service.deposit(req(&account.account_id, 1_234, "dep-1")).await.unwrap();
        let sum: i64 = outcome.postings.iter().map(|p| p.signed_amount()).sum();
        assert_eq!(sum, 0);
    }

    #[tokio::test]
    async fn same_key_and_fingerprint_replays_original_response() {
        let (service, _clock) = new_service();
        let account = service
            .open_account(Some("player-1".to_string()), AccountType::PlayerCashless, Currency::new("USD"))
            .unwrap();
        let first = service.deposit(req(&account.account_id, 500, "dep-1")).await.unwrap();
        let second = service.deposit(req(&account.account_id, 500, "dep-1")).await.unwrap();
        assert_eq!(first.transaction.transaction_id, second.transaction.transaction_id);

        let balance = service.get_balance(&account.account_id).unwrap();
        assert_eq!(balance.available_minor, MinorAmount(500));
    }

    #[tokio::test]
    async fn same_key_different_fingerprint_is_invalid() {
        let (service, _clock) = new_service();
        let account = service
            .open_account(Some("player-1".to_string()), AccountType::PlayerCashless, Currency::new("USD"))
            .unwrap();
        service.deposit(req(&account.account_id, 500, "dep-1")).await.unwrap();

        let mut second = req(&account.account_id, 500, "dep-1");
        second.request_fingerprint = "a-different-fingerprint".to_string();
        let err = service.deposit(second).await.unwrap_err();
        assert!(matches!(err, RgsError::IdempotencyFingerprintMismatch));
    }

    #[tokio::test]
    async fn repeated_eft_denials_trigger_lockout() {
        let (service, _clock) = new_service();
        let account = service
            .open_account(Some("player-1".to_string()), AccountType::PlayerCashless, Currency::new("USD"))
            .unwrap();

        for i in 0..3 {
            let _ = service.withdraw(req(&account.account_id, 100, &format!("wd-{i}"))).await;
        }
        service.deposit(req(&account.account_id, 10_000, "dep-1")).await.unwrap();
        let err = service.withdraw(req(&account.account_id, 100, "wd-after-lockout")).await.unwrap_err();
        assert_eq!(err.wire_reason(), "account locked for suspected EFT fraud");
    }

    #[tokio::test]
    async fn transfer_to_device_with_limited_capacity_is_unresolved() {
        let (service, _clock) = new_service();
        let source = service
            .open_account(Some("player-1".to_string()), AccountType::PlayerCashless, Currency::new("USD"))
            .unwrap();
        let device = service
            .open_account(None, AccountType::DeviceEscrow, Currency::new("USD"))
            .unwrap();
        service.deposit(req(&source.account_id, 10_000, "dep-1")).await.unwrap();

        let transfer_req = TransferRequest {
            idempotency_key: "xfer-1".to_string(),
            request_fingerprint: "fp-xfer-1".to_string(),
            source_account_id: source.account_id.clone(),
            destination_account_id: device.account_id.clone(),
            requested_minor: MinorAmount(5_000),
            currency: Currency::new("USD"),
            authorization_id: None,
            max_destination_accept_minor: Some(MinorAmount(2_000)),
            actor: actor(),
        };
        let outcome = service.transfer_to_device(transfer_req).await.unwrap();
        assert_eq!(outcome.transaction.status, TransactionStatus::Unresolved);
        assert_eq!(outcome.transaction.transferred_minor, Some(MinorAmount(2_000)));

        let resolved = service.resolve_partial_transfer(&actor(), &outcome.transaction.transaction_id).await.unwrap();
        assert_eq!(resolved.transaction.status, TransactionStatus::Reversed);
        let balance = service.get_balance(&source.account_id).unwrap();
        assert_eq!(balance.available_minor, MinorAmount(10_000 - 2_000));
    }

    #[tokio::test]
    async fn currency_mismatch_is_invalid() {
        let (service, _clock) = new_service();
        let account = service
            .open_account(Some("player-1".to_string()), AccountType::PlayerCashless, Currency::new("USD"))
            .unwrap();
        let mut bad = req(&account.account_id, 500, "dep-1");
        bad.currency = Currency::new("EUR");
        let err = service.deposit(bad).await.unwrap_err();
        assert_eq!(err.wire_reason(), "currency mismatch");
    }

    #[tokio::test]
    async fn expired_envelopes_are_cleaned_up_in_batches() {
        let (service, clock) = new_service();
        let account = service
            .open_account(Some("player-1".to_string()), AccountType::PlayerCashless, Currency::new("USD"))
            .unwrap();
        service.deposit(req(&account.account_id, 500, "dep-1")).await.unwrap();

        clock.advance(chrono::Duration::hours(48));
        let deleted = service.cleanup_expired_envelopes().unwrap();
        assert_eq!(deleted, 1);
    }
}
