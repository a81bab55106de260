//! Credential and session management (component D): login, rotating
//! refresh sessions, logout, and the operator-facing credential/lockout
//! administration operations (§3, §4.D).
//!
//! Every denial path — lockout, rate limit, bad credential, expired or
//! revoked token, actor mismatch — is audited before the error is
//! returned to the caller, same as every other subsystem in this
//! workspace.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rgs_audit::AuditChain;
use rgs_core::audit::{AuditDraft, AuditResult};
use rgs_core::identity::{Credential, Lockout, RefreshSession};
use rgs_core::{Actor, ActorType, Clock, RgsError, RgsResult};
use rgs_keyset::KeysetManager;
use rgs_storage::{decode, encode, Backend, KvTree};
use tracing::warn;

/// Tunables for the login lockout and rate-limit guards (§4.D).
#[derive(Clone, Debug)]
pub struct IdentityConfig {
    /// Consecutive credential failures before an actor is locked out.
    pub lockout_threshold: u32,
    /// Duration a lockout holds once triggered.
    pub lockout_ttl: ChronoDuration,
    /// Max login attempts (success or failure) allowed in `rate_limit_window`.
    pub rate_limit_max: usize,
    pub rate_limit_window: ChronoDuration,
    pub access_token_ttl: ChronoDuration,
    pub refresh_token_ttl: ChronoDuration,
    pub session_sweep_interval: std::time::Duration,
    pub session_sweep_batch: usize,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            lockout_threshold: 5,
            lockout_ttl: ChronoDuration::minutes(15),
            rate_limit_max: 10,
            rate_limit_window: ChronoDuration::minutes(1),
            access_token_ttl: ChronoDuration::minutes(15),
            refresh_token_ttl: ChronoDuration::days(14),
            session_sweep_interval: std::time::Duration::from_secs(300),
            session_sweep_batch: 500,
        }
    }
}

/// Result of a successful `Login` or `RefreshToken` call.
#[derive(Clone, Debug)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

pub struct IdentityService {
    credentials: Arc<dyn KvTree>,
    lockouts: Arc<dyn KvTree>,
    sessions: Arc<dyn KvTree>,
    keyset: Arc<KeysetManager>,
    audit: Arc<AuditChain>,
    clock: Arc<dyn Clock>,
    config: IdentityConfig,
}

impl IdentityService {
    pub fn new(
        backend: &Backend,
        keyset: Arc<KeysetManager>,
        audit: Arc<AuditChain>,
        clock: Arc<dyn Clock>,
        config: IdentityConfig,
    ) -> RgsResult<Self> {
        Ok(Self {
            credentials: backend.open_tree("identity_credentials")?,
            lockouts: backend.open_tree("identity_lockouts")?,
            sessions: backend.open_tree("identity_sessions")?,
            keyset,
            audit,
            clock,
            config,
        })
    }

    fn get_credential(&self, actor_id: &str) -> RgsResult<Option<Credential>> {
        match self.credentials.get(actor_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_credential(&self, cred: &Credential) -> RgsResult<()> {
        self.credentials
            .insert(cred.actor_id.as_bytes(), encode(cred)?)
            .map_err(RgsError::from)
    }

    fn get_lockout(&self, actor_id: &str) -> RgsResult<Lockout> {
        match self.lockouts.get(actor_id.as_bytes())? {
            Some(bytes) => Ok(decode(&bytes)?),
            None => Ok(Lockout::fresh(actor_id)),
        }
    }

    fn put_lockout(&self, lockout: &Lockout) -> RgsResult<()> {
        self.lockouts
            .insert(lockout.actor_id.as_bytes(), encode(lockout)?)
            .map_err(RgsError::from)
    }

    fn get_session(&self, refresh_token: &str) -> RgsResult<Option<RefreshSession>> {
        match self.sessions.get(refresh_token.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_session(&self, session: &RefreshSession) -> RgsResult<()> {
        self.sessions
            .insert(session.refresh_token.as_bytes(), encode(session)?)
            .map_err(RgsError::from)
    }

    async fn audit_denial(&self, actor: &Actor, action: &str, reason: &str) -> RgsResult<()> {
        let now = self.clock.now();
        self.audit
            .append(
                now.date_naive(),
                AuditDraft {
                    occurred_at: now,
                    actor: actor.clone(),
                    object_type: "identity_session".to_string(),
                    object_id: actor.id.clone(),
                    action: action.to_string(),
                    before_state: None,
                    after_state: None,
                    result: AuditResult::Denied,
                    reason: Some(reason.to_string()),
                },
            )
            .await
            .map(|_| ())
            .map_err(|e| RgsError::AuditUnavailable(e.to_string()))
    }

    async fn audit_ok(
        &self,
        actor: &Actor,
        action: &str,
        object_id: &str,
        after_state: Option<serde_json::Value>,
    ) -> RgsResult<()> {
        let now = self.clock.now();
        self.audit
            .append(
                now.date_naive(),
                AuditDraft {
                    occurred_at: now,
                    actor: actor.clone(),
                    object_type: "identity_session".to_string(),
                    object_id: object_id.to_string(),
                    action: action.to_string(),
                    before_state: None,
                    after_state,
                    result: AuditResult::Ok,
                    reason: None,
                },
            )
            .await
            .map(|_| ())
            .map_err(|e| RgsError::AuditUnavailable(e.to_string()))
    }

    fn mint_pair(&self, actor_id: &str, actor_type: ActorType, now: DateTime<Utc>) -> RgsResult<TokenPair> {
        let access_token =
            self.keyset
                .mint_access_token(actor_id, actor_type, now, self.config.access_token_ttl)?;
        let refresh_token = rgs_core::new_opaque_token();
        let refresh_expires_at = now + self.config.refresh_token_ttl;
        let session = RefreshSession {
            refresh_token: refresh_token.clone(),
            actor_id: actor_id.to_string(),
            actor_type,
            created_at: now,
            expires_at: refresh_expires_at,
            revoked: false,
        };
        self.put_session(&session)?;
        Ok(TokenPair {
            access_token,
            refresh_token,
            access_expires_at: now + self.config.access_token_ttl,
            refresh_expires_at,
        })
    }

    /// `Login` (§4.D): rate-limited, lockout-guarded password check.
    pub async fn login(
        &self,
        actor_id: &str,
        actor_type: ActorType,
        plaintext_password: &str,
    ) -> RgsResult<TokenPair> {
        let actor = Actor::new(actor_id, actor_type);
        let now = self.clock.now();
        let mut lockout = self.get_lockout(actor_id)?;

        if lockout.is_locked(now) {
            self.audit_denial(&actor, "login", "locked out").await?;
            return Err(RgsError::Denied("locked out".to_string()));
        }

        lockout.recent_attempts.retain(|t| now - *t < self.config.rate_limit_window);
        if lockout.recent_attempts.len() >= self.config.rate_limit_max {
            self.audit_denial(&actor, "login", "rate limit exceeded").await?;
            return Err(RgsError::Denied("rate limit exceeded".to_string()));
        }
        lockout.recent_attempts.push(now);

        let credential = match self.get_credential(actor_id)? {
            Some(c) => c,
            None => {
                self.put_lockout(&lockout)?;
                self.audit_denial(&actor, "login", "invalid credential").await?;
                return Err(RgsError::Denied("invalid credential".to_string()));
            }
        };

        if credential.disabled {
            self.put_lockout(&lockout)?;
            self.audit_denial(&actor, "login", "credential disabled").await?;
            return Err(RgsError::Denied("credential disabled".to_string()));
        }

        if !rgs_crypto::verify_password(plaintext_password, &credential.password_hash) {
            lockout.failed_attempts += 1;
            if lockout.failed_attempts >= self.config.lockout_threshold {
                lockout.locked_until = Some(now + self.config.lockout_ttl);
            }
            self.put_lockout(&lockout)?;
            self.audit_denial(&actor, "login", "invalid credential").await?;
            return Err(RgsError::Denied("invalid credential".to_string()));
        }

        lockout.failed_attempts = 0;
        lockout.locked_until = None;
        self.put_lockout(&lockout)?;

        let pair = self.mint_pair(actor_id, actor_type, now)?;
        self.audit_ok(&actor, "login", actor_id, None).await?;
        Ok(pair)
    }

    /// `RefreshToken` (§4.D): rotates the presented token — the old
    /// session is revoked in the same call that mints the replacement,
    /// so a stolen-and-replayed refresh token is usable at most once.
    pub async fn refresh_token(&self, caller_actor_id: &str, refresh_token: &str) -> RgsResult<TokenPair> {
        let now = self.clock.now();
        let session = match self.get_session(refresh_token)? {
            Some(s) => s,
            None => {
                let actor = Actor::new(caller_actor_id, ActorType::Player);
                self.audit_denial(&actor, "refresh_token", "token not found").await?;
                return Err(RgsError::Denied("token not found".to_string()));
            }
        };
        let actor = Actor::new(&session.actor_id, session.actor_type);

        if session.actor_id != caller_actor_id {
            self.audit_denial(&actor, "refresh_token", "actor mismatch with token").await?;
            return Err(RgsError::Denied("actor mismatch with token".to_string()));
        }
        if session.revoked {
            self.audit_denial(&actor, "refresh_token", "token revoked").await?;
            return Err(RgsError::Denied("token revoked".to_string()));
        }
        if now >= session.expires_at {
            self.audit_denial(&actor, "refresh_token", "token expired").await?;
            return Err(RgsError::Denied("token expired".to_string()));
        }

        let mut revoked = session.clone();
        revoked.revoked = true;
        self.put_session(&revoked)?;

        let pair = self.mint_pair(&session.actor_id, session.actor_type, now)?;
        self.audit_ok(&actor, "refresh_token", &session.actor_id, None).await?;
        Ok(pair)
    }

    /// `Logout` (§4.D): idempotent — revoking an already-revoked or
    /// unknown token is not an error.
    pub async fn logout(&self, caller_actor_id: &str, refresh_token: &str) -> RgsResult<()> {
        let actor = Actor::new(caller_actor_id, ActorType::Player);
        if let Some(mut session) = self.get_session(refresh_token)? {
            if session.actor_id != caller_actor_id {
                self.audit_denial(&actor, "logout", "actor mismatch with token").await?;
                return Err(RgsError::Denied("actor mismatch with token".to_string()));
            }
            if !session.revoked {
                session.revoked = true;
                self.put_session(&session)?;
            }
        }
        self.audit_ok(&actor, "logout", caller_actor_id, None).await?;
        Ok(())
    }

    /// `SetCredential` (§4.D): creates or replaces an actor's password hash.
    pub async fn set_credential(
        &self,
        caller: &Actor,
        target_actor_id: &str,
        plaintext_password: &str,
    ) -> RgsResult<()> {
        self.require_operator_or_service(caller, "set_credential").await?;
        let now = self.clock.now();
        let password_hash = rgs_crypto::hash_password(plaintext_password)
            .map_err(|e| RgsError::Internal(e.to_string()))?;
        let existing = self.get_credential(target_actor_id)?;
        let credential = Credential {
            actor_id: target_actor_id.to_string(),
            password_hash,
            disabled: existing.map(|c| c.disabled).unwrap_or(false),
            created_at: now,
            updated_at: now,
        };
        self.put_credential(&credential)?;
        self.audit_ok(caller, "set_credential", target_actor_id, None).await
    }

    pub async fn disable_credential(&self, caller: &Actor, target_actor_id: &str) -> RgsResult<()> {
        self.toggle_credential(caller, target_actor_id, true, "disable_credential").await
    }

    pub async fn enable_credential(&self, caller: &Actor, target_actor_id: &str) -> RgsResult<()> {
        self.toggle_credential(caller, target_actor_id, false, "enable_credential").await
    }

    async fn toggle_credential(
        &self,
        caller: &Actor,
        target_actor_id: &str,
        disabled: bool,
        action: &str,
    ) -> RgsResult<()> {
        self.require_operator_or_service(caller, action).await?;
        let mut credential = self
            .get_credential(target_actor_id)?
            .ok_or_else(|| RgsError::Invalid("no credential for actor".to_string()))?;
        credential.disabled = disabled;
        credential.updated_at = self.clock.now();
        self.put_credential(&credential)?;
        self.audit_ok(caller, action, target_actor_id, None).await
    }

    /// `GetLockout` (§4.D, operator diagnostic read).
    pub async fn get_lockout_state(&self, caller: &Actor, target_actor_id: &str) -> RgsResult<Lockout> {
        self.require_operator_or_service(caller, "get_lockout").await?;
        self.get_lockout(target_actor_id)
    }

    /// `ResetLockout` (§4.D): clears failed-attempt and lock state
    /// without touching the credential itself.
    pub async fn reset_lockout(&self, caller: &Actor, target_actor_id: &str) -> RgsResult<()> {
        self.require_operator_or_service(caller, "reset_lockout").await?;
        self.put_lockout(&Lockout::fresh(target_actor_id))?;
        self.audit_ok(caller, "reset_lockout", target_actor_id, None).await
    }

    /// `ListSessions` (supplemented): every non-expired session for an actor.
    pub fn list_sessions(&self, actor_id: &str) -> RgsResult<Vec<RefreshSession>> {
        let now = self.clock.now();
        let mut out: Vec<RefreshSession> = self
            .sessions
            .scan()?
            .into_iter()
            .map(|(_, bytes)| decode::<RefreshSession>(&bytes))
            .collect::<Result<Vec<_>, _>>()?;
        out.retain(|s| s.actor_id == actor_id && now < s.expires_at);
        out.sort_by_key(|s| s.created_at);
        Ok(out)
    }

    async fn require_operator_or_service(&self, caller: &Actor, action: &str) -> RgsResult<()> {
        if !caller.is_operator_or_service() {
            self.audit_denial(caller, action, "requires operator or service actor").await?;
            return Err(RgsError::Denied("requires operator or service actor".to_string()));
        }
        Ok(())
    }

    /// Durable-mode bootstrap invariant (§9): at least one active
    /// credential must exist before the node accepts traffic.
    pub fn has_any_active_credential(&self) -> RgsResult<bool> {
        for (_, bytes) in self.credentials.scan()? {
            let credential: Credential = decode(&bytes)?;
            if !credential.disabled {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Sweep expired sessions in bounded batches so a long-idle node
    /// doesn't accumulate an unbounded session table (§5 scheduling model).
    pub fn sweep_expired_sessions(&self) -> RgsResult<usize> {
        let now = self.clock.now();
        let mut removed = 0usize;
        for (key, bytes) in self.sessions.scan()? {
            if removed >= self.config.session_sweep_batch {
                break;
            }
            let session: RefreshSession = decode(&bytes)?;
            if now >= session.expires_at {
                self.sessions.remove(&key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Spawn the periodic session-sweep background task.
    pub fn spawn_session_sweeper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = self.config.session_sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match self.sweep_expired_sessions() {
                    Ok(n) if n > 0 => tracing::info!(removed = n, "swept expired sessions"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "session sweep failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rgs_keyset::KeysetSourceConfig;

    fn new_service() -> (Arc<IdentityService>, Arc<rgs_core::FakeClock>) {
        let backend = Backend::in_memory();
        let keyset = KeysetManager::load(KeysetSourceConfig::default(), false).unwrap();
        let clock = Arc::new(rgs_core::FakeClock::new(chrono::Utc::now()));
        let audit = Arc::new(AuditChain::new(&backend, clock.clone()).unwrap());
        let service = IdentityService::new(
            &backend,
            keyset,
            audit,
            clock.clone(),
            IdentityConfig::default(),
        )
        .unwrap();
        (Arc::new(service), clock)
    }

    async fn bootstrap_credential(service: &IdentityService, actor_id: &str, password: &str) {
        let operator = Actor::new("bootstrap", ActorType::Service);
        service
            .set_credential(&operator, actor_id, password)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn login_with_correct_password_succeeds() {
        let (service, _clock) = new_service();
        bootstrap_credential(&service, "player-1", "correct-horse").await;
        let pair = service
            .login("player-1", ActorType::Player, "correct-horse")
            .await
            .unwrap();
        assert!(!pair.access_token.is_empty());
        assert!(!pair.refresh_token.is_empty());
    }

    #[tokio::test]
    async fn login_with_wrong_password_is_denied_and_counts_toward_lockout() {
        let (service, _clock) = new_service();
        bootstrap_credential(&service, "player-1", "correct-horse").await;
        let err = service
            .login("player-1", ActorType::Player, "wrong")
            .await
            .unwrap_err();
        assert!(matches!(err, RgsError::Denied(_)));
        let lockout = service.get_lockout("player-1").unwrap();
        assert_eq!(lockout.failed_attempts, 1);
    }

    #[tokio::test]
    async fn threshold_failures_trigger_lockout_even_with_correct_password() {
        let (service, _clock) = new_service();
        bootstrap_credential(&service, "player-1", "correct-horse").await;
        for _ in 0..5 {
            let _ = service.login("player-1", ActorType::Player, "wrong").await;
        }
        let err = service
            .login("player-1", ActorType::Player, "correct-horse")
            .await
            .unwrap_err();
        assert_eq!(err.wire_reason(), "locked out");
    }

    #[tokio::test]
    async fn refresh_rotates_and_old_token_becomes_unusable() {
        let (service, _clock) = new_service();
        bootstrap_credential(&service, "player-1", "correct-horse").await;
        let pair = service
            .login("player-1", ActorType::Player, "correct-horse")
            .await
            .unwrap();

        let rotated = service
            .refresh_token("player-1", &pair.refresh_token)
            .await
            .unwrap();
        assert_ne!(rotated.refresh_token, pair.refresh_token);

        let err = service
            .refresh_token("player-1", &pair.refresh_token)
            .await
            .unwrap_err();
        assert_eq!(err.wire_reason(), "token revoked");
    }

    #[tokio::test]
    async fn refresh_with_mismatched_actor_is_denied() {
        let (service, _clock) = new_service();
        bootstrap_credential(&service, "player-1", "correct-horse").await;
        let pair = service
            .login("player-1", ActorType::Player, "correct-horse")
            .await
            .unwrap();

        let err = service
            .refresh_token("player-2", &pair.refresh_token)
            .await
            .unwrap_err();
        assert_eq!(err.wire_reason(), "actor mismatch with token");
    }

    #[tokio::test]
    async fn logout_is_idempotent() {
        let (service, _clock) = new_service();
        bootstrap_credential(&service, "player-1", "correct-horse").await;
        let pair = service
            .login("player-1", ActorType::Player, "correct-horse")
            .await
            .unwrap();

        service.logout("player-1", &pair.refresh_token).await.unwrap();
        service.logout("player-1", &pair.refresh_token).await.unwrap();
    }

    #[tokio::test]
    async fn sweep_removes_expired_sessions_only() {
        let (service, clock) = new_service();
        bootstrap_credential(&service, "player-1", "correct-horse").await;
        let pair = service
            .login("player-1", ActorType::Player, "correct-horse")
            .await
            .unwrap();

        clock.advance(chrono::Duration::days(30));
        let removed = service.sweep_expired_sessions().unwrap();
        assert_eq!(removed, 1);
        assert!(service.get_session(&pair.refresh_token).unwrap().is_none());
    }
}
