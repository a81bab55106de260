use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A credential holds only a salted password hash — never the plaintext.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Credential {
    pub actor_id: String,
    pub password_hash: String,
    pub disabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-actor login lockout state (§3, §4.D).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Lockout {
    pub actor_id: String,
    pub failed_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
    /// Timestamps of recent login attempts, for the rolling rate-limit window.
    pub recent_attempts: Vec<DateTime<Utc>>,
}

impl Lockout {
    pub fn fresh(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            failed_attempts: 0,
            locked_until: None,
            recent_attempts: Vec::new(),
        }
    }

    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        matches!(self.locked_until, Some(t) if now < t)
    }
}

/// A rotating refresh session (§3, §4.D).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RefreshSession {
    pub refresh_token: String,
    pub actor_id: String,
    pub actor_type: crate::actor::ActorType,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

impl RefreshSession {
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && now < self.expires_at
    }
}
