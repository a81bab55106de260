use thiserror::Error;

/// Taxonomy shared by every subsystem. The dispatch layer maps this
/// directly onto the wire `result_code` (§7 of the specification).
#[derive(Debug, Error)]
pub enum RgsError {
    // ── Invalid input ────────────────────────────────────────────────────────
    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("idempotency key reused with a different request fingerprint")]
    IdempotencyFingerprintMismatch,

    // ── Policy denial ────────────────────────────────────────────────────────
    #[error("denied: {0}")]
    Denied(String),

    // ── Transient internal ───────────────────────────────────────────────────
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("operation canceled")]
    Canceled,

    #[error("internal error: {0}")]
    Internal(String),

    // ── Fail-closed degradation ──────────────────────────────────────────────
    #[error("audit log unavailable: {0}")]
    AuditUnavailable(String),

    #[error("remote-access activity log unavailable: {0}")]
    LoggingUnavailable(String),
}

impl RgsError {
    /// The wire `result_code` this error maps to (§7 taxonomy).
    pub fn result_code(&self) -> crate::result::ResultCode {
        use crate::result::ResultCode;
        match self {
            RgsError::Invalid(_) | RgsError::IdempotencyFingerprintMismatch => ResultCode::Invalid,
            RgsError::Denied(_) => ResultCode::Denied,
            RgsError::Storage(_)
            | RgsError::Serialization(_)
            | RgsError::Canceled
            | RgsError::Internal(_)
            | RgsError::AuditUnavailable(_)
            | RgsError::LoggingUnavailable(_) => ResultCode::Error,
        }
    }

    /// A short, non-sensitive reason safe to place on the wire. Internal
    /// errors redact their detail to a fixed code; full context stays in
    /// the server log via `tracing`.
    pub fn wire_reason(&self) -> String {
        match self {
            RgsError::Denied(r) | RgsError::Invalid(r) => r.clone(),
            RgsError::IdempotencyFingerprintMismatch => {
                "idempotency key reused with a different request".to_string()
            }
            RgsError::Canceled => "canceled".to_string(),
            RgsError::AuditUnavailable(_) => "audit log unavailable".to_string(),
            RgsError::LoggingUnavailable(_) => "logging unavailable".to_string(),
            RgsError::Storage(_) | RgsError::Serialization(_) | RgsError::Internal(_) => {
                "internal error".to_string()
            }
        }
    }
}

pub type RgsResult<T> = Result<T, RgsError>;
