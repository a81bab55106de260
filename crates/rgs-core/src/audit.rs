use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::actor::Actor;
use crate::canonical::canonical_json;

/// Outcome recorded for an audited operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Ok,
    Denied,
    Invalid,
    Error,
}

/// The all-zero digest used as `hash_prev` for the first record of a day.
pub const ZERO_DIGEST: [u8; 32] = [0u8; 32];

/// A single append-only, hash-chained audit record (§3/§4.B).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    pub audit_id: String,
    pub occurred_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
    pub actor: Actor,
    pub object_type: String,
    pub object_id: String,
    pub action: String,
    pub before_state: Option<Value>,
    pub after_state: Option<Value>,
    pub result: AuditResult,
    pub reason: Option<String>,
    pub partition_day: NaiveDate,
    pub hash_prev: [u8; 32],
    pub hash_curr: [u8; 32],
    /// Append order within `partition_day`, assigned under the
    /// partition's append lock. `recorded_at` is only required to be
    /// non-decreasing (§2), so ties on it are common; `sequence` is the
    /// only field that reproduces true append (and therefore chain)
    /// order when listing or verifying.
    pub sequence: u64,
}

/// Everything needed to append a new audit record, before `hash_curr` is
/// computed by the audit chain from the preceding record in the partition.
pub struct AuditDraft {
    pub occurred_at: DateTime<Utc>,
    pub actor: Actor,
    pub object_type: String,
    pub object_id: String,
    pub action: String,
    pub before_state: Option<Value>,
    pub after_state: Option<Value>,
    pub result: AuditResult,
    pub reason: Option<String>,
}

impl AuditEvent {
    /// Canonical tuple hashed to produce `hash_curr`, per §4.B.
    pub fn hash_input(
        occurred_at: DateTime<Utc>,
        recorded_at: DateTime<Utc>,
        actor: &Actor,
        object_type: &str,
        object_id: &str,
        action: &str,
        before_state: &Option<Value>,
        after_state: &Option<Value>,
        result: AuditResult,
        reason: &Option<String>,
        partition_day: NaiveDate,
        hash_prev: [u8; 32],
    ) -> Vec<u8> {
        let v = json!({
            "occurred_at": occurred_at.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
            "recorded_at": recorded_at.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
            "actor_id": actor.id,
            "actor_type": actor.actor_type.as_str(),
            "object_type": object_type,
            "object_id": object_id,
            "action": action,
            "before_state": before_state,
            "after_state": after_state,
            "result": result,
            "reason": reason,
            "partition_day": partition_day.to_string(),
            "hash_prev": hex::encode(hash_prev),
        });
        canonical_json(&v)
    }

    pub fn compute_hash(
        occurred_at: DateTime<Utc>,
        recorded_at: DateTime<Utc>,
        actor: &Actor,
        object_type: &str,
        object_id: &str,
        action: &str,
        before_state: &Option<Value>,
        after_state: &Option<Value>,
        result: AuditResult,
        reason: &Option<String>,
        partition_day: NaiveDate,
        hash_prev: [u8; 32],
    ) -> [u8; 32] {
        let bytes = Self::hash_input(
            occurred_at,
            recorded_at,
            actor,
            object_type,
            object_id,
            action,
            before_state,
            after_state,
            result,
            reason,
            partition_day,
            hash_prev,
        );
        *blake3::hash(&bytes).as_bytes()
    }

    /// Recompute this record's `hash_curr` from its own fields, for `Verify`.
    pub fn recompute_hash(&self) -> [u8; 32] {
        Self::compute_hash(
            self.occurred_at,
            self.recorded_at,
            &self.actor,
            &self.object_type,
            &self.object_id,
            &self.action,
            &self.before_state,
            &self.after_state,
            self.result,
            &self.reason,
            self.partition_day,
            self.hash_prev,
        )
    }
}
