//! Config and download-library change control (component I): the
//! propose→approve→apply state machine, separation-of-duties
//! enforcement, and HMAC-signed download-library activation (§4.I).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rgs_audit::AuditChain;
use rgs_core::audit::{AuditDraft, AuditResult as AuditOutcome};
use rgs_core::changecontrol::{ConfigChange, ConfigChangeStatus, DownloadAction, DownloadLibraryChange};
use rgs_core::{Actor, Clock, RgsError, RgsResult};
use rgs_crypto::hmac_sign;
use rgs_keyset::KeysetManager;
use rgs_storage::{composite_key, decode, encode, Backend, KvTree};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug)]
pub struct ChangeControlConfig {
    pub require_separation_of_duties: bool,
}

impl Default for ChangeControlConfig {
    fn default() -> Self {
        Self { require_separation_of_duties: true }
    }
}

/// Latest applied value for one `(namespace, key)` (§3 `config_current_values`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CurrentValue {
    pub value: Value,
    pub updated_at: DateTime<Utc>,
    pub applied_change_id: String,
}

#[derive(Clone, Debug)]
pub struct DownloadLibraryChangeInput {
    pub library_path: String,
    pub checksum: String,
    pub version: String,
    pub action: DownloadAction,
    pub signer_kid: Option<String>,
    pub signature: Option<String>,
}

pub struct ChangeControlService {
    config_changes: Arc<dyn KvTree>,
    config_current_values: Arc<dyn KvTree>,
    download_changes: Arc<dyn KvTree>,
    keyset: Arc<KeysetManager>,
    audit: Arc<AuditChain>,
    clock: Arc<dyn Clock>,
    config: ChangeControlConfig,
}

impl ChangeControlService {
    pub fn new(
        backend: &Backend,
        keyset: Arc<KeysetManager>,
        audit: Arc<AuditChain>,
        clock: Arc<dyn Clock>,
        config: ChangeControlConfig,
    ) -> RgsResult<Self> {
        Ok(Self {
            config_changes: backend.open_tree("config_changes")?,
            config_current_values: backend.open_tree("config_current_values")?,
            download_changes: backend.open_tree("download_library_changes")?,
            keyset,
            audit,
            clock,
            config,
        })
    }

    fn get_change(&self, change_id: &str) -> RgsResult<ConfigChange> {
        match self.config_changes.get(change_id.as_bytes())? {
            Some(bytes) => Ok(decode(&bytes)?),
            None => Err(RgsError::Invalid("config change not found".to_string())),
        }
    }

    fn put_change(&self, change: &ConfigChange) -> RgsResult<()> {
        self.config_changes
            .insert(change.change_id.as_bytes(), encode(change)?)
            .map_err(RgsError::from)
    }

    fn current_value_key(namespace: &str, key: &str) -> Vec<u8> {
        composite_key(&[namespace.as_bytes(), key.as_bytes()])
    }

    async fn audit(
        &self,
        actor: &Actor,
        object_id: &str,
        action: &str,
        result: AuditOutcome,
        reason: Option<String>,
        after_state: Option<Value>,
    ) -> RgsResult<()> {
        let now = self.clock.now();
        self.audit
            .append(
                now.date_naive(),
                AuditDraft {
                    occurred_at: now,
                    actor: actor.clone(),
                    object_type: "config_change".to_string(),
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

    /// `ProposeChange` (§4.I): opens a new history row in `proposed`.
    pub async fn propose_change(
        &self,
        actor: &Actor,
        namespace: &str,
        key: &str,
        proposed_value: Value,
        reason: String,
    ) -> RgsResult<ConfigChange> {
        let previous_value = match self.config_current_values.get(&Self::current_value_key(namespace, key))? {
            Some(bytes) => Some(decode::<CurrentValue>(&bytes)?.value),
            None => None,
        };
        let now = self.clock.now();
        let change = ConfigChange {
            change_id: rgs_core::new_id(),
            namespace: namespace.to_string(),
            key: key.to_string(),
            proposed_value,
            previous_value,
            reason,
            status: ConfigChangeStatus::Proposed,
            proposer: actor.id.clone(),
            approver: None,
            applier: None,
            created_at: now,
            approved_at: None,
            applied_at: None,
        };
        let after = serde_json::to_value(&change).map_err(|e| RgsError::Internal(e.to_string()))?;
        self.audit(actor, &change.change_id, "propose", AuditOutcome::Ok, None, Some(after)).await?;
        self.put_change(&change)?;
        Ok(change)
    }

    /// `ApproveChange` (§4.I): `proposed → approved`. When separation of
    /// duties is enforced, the approver must not be the proposer.
    pub async fn approve_change(&self, actor: &Actor, change_id: &str) -> RgsResult<ConfigChange> {
        let mut change = self.get_change(change_id)?;
        if change.status != ConfigChangeStatus::Proposed {
            return Err(RgsError::Invalid("change is not in proposed state".to_string()));
        }
        if self.config.require_separation_of_duties && actor.id == change.proposer {
            self.audit(actor, change_id, "approve", AuditOutcome::Denied, Some("approver must differ from proposer".to_string()), None).await?;
            return Err(RgsError::Denied("approver must differ from proposer".to_string()));
        }
        change.status = ConfigChangeStatus::Approved;
        change.approver = Some(actor.id.clone());
        change.approved_at = Some(self.clock.now());

        let after = serde_json::to_value(&change).map_err(|e| RgsError::Internal(e.to_string()))?;
        self.audit(actor, change_id, "approve", AuditOutcome::Ok, None, Some(after)).await?;
        self.put_change(&change)?;
        Ok(change)
    }

    /// `ApplyChange` (§4.I): `approved → applied`, writing
    /// `config_current_values` and the history row together. The
    /// applier, like the approver, must not be the proposer.
    pub async fn apply_change(&self, actor: &Actor, change_id: &str) -> RgsResult<ConfigChange> {
        let mut change = self.get_change(change_id)?;
        if change.status != ConfigChangeStatus::Approved {
            return Err(RgsError::Invalid("change is not in approved state".to_string()));
        }
        if self.config.require_separation_of_duties && actor.id == change.proposer {
            self.audit(actor, change_id, "apply", AuditOutcome::Denied, Some("applier must differ from proposer".to_string()), None).await?;
            return Err(RgsError::Denied("applier must differ from proposer".to_string()));
        }
        let now = self.clock.now();
        change.status = ConfigChangeStatus::Applied;
        change.applier = Some(actor.id.clone());
        change.applied_at = Some(now);

        let current = CurrentValue {
            value: change.proposed_value.clone(),
            updated_at: now,
            applied_change_id: change.change_id.clone(),
        };

        let after = serde_json::to_value(&change).map_err(|e| RgsError::Internal(e.to_string()))?;
        self.audit(actor, change_id, "apply", AuditOutcome::Ok, None, Some(after)).await?;

        self.config_current_values
            .insert(&Self::current_value_key(&change.namespace, &change.key), encode(&current)?)?;
        self.put_change(&change)?;
        Ok(change)
    }

    /// Reject a proposal or an approved-but-not-yet-applied change (§4.I):
    /// terminal, same as `applied`.
    pub async fn reject_change(&self, actor: &Actor, change_id: &str, reason: String) -> RgsResult<ConfigChange> {
        let mut change = self.get_change(change_id)?;
        if matches!(change.status, ConfigChangeStatus::Applied | ConfigChangeStatus::Rejected) {
            return Err(RgsError::Invalid("change is already terminal".to_string()));
        }
        change.status = ConfigChangeStatus::Rejected;

        let after = serde_json::to_value(&change).map_err(|e| RgsError::Internal(e.to_string()))?;
        self.audit(actor, change_id, "reject", AuditOutcome::Ok, Some(reason), Some(after)).await?;
        self.put_change(&change)?;
        Ok(change)
    }

    pub fn get_current_value(&self, namespace: &str, key: &str) -> RgsResult<Option<CurrentValue>> {
        match self.config_current_values.get(&Self::current_value_key(namespace, key))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn list_changes(&self, namespace: Option<&str>, key: Option<&str>) -> RgsResult<Vec<ConfigChange>> {
        let mut out = Vec::new();
        for (_, bytes) in self.config_changes.scan()? {
            let change: ConfigChange = decode(&bytes)?;
            if namespace.map_or(true, |n| change.namespace == n) && key.map_or(true, |k| change.key == k) {
                out.push(change);
            }
        }
        out.sort_by_key(|c| c.created_at);
        Ok(out)
    }

    /// Submit a download-library change (§4.I). `activate` entries must
    /// carry `signer_kid`/`signature`; the signature is verified as
    /// HMAC-SHA256 over `DownloadLibraryChange::signing_payload()` using
    /// the keyed secret identified by `signer_kid`.
    pub async fn submit_download_change(&self, actor: &Actor, input: DownloadLibraryChangeInput) -> RgsResult<DownloadLibraryChange> {
        let change = DownloadLibraryChange {
            change_id: rgs_core::new_id(),
            library_path: input.library_path,
            checksum: input.checksum,
            version: input.version,
            action: input.action,
            signer_kid: input.signer_kid,
            signature: input.signature,
            created_at: self.clock.now(),
        };

        if change.action == DownloadAction::Activate {
            let (kid, signature) = match (&change.signer_kid, &change.signature) {
                (Some(kid), Some(sig)) => (kid, sig),
                _ => {
                    self.audit(actor, &change.change_id, "submit_download_change", AuditOutcome::Invalid, Some("missing signer_kid or signature".to_string()), None).await?;
                    return Err(RgsError::Invalid("missing signer_kid or signature".to_string()));
                }
            };
            let secret = self
                .keyset
                .snapshot()
                .key_for(kid)
                .ok_or_else(|| RgsError::Invalid("unknown signer_kid".to_string()))?;
            if hmac_sign::verify_hex(&secret, change.signing_payload().as_bytes(), signature).is_err() {
                self.audit(actor, &change.change_id, "submit_download_change", AuditOutcome::Denied, Some("invalid activation signature".to_string()), None).await?;
                return Err(RgsError::Denied("invalid activation signature".to_string()));
            }
        }

        let after = serde_json::to_value(&change).map_err(|e| RgsError::Internal(e.to_string()))?;
        self.audit(actor, &change.change_id, "submit_download_change", AuditOutcome::Ok, None, Some(after)).await?;
        self.download_changes
            .insert(change.change_id.as_bytes(), encode(&change)?)?;
        Ok(change)
    }

    pub fn list_download_changes(&self, library_path: Option<&str>) -> RgsResult<Vec<DownloadLibraryChange>> {
        let mut out = Vec::new();
        for (_, bytes) in self.download_changes.scan()? {
            let change: DownloadLibraryChange = decode(&bytes)?;
            if library_path.map_or(true, |p| change.library_path == p) {
                out.push(change);
            }
        }
        out.sort_by_key(|c| c.created_at);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rgs_core::{ActorType, FakeClock};
    use rgs_keyset::KeysetSourceConfig;
    use serde_json::json;

    fn new_service() -> ChangeControlService {
        let backend = Backend::in_memory();
        let clock = Arc::new(FakeClock::new(chrono::Utc::now()));
        let audit = Arc::new(AuditChain::new(&backend, clock.clone()).unwrap());
        let keyset = KeysetManager::load(
            KeysetSourceConfig {
                inline: Some(
                    json!({"active_kid": "kid-1", "keys": {"kid-1": hex::encode("signing-secret")}}).to_string(),
                ),
                ..Default::default()
            },
            false,
        )
        .unwrap();
        ChangeControlService::new(&backend, keyset, audit, clock, ChangeControlConfig::default()).unwrap()
    }

    fn actor(id: &str) -> Actor {
        Actor::new(id, ActorType::Operator)
    }

    #[tokio::test]
    async fn full_lifecycle_applies_current_value() {
        let service = new_service();
        let change = service
            .propose_change(&actor("alice"), "wagering", "max_stake_minor", json!(500_000), "raise limit".to_string())
            .await
            .unwrap();

        service.approve_change(&actor("bob"), &change.change_id).await.unwrap();
        let applied = service.apply_change(&actor("carol"), &change.change_id).await.unwrap();
        assert_eq!(applied.status, ConfigChangeStatus::Applied);

        let current = service.get_current_value("wagering", "max_stake_minor").unwrap().unwrap();
        assert_eq!(current.value, json!(500_000));
    }

    #[tokio::test]
    async fn proposer_cannot_approve_own_change() {
        let service = new_service();
        let change = service
            .propose_change(&actor("alice"), "wagering", "max_stake_minor", json!(500_000), "raise limit".to_string())
            .await
            .unwrap();
        let err = service.approve_change(&actor("alice"), &change.change_id).await.unwrap_err();
        assert_eq!(err.wire_reason(), "approver must differ from proposer");
    }

    #[tokio::test]
    async fn proposer_cannot_apply_own_change() {
        let service = new_service();
        let change = service
            .propose_change(&actor("alice"), "wagering", "max_stake_minor", json!(500_000), "raise limit".to_string())
            .await
            .unwrap();
        service.approve_change(&actor("bob"), &change.change_id).await.unwrap();
        let err = service.apply_change(&actor("alice"), &change.change_id).await.unwrap_err();
        assert_eq!(err.wire_reason(), "applier must differ from proposer");
    }

    #[tokio::test]
    async fn rejected_change_is_terminal() {
        let service = new_service();
        let change = service
            .propose_change(&actor("alice"), "wagering", "max_stake_minor", json!(500_000), "raise limit".to_string())
            .await
            .unwrap();
        service.reject_change(&actor("bob"), &change.change_id, "not needed".to_string()).await.unwrap();
        let err = service.approve_change(&actor("bob"), &change.change_id).await.unwrap_err();
        assert!(matches!(err, RgsError::Invalid(_)));
    }

    #[tokio::test]
    async fn activation_with_valid_signature_is_accepted() {
        let service = new_service();
        let mut change = DownloadLibraryChangeInput {
            library_path: "games/blackjack.wasm".to_string(),
            checksum: "abc123".to_string(),
            version: "1.2.0".to_string(),
            action: DownloadAction::Activate,
            signer_kid: Some("kid-1".to_string()),
            signature: None,
        };
        let payload = format!("{}|{}|{}|activate", change.library_path, change.checksum, change.version);
        let signature = hmac_sign::sign_hex(b"signing-secret", payload.as_bytes()).unwrap();
        change.signature = Some(signature);

        let result = service.submit_download_change(&actor("alice"), change).await.unwrap();
        assert_eq!(result.action, DownloadAction::Activate);
    }

    #[tokio::test]
    async fn activation_missing_signature_fields_is_invalid() {
        let service = new_service();
        let change = DownloadLibraryChangeInput {
            library_path: "games/blackjack.wasm".to_string(),
            checksum: "abc123".to_string(),
            version: "1.2.0".to_string(),
            action: DownloadAction::Activate,
            signer_kid: None,
            signature: None,
        };
        let err = service.submit_download_change(&actor("alice"), change).await.unwrap_err();
        assert!(matches!(err, RgsError::Invalid(_)));
    }

    #[tokio::test]
    async fn activation_with_wrong_signature_is_denied() {
        let service = new_service();
        let change = DownloadLibraryChangeInput {
            library_path: "games/blackjack.wasm".to_string(),
            checksum: "abc123".to_string(),
            version: "1.2.0".to_string(),
            action: DownloadAction::Activate,
            signer_kid: Some("kid-1".to_string()),
            signature: Some("not-a-real-signature".to_string()),
        };
        let err = service.submit_download_change(&actor("alice"), change).await.unwrap_err();
        assert_eq!(err.wire_reason(), "invalid activation signature");
    }
}
