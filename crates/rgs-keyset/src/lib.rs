//! The keyset manager (component C): a versioned collection of HMAC-SHA256
//! signing keys, hot-reloaded from an external source, exposed through an
//! atomically-swapped snapshot (§4.C, §9).

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use rgs_core::{ActorType, RgsError};
use rgs_crypto::{Claims, TokenError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

const DEV_DEFAULT_KID: &str = "dev-default";
const DEV_DEFAULT_SECRET: &str = "rgs-dev-default-insecure-signing-key";

#[derive(Debug, Error)]
pub enum KeysetError {
    #[error("no keyset source is configured and strict_production forbids the dev default")]
    NoSourceInStrictMode,
    #[error("failed to read keyset file {0}: {1}")]
    FileRead(String, String),
    #[error("failed to run keyset command {0}: {1}")]
    CommandRun(String, String),
    #[error("failed to parse keyset document: {0}")]
    Parse(String),
    #[error("inline keyset source is forbidden in strict_production")]
    InlineForbiddenInStrictMode,
    #[error("dev default keyset is forbidden in strict_production")]
    DevDefaultForbiddenInStrictMode,
}

/// Wire format for a keyset document, whichever source it is read from:
/// `{"active_kid": "...", "keys": {"kid": "hex-secret", ...}}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct KeysetDocument {
    active_kid: String,
    keys: HashMap<String, String>,
}

/// A fully-resolved, immutable set of signing keys.
#[derive(Clone, Debug)]
pub struct KeysetSnapshot {
    pub active_kid: String,
    keys: HashMap<String, Vec<u8>>,
}

impl KeysetSnapshot {
    fn from_document(doc: KeysetDocument) -> Result<Self, KeysetError> {
        let mut keys = HashMap::new();
        for (kid, hex_secret) in doc.keys {
            let secret = hex::decode(&hex_secret).map_err(|e| KeysetError::Parse(e.to_string()))?;
            keys.insert(kid, secret);
        }
        if !keys.contains_key(&doc.active_kid) {
            return Err(KeysetError::Parse(format!(
                "active_kid {} is not present in keys",
                doc.active_kid
            )));
        }
        Ok(Self {
            active_kid: doc.active_kid,
            keys,
        })
    }

    fn dev_default() -> Self {
        let mut keys = HashMap::new();
        keys.insert(
            DEV_DEFAULT_KID.to_string(),
            DEV_DEFAULT_SECRET.as_bytes().to_vec(),
        );
        Self {
            active_kid: DEV_DEFAULT_KID.to_string(),
            keys,
        }
    }

    pub fn key_for(&self, kid: &str) -> Option<Vec<u8>> {
        self.keys.get(kid).cloned()
    }

    pub fn active_secret(&self) -> &[u8] {
        self.keys
            .get(&self.active_kid)
            .expect("active_kid is always present in a constructed snapshot")
    }
}

/// Where to load the keyset from. Precedence when more than one is
/// configured: file, then command, then inline (Open Question (i):
/// "file wins" — §9).
#[derive(Clone, Debug, Default)]
pub struct KeysetSourceConfig {
    pub file: Option<PathBuf>,
    pub command: Option<String>,
    pub inline: Option<String>,
}

fn resolve_snapshot(
    cfg: &KeysetSourceConfig,
    strict_production: bool,
) -> Result<KeysetSnapshot, KeysetError> {
    if let Some(path) = &cfg.file {
        let content = std::fs::read_to_string(path)
            .map_err(|e| KeysetError::FileRead(path.display().to_string(), e.to_string()))?;
        let doc: KeysetDocument =
            serde_json::from_str(&content).map_err(|e| KeysetError::Parse(e.to_string()))?;
        return KeysetSnapshot::from_document(doc);
    }
    if let Some(cmd) = &cfg.command {
        let output = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .output()
            .map_err(|e| KeysetError::CommandRun(cmd.clone(), e.to_string()))?;
        if !output.status.success() {
            return Err(KeysetError::CommandRun(
                cmd.clone(),
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        let doc: KeysetDocument = serde_json::from_slice(&output.stdout)
            .map_err(|e| KeysetError::Parse(e.to_string()))?;
        return KeysetSnapshot::from_document(doc);
    }
    if let Some(inline) = &cfg.inline {
        if strict_production {
            return Err(KeysetError::InlineForbiddenInStrictMode);
        }
        let doc: KeysetDocument =
            serde_json::from_str(inline).map_err(|e| KeysetError::Parse(e.to_string()))?;
        return KeysetSnapshot::from_document(doc);
    }
    if strict_production {
        return Err(KeysetError::DevDefaultForbiddenInStrictMode);
    }
    warn!("no keyset source configured — using the insecure dev default keyset");
    Ok(KeysetSnapshot::dev_default())
}

/// Holds the active snapshot behind an atomic pointer swap (§5(d)): readers
/// on the hot verification path never block a concurrent reload.
pub struct KeysetManager {
    snapshot: ArcSwap<KeysetSnapshot>,
    source: KeysetSourceConfig,
    strict_production: bool,
}

impl KeysetManager {
    pub fn load(
        source: KeysetSourceConfig,
        strict_production: bool,
    ) -> Result<Arc<Self>, KeysetError> {
        if source.file.is_none() && strict_production {
            return Err(KeysetError::NoSourceInStrictMode);
        }
        let snapshot = resolve_snapshot(&source, strict_production)?;
        Ok(Arc::new(Self {
            snapshot: ArcSwap::from_pointee(snapshot),
            source,
            strict_production,
        }))
    }

    pub fn snapshot(&self) -> arc_swap::Guard<Arc<KeysetSnapshot>> {
        self.snapshot.load()
    }

    /// Attempt one reload. On failure the last-known-good snapshot is
    /// retained and the error logged (§4.C).
    pub fn reload_once(&self) {
        match resolve_snapshot(&self.source, self.strict_production) {
            Ok(fresh) => {
                self.snapshot.store(Arc::new(fresh));
                info!("keyset reloaded");
            }
            Err(e) => warn!(error = %e, "keyset reload failed — keeping last-known-good set"),
        }
    }

    /// Spawn the periodic background reload task (§5 scheduling model).
    pub fn spawn_reloader(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                this.reload_once();
            }
        })
    }

    pub fn mint_access_token(
        &self,
        actor_id: &str,
        actor_type: ActorType,
        now: chrono::DateTime<chrono::Utc>,
        ttl: chrono::Duration,
    ) -> Result<String, RgsError> {
        let snap = self.snapshot.load();
        let claims = Claims {
            sub: actor_id.to_string(),
            actor_type,
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };
        rgs_crypto::mint_token(&snap.active_kid, snap.active_secret(), &claims)
            .map_err(|e: TokenError| RgsError::Internal(e.to_string()))
    }

    pub fn verify_access_token(&self, token: &str) -> Result<Claims, RgsError> {
        let snap = self.snapshot.load();
        rgs_crypto::verify_token(token, |kid| snap.key_for(kid))
            .map_err(|e| RgsError::Denied(format!("invalid bearer token: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_json(active: &str, kids: &[(&str, &str)]) -> String {
        let keys: HashMap<_, _> = kids
            .iter()
            .map(|(k, v)| (k.to_string(), hex::encode(v.as_bytes())))
            .collect();
        serde_json::to_string(&KeysetDocument {
            active_kid: active.to_string(),
            keys,
        })
        .unwrap()
    }

    #[test]
    fn file_wins_over_inline_when_both_configured() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("keyset.json");
        std::fs::write(&file_path, doc_json("file-kid", &[("file-kid", "file-secret")])).unwrap();

        let cfg = KeysetSourceConfig {
            file: Some(file_path),
            command: None,
            inline: Some(doc_json("inline-kid", &[("inline-kid", "inline-secret")])),
        };
        let manager = KeysetManager::load(cfg, false).unwrap();
        assert_eq!(manager.snapshot().active_kid, "file-kid");
    }

    #[test]
    fn dev_default_forbidden_in_strict_mode() {
        let cfg = KeysetSourceConfig::default();
        assert!(KeysetManager::load(cfg, true).is_err());
    }

    #[test]
    fn dev_default_allowed_outside_strict_mode() {
        let cfg = KeysetSourceConfig::default();
        let manager = KeysetManager::load(cfg, false).unwrap();
        assert_eq!(manager.snapshot().active_kid, DEV_DEFAULT_KID);
    }

    #[test]
    fn mint_then_verify_round_trips() {
        let cfg = KeysetSourceConfig::default();
        let manager = KeysetManager::load(cfg, false).unwrap();
        let now = chrono::Utc::now();
        let token = manager
            .mint_access_token("player-1", ActorType::Player, now, chrono::Duration::minutes(15))
            .unwrap();
        let claims = manager.verify_access_token(&token).unwrap();
        assert_eq!(claims.sub, "player-1");
    }

    #[test]
    fn failed_reload_keeps_last_known_good() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("keyset.json");
        std::fs::write(&file_path, doc_json("kid-a", &[("kid-a", "secret-a")])).unwrap();
        let cfg = KeysetSourceConfig {
            file: Some(file_path.clone()),
            command: None,
            inline: None,
        };
        let manager = KeysetManager::load(cfg, false).unwrap();
        std::fs::write(&file_path, "not json").unwrap();
        manager.reload_once();
        assert_eq!(manager.snapshot().active_kid, "kid-a");
    }
}
