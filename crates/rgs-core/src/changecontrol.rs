use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigChangeStatus {
    Proposed,
    Approved,
    Applied,
    Rejected,
}

/// One step in a namespace/key's propose→approve→apply history (§3, §4.I).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigChange {
    pub change_id: String,
    pub namespace: String,
    pub key: String,
    pub proposed_value: Value,
    pub previous_value: Option<Value>,
    pub reason: String,
    pub status: ConfigChangeStatus,
    pub proposer: String,
    pub approver: Option<String>,
    pub applier: Option<String>,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub applied_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadAction {
    Add,
    Update,
    Delete,
    Activate,
}

/// A download-library change (§3 `DownloadLibraryChange`). `activate`
/// entries must carry a valid `signer_kid`/`signature` pair (§4.I).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadLibraryChange {
    pub change_id: String,
    pub library_path: String,
    pub checksum: String,
    pub version: String,
    pub action: DownloadAction,
    pub signer_kid: Option<String>,
    pub signature: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DownloadAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadAction::Add => "add",
            DownloadAction::Update => "update",
            DownloadAction::Delete => "delete",
            DownloadAction::Activate => "activate",
        }
    }
}

impl DownloadLibraryChange {
    /// Canonical payload signed over for `activate` actions (§4.I):
    /// `library_path|checksum|version|action`.
    pub fn signing_payload(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.library_path,
            self.checksum,
            self.version,
            self.action.as_str()
        )
    }
}
