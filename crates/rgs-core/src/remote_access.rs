use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One admin-path access attempt, allowed or denied by the remote-access
/// guard (§3, §4.H). Every admin-classified request produces exactly one
/// of these, whether or not it was allowed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteAccessActivity {
    pub activity_id: String,
    pub occurred_at: DateTime<Utc>,
    pub source_ip: String,
    pub source_port: Option<u16>,
    pub destination_host: Option<String>,
    pub destination_port: Option<u16>,
    pub path: String,
    pub method: String,
    pub allowed: bool,
    pub reason: Option<String>,
}
