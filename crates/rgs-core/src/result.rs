use serde::{Deserialize, Serialize};

use crate::actor::Actor;

/// Wire-level outcome of a request, shared by both transports (§6).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    Ok,
    Denied,
    Invalid,
    Error,
}

impl ResultCode {
    /// HTTP status for the REST transport (§6 "Result codes" table).
    pub fn http_status(&self) -> u16 {
        match self {
            ResultCode::Ok => 200,
            ResultCode::Denied => 403,
            ResultCode::Invalid => 400,
            ResultCode::Error => 500,
        }
    }
}

/// The source context a caller asserts for a request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RequestSource {
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub geo: Option<String>,
}

/// Envelope every inbound request carries (§6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestMeta {
    pub request_id: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub actor: Actor,
    #[serde(default)]
    pub source: RequestSource,
}

/// Envelope every response echoes back (§6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub request_id: String,
    pub result_code: ResultCode,
    #[serde(default)]
    pub denial_reason: Option<String>,
    pub server_time: chrono::DateTime<chrono::Utc>,
}

impl ResponseMeta {
    pub fn ok(request_id: impl Into<String>, server_time: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            request_id: request_id.into(),
            result_code: ResultCode::Ok,
            denial_reason: None,
            server_time,
        }
    }

    pub fn from_error(
        request_id: impl Into<String>,
        server_time: chrono::DateTime<chrono::Utc>,
        err: &crate::error::RgsError,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            result_code: err.result_code(),
            denial_reason: Some(err.wire_reason()),
            server_time,
        }
    }
}
