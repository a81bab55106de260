//! Shared domain types, clock abstraction, canonical encoding and error
//! taxonomy for the RGS backend (component A, plus the data model of §3).

pub mod actor;
pub mod audit;
pub mod canonical;
pub mod changecontrol;
pub mod clock;
pub mod error;
pub mod identity;
pub mod ingestion;
pub mod ledger;
pub mod money;
pub mod remote_access;
pub mod result;
pub mod wager;

pub use actor::{Actor, ActorType};
pub use clock::{Clock, FakeClock, RealClock};
pub use error::{RgsError, RgsResult};
pub use money::{Currency, MinorAmount, Money};
pub use result::{RequestMeta, ResponseMeta, ResultCode};

/// Fingerprint a request body for idempotency comparison (§3
/// `IdempotencyEnvelope`, §4.E invariant 3). Two requests with the same
/// `(scope, key)` but different bodies must be distinguishable; a stable
/// hash of the canonical JSON encoding does that without retaining the
/// body itself.
pub fn request_fingerprint(body: &serde_json::Value) -> String {
    let bytes = canonical::canonical_json(body);
    blake3::hash(&bytes).to_hex().to_string()
}

/// Generate a fresh random id (request ids, record ids, opaque tokens).
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Generate a high-entropy opaque token (refresh tokens, etc.) — 256 bits
/// hex-encoded.
pub fn new_opaque_token() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
