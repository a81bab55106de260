//! Steps 1–3 of dispatch (§4.K): allowlist, bearer verification, actor
//! match. Kept apart from the admin-path guard (§4.H, `rgs-guard`), which
//! runs afterward as step 4.

use rgs_core::{Actor, RgsError};

use crate::GatewayState;

/// Endpoints reachable with no bearer token at all (§4.K step 1).
const ALLOWLIST: &[&str] = &[
    "/healthz",
    "/v1/system/status",
    "/v1/identity/login",
    "/v1/identity/refresh",
];

pub fn is_allowlisted(path: &str) -> bool {
    ALLOWLIST.contains(&path)
}

/// An authentication-stage failure, distinguished from a handler-stage
/// denial because its wire status is fixed at 401 rather than derived
/// from `ResultCode` (§6 "missing/invalid bearer: 401").
pub struct AuthFailure {
    pub err: RgsError,
    pub http_status: u16,
}

/// Inbound request facts needed to authenticate, independent of transport.
pub struct AuthRequest<'a> {
    pub path: &'a str,
    pub bearer: Option<&'a str>,
    pub claimed_actor: &'a Actor,
}

/// Resolve the authenticated actor for `req`, or the failure that should
/// short-circuit the rest of the pipeline.
pub async fn authenticate(state: &GatewayState, req: AuthRequest<'_>) -> Result<Actor, AuthFailure> {
    if is_allowlisted(req.path) {
        return Ok(req.claimed_actor.clone());
    }

    let token = match req.bearer {
        Some(t) => t,
        None => {
            return Err(AuthFailure {
                err: RgsError::Denied("missing bearer token".to_string()),
                http_status: 401,
            });
        }
    };

    let claims = match state.keyset.verify_access_token(token) {
        Ok(c) => c,
        Err(e) => return Err(AuthFailure { err: e, http_status: 401 }),
    };

    let token_actor = Actor::new(claims.sub, claims.actor_type);
    if &token_actor != req.claimed_actor {
        return Err(AuthFailure {
            err: RgsError::Denied("actor mismatch with token".to_string()),
            http_status: 403,
        });
    }

    Ok(token_actor)
}
