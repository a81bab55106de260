//! The five-step sequence of §4.K, expressed once and shared by both
//! transports: allowlist/bearer/actor-match (`auth`), admin-path guard
//! (`rgs-guard`), then the handler. A caught panic inside the handler is
//! treated the same as any other transient internal fault (§7 "Transient
//! internal").

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use rgs_core::audit::{AuditDraft, AuditResult};
use rgs_core::{Actor, RequestMeta, ResponseMeta, RgsError, RgsResult};
use rgs_guard::RequestContext;

use crate::auth::{self, AuthRequest};
use crate::{GatewayResponse, GatewayState};

/// Everything about an inbound request that is the same across both
/// transports.
pub struct InboundRequest {
    pub meta: RequestMeta,
    pub path: String,
    pub method: String,
    pub bearer: Option<String>,
}

pub struct DispatchOutcome<T> {
    pub http_status: u16,
    pub response: GatewayResponse<T>,
}

fn status_for(result_code: rgs_core::ResultCode, err: &RgsError) -> u16 {
    if matches!(err, RgsError::LoggingUnavailable(_)) {
        503
    } else {
        result_code.http_status()
    }
}

async fn audit_actor_mismatch(state: &GatewayState, claimed: &Actor, path: &str) {
    let now = state.clock.now();
    let _ = state
        .audit
        .append(
            now.date_naive(),
            AuditDraft {
                occurred_at: now,
                actor: claimed.clone(),
                object_type: "gateway_dispatch".to_string(),
                object_id: path.to_string(),
                action: "authenticate".to_string(),
                before_state: None,
                after_state: None,
                result: AuditResult::Denied,
                reason: Some("actor mismatch with token".to_string()),
            },
        )
        .await;
}

/// Run `req` through the full pipeline, invoking `handler` only once every
/// earlier step has passed. `handler` receives the authenticated actor.
pub async fn dispatch<T, F, Fut>(state: &GatewayState, req: InboundRequest, handler: F) -> DispatchOutcome<T>
where
    T: serde::Serialize,
    F: FnOnce(Actor) -> Fut,
    Fut: Future<Output = RgsResult<T>>,
{
    let now = state.clock.now();
    let request_id = req.meta.request_id.clone();

    let actor = match auth::authenticate(
        state,
        AuthRequest {
            path: &req.path,
            bearer: req.bearer.as_deref(),
            claimed_actor: &req.meta.actor,
        },
    )
    .await
    {
        Ok(actor) => actor,
        Err(failure) => {
            if failure.err.result_code() == rgs_core::ResultCode::Denied && failure.http_status == 403 {
                audit_actor_mismatch(state, &req.meta.actor, &req.path).await;
            }
            return DispatchOutcome {
                http_status: failure.http_status,
                response: GatewayResponse {
                    meta: ResponseMeta::from_error(request_id, now, &failure.err),
                    data: None,
                },
            };
        }
    };

    let guard_ctx = RequestContext {
        source_ip: req.meta.source.ip.clone().unwrap_or_default(),
        source_port: None,
        destination_host: None,
        destination_port: None,
        path: req.path.clone(),
        method: req.method.clone(),
    };
    if let Err(e) = state.guard.evaluate(guard_ctx).await {
        return DispatchOutcome {
            http_status: status_for(e.result_code(), &e),
            response: GatewayResponse {
                meta: ResponseMeta::from_error(request_id, now, &e),
                data: None,
            },
        };
    }

    let result = AssertUnwindSafe(handler(actor)).catch_unwind().await;
    match result {
        Ok(Ok(body)) => DispatchOutcome {
            http_status: 200,
            response: GatewayResponse {
                meta: ResponseMeta::ok(request_id, now),
                data: Some(body),
            },
        },
        Ok(Err(e)) => DispatchOutcome {
            http_status: status_for(e.result_code(), &e),
            response: GatewayResponse {
                meta: ResponseMeta::from_error(request_id, now, &e),
                data: None,
            },
        },
        Err(_panic) => {
            let e = RgsError::Internal("handler panicked".to_string());
            DispatchOutcome {
                http_status: status_for(e.result_code(), &e),
                response: GatewayResponse {
                    meta: ResponseMeta::from_error(request_id, now, &e),
                    data: None,
                },
            }
        }
    }
}
