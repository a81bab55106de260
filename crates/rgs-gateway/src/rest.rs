//! Axum REST front end (§6 REST path families). Every handler builds an
//! [`InboundRequest`] from the envelope the caller supplies and the path
//! it hit, then defers entirely to [`dispatch::dispatch`] — the handler
//! bodies below are the only transport-specific code in this crate.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use rgs_core::{Actor, RequestMeta};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::dispatch::{dispatch, InboundRequest};
use crate::params::*;
use crate::GatewayState;

/// Wraps a handler's params with the shared envelope every REST body
/// carries (§6 `meta`).
#[derive(Deserialize)]
struct Envelope<P> {
    meta: RequestMeta,
    #[serde(flatten)]
    params: P,
}

fn bearer_from(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn inbound(meta: RequestMeta, path: &str, method: &str, headers: &axum::http::HeaderMap) -> InboundRequest {
    InboundRequest {
        meta,
        path: path.to_string(),
        method: method.to_string(),
        bearer: bearer_from(headers),
    }
}

fn respond<T: Serialize>(outcome: crate::dispatch::DispatchOutcome<T>) -> (StatusCode, Json<crate::GatewayResponse<T>>) {
    let status = StatusCode::from_u16(outcome.http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(outcome.response))
}

#[derive(Serialize)]
struct HealthView {
    status: &'static str,
}

async fn healthz() -> Json<HealthView> {
    Json(HealthView { status: "ok" })
}

async fn login(
    State(state): State<Arc<GatewayState>>,
    headers: axum::http::HeaderMap,
    Json(body): Json<Envelope<LoginParams>>,
) -> impl axum::response::IntoResponse {
    let req = inbound(body.meta, "/v1/identity/login", "POST", &headers);
    let identity = state.identity.clone();
    let params = body.params;
    let outcome = dispatch(&state, req, move |_actor| async move {
        identity
            .login(&params.actor_id, params.actor_type, &params.password)
            .await
            .map(TokenPairView::from)
    })
    .await;
    respond(outcome)
}

async fn refresh(
    State(state): State<Arc<GatewayState>>,
    headers: axum::http::HeaderMap,
    Json(body): Json<Envelope<RefreshParams>>,
) -> impl axum::response::IntoResponse {
    let req = inbound(body.meta.clone(), "/v1/identity/refresh", "POST", &headers);
    let identity = state.identity.clone();
    let caller_actor_id = body.meta.actor.id.clone();
    let params = body.params;
    let outcome = dispatch(&state, req, move |_actor| async move {
        identity
            .refresh_token(&caller_actor_id, &params.refresh_token)
            .await
            .map(TokenPairView::from)
    })
    .await;
    respond(outcome)
}

macro_rules! ledger_handler {
    ($name:ident, $path:literal, $method:ident) => {
        async fn $name(
            State(state): State<Arc<GatewayState>>,
            headers: axum::http::HeaderMap,
            Json(body): Json<Envelope<SimpleLedgerParams>>,
        ) -> impl axum::response::IntoResponse {
            let req = inbound(body.meta, $path, "POST", &headers);
            let ledger = state.ledger.clone();
            let params = body.params;
            let outcome =
                dispatch(&state, req, move |authed: Actor| async move { ledger.$method(params.into_request(authed)).await }).await;
            respond(outcome)
        }
    };
}

ledger_handler!(deposit, "/v1/ledger/deposit", deposit);
ledger_handler!(withdraw, "/v1/ledger/withdraw", withdraw);
ledger_handler!(gameplay_debit, "/v1/ledger/gameplay-debit", gameplay_debit);
ledger_handler!(gameplay_credit, "/v1/ledger/gameplay-credit", gameplay_credit);
ledger_handler!(manual_adjustment, "/v1/ledger/manual-adjustment", manual_adjustment);

macro_rules! transfer_handler {
    ($name:ident, $path:literal, $method:ident) => {
        async fn $name(
            State(state): State<Arc<GatewayState>>,
            headers: axum::http::HeaderMap,
            Json(body): Json<Envelope<TransferParams>>,
        ) -> impl axum::response::IntoResponse {
            let req = inbound(body.meta, $path, "POST", &headers);
            let ledger = state.ledger.clone();
            let params = body.params;
            let outcome =
                dispatch(&state, req, move |authed: Actor| async move { ledger.$method(params.into_request(authed)).await }).await;
            respond(outcome)
        }
    };
}

transfer_handler!(transfer_to_device, "/v1/ledger/transfer-to-device", transfer_to_device);
transfer_handler!(transfer_to_account, "/v1/ledger/transfer-to-account", transfer_to_account);

async fn resolve_partial_transfer(
    State(state): State<Arc<GatewayState>>,
    headers: axum::http::HeaderMap,
    Json(body): Json<Envelope<TransactionIdParams>>,
) -> impl axum::response::IntoResponse {
    let req = inbound(body.meta, "/v1/ledger/resolve-partial-transfer", "POST", &headers);
    let ledger = state.ledger.clone();
    let params = body.params;
    let outcome = dispatch(&state, req, move |authed: Actor| async move {
        ledger.resolve_partial_transfer(&authed, &params.transaction_id).await
    })
    .await;
    respond(outcome)
}

#[derive(Deserialize)]
struct AccountIdParams {
    account_id: String,
}

async fn get_balance(
    State(state): State<Arc<GatewayState>>,
    headers: axum::http::HeaderMap,
    Json(body): Json<Envelope<AccountIdParams>>,
) -> impl axum::response::IntoResponse {
    let req = inbound(body.meta, "/v1/ledger/balance", "POST", &headers);
    let ledger = state.ledger.clone();
    let params = body.params;
    let outcome = dispatch(&state, req, move |_actor| async move { ledger.get_balance(&params.account_id) }).await;
    respond(outcome)
}

async fn place_wager(
    State(state): State<Arc<GatewayState>>,
    headers: axum::http::HeaderMap,
    Json(body): Json<Envelope<PlaceWagerParams>>,
) -> impl axum::response::IntoResponse {
    let req = inbound(body.meta, "/v1/wagering/place", "POST", &headers);
    let wagering = state.wagering.clone();
    let params = body.params;
    let outcome =
        dispatch(&state, req, move |authed: Actor| async move { wagering.place_wager(params.into_request(authed)).await }).await;
    respond(outcome)
}

async fn settle_wager(
    State(state): State<Arc<GatewayState>>,
    headers: axum::http::HeaderMap,
    Json(body): Json<Envelope<SettleWagerParams>>,
) -> impl axum::response::IntoResponse {
    let req = inbound(body.meta, "/v1/wagering/settle", "POST", &headers);
    let wagering = state.wagering.clone();
    let params = body.params;
    let outcome =
        dispatch(&state, req, move |authed: Actor| async move { wagering.settle_wager(params.into_request(authed)).await }).await;
    respond(outcome)
}

async fn cancel_wager(
    State(state): State<Arc<GatewayState>>,
    headers: axum::http::HeaderMap,
    Json(body): Json<Envelope<CancelWagerParams>>,
) -> impl axum::response::IntoResponse {
    let req = inbound(body.meta, "/v1/wagering/cancel", "POST", &headers);
    let wagering = state.wagering.clone();
    let params = body.params;
    let outcome =
        dispatch(&state, req, move |authed: Actor| async move { wagering.cancel_wager(params.into_request(authed)).await }).await;
    respond(outcome)
}

async fn submit_event(
    State(state): State<Arc<GatewayState>>,
    headers: axum::http::HeaderMap,
    Json(body): Json<Envelope<SubmitIngestionParams>>,
) -> impl axum::response::IntoResponse {
    let req = inbound(body.meta, "/v1/events/submit", "POST", &headers);
    let ingestion = state.ingestion.clone();
    let params = body.params;
    let outcome = dispatch(&state, req, move |authed: Actor| async move {
        ingestion.submit(&authed, &params.boundary_id, params.record).await
    })
    .await;
    respond(outcome)
}

async fn generate_report(
    State(state): State<Arc<GatewayState>>,
    headers: axum::http::HeaderMap,
    Json(body): Json<Envelope<GenerateReportParams>>,
) -> impl axum::response::IntoResponse {
    let req = inbound(body.meta.clone(), "/v1/reporting/generate", "POST", &headers);
    let reporting = state.reporting.clone();
    let operator_id = body.meta.actor.id.clone();
    let params = body.params;
    let outcome =
        dispatch(&state, req, move |_actor| async move { reporting.generate_report(params.into_request(operator_id)).await }).await;
    respond(outcome)
}

async fn propose_config_change(
    State(state): State<Arc<GatewayState>>,
    headers: axum::http::HeaderMap,
    Json(body): Json<Envelope<ProposeConfigChangeParams>>,
) -> impl axum::response::IntoResponse {
    let req = inbound(body.meta.clone(), "/v1/config/propose", "POST", &headers);
    let changecontrol = state.changecontrol.clone();
    let params = body.params;
    let outcome = dispatch(&state, req, move |actor: Actor| async move {
        changecontrol
            .propose_change(&actor, &params.namespace, &params.key, params.proposed_value, params.reason)
            .await
    })
    .await;
    respond(outcome)
}

async fn approve_config_change(
    State(state): State<Arc<GatewayState>>,
    headers: axum::http::HeaderMap,
    Json(body): Json<Envelope<ChangeIdParams>>,
) -> impl axum::response::IntoResponse {
    let req = inbound(body.meta.clone(), "/v1/config/approve", "POST", &headers);
    let changecontrol = state.changecontrol.clone();
    let params = body.params;
    let outcome = dispatch(&state, req, move |actor: Actor| async move { changecontrol.approve_change(&actor, &params.change_id).await }).await;
    respond(outcome)
}

async fn apply_config_change(
    State(state): State<Arc<GatewayState>>,
    headers: axum::http::HeaderMap,
    Json(body): Json<Envelope<ChangeIdParams>>,
) -> impl axum::response::IntoResponse {
    let req = inbound(body.meta.clone(), "/v1/config/apply", "POST", &headers);
    let changecontrol = state.changecontrol.clone();
    let params = body.params;
    let outcome = dispatch(&state, req, move |actor: Actor| async move { changecontrol.apply_change(&actor, &params.change_id).await }).await;
    respond(outcome)
}

async fn reject_config_change(
    State(state): State<Arc<GatewayState>>,
    headers: axum::http::HeaderMap,
    Json(body): Json<Envelope<RejectConfigChangeParams>>,
) -> impl axum::response::IntoResponse {
    let req = inbound(body.meta.clone(), "/v1/config/reject", "POST", &headers);
    let changecontrol = state.changecontrol.clone();
    let params = body.params;
    let outcome = dispatch(&state, req, move |actor: Actor| async move {
        changecontrol.reject_change(&actor, &params.change_id, params.reason).await
    })
    .await;
    respond(outcome)
}

async fn verify_audit_chain(
    State(state): State<Arc<GatewayState>>,
    headers: axum::http::HeaderMap,
    Json(body): Json<Envelope<VerifyAuditChainParams>>,
) -> impl axum::response::IntoResponse {
    let req = inbound(body.meta, "/v1/audit/verify", "POST", &headers);
    let audit = state.audit.clone();
    let day: NaiveDate = body.params.partition_day;
    let outcome = dispatch(&state, req, move |_actor| async move { audit.verify(day).map(VerifyAuditChainView::from) }).await;
    respond(outcome)
}

async fn list_sessions(
    State(state): State<Arc<GatewayState>>,
    headers: axum::http::HeaderMap,
    Json(body): Json<Envelope<serde_json::Value>>,
) -> impl axum::response::IntoResponse {
    let req = inbound(body.meta.clone(), "/v1/sessions/list", "POST", &headers);
    let identity = state.identity.clone();
    let actor = body.meta.actor.clone();
    let outcome = dispatch(&state, req, move |_actor| async move { identity.list_sessions(&actor.id) }).await;
    respond(outcome)
}

pub fn router(state: Arc<GatewayState>) -> Router {
    let cors = CorsLayer::new().allow_methods(Any).allow_origin(Any).allow_headers(Any);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/identity/login", post(login))
        .route("/v1/identity/refresh", post(refresh))
        .route("/v1/sessions/list", post(list_sessions))
        .route("/v1/ledger/deposit", post(deposit))
        .route("/v1/ledger/withdraw", post(withdraw))
        .route("/v1/ledger/gameplay-debit", post(gameplay_debit))
        .route("/v1/ledger/gameplay-credit", post(gameplay_credit))
        .route("/v1/ledger/manual-adjustment", post(manual_adjustment))
        .route("/v1/ledger/transfer-to-device", post(transfer_to_device))
        .route("/v1/ledger/transfer-to-account", post(transfer_to_account))
        .route("/v1/ledger/resolve-partial-transfer", post(resolve_partial_transfer))
        .route("/v1/ledger/balance", post(get_balance))
        .route("/v1/wagering/place", post(place_wager))
        .route("/v1/wagering/settle", post(settle_wager))
        .route("/v1/wagering/cancel", post(cancel_wager))
        .route("/v1/events/submit", post(submit_event))
        .route("/v1/reporting/generate", post(generate_report))
        .route("/v1/config/propose", post(propose_config_change))
        .route("/v1/config/approve", post(approve_config_change))
        .route("/v1/config/apply", post(apply_config_change))
        .route("/v1/config/reject", post(reject_config_change))
        .route("/v1/audit/verify", post(verify_audit_chain))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
