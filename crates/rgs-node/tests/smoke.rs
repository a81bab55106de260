//! End-to-end smoke test for the REST front end: builds a fully wired,
//! in-memory gateway state, seeds a credential and an account directly
//! through the services, then drives `login` → `deposit` through the
//! real Axum router (no process spawned, no network socket bound).

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use rgs_core::ledger::AccountType;
use rgs_core::{Actor, ActorType};
use tower::ServiceExt;

fn test_config() -> rgs_node::RgsConfig {
    rgs_node::RgsConfig {
        strict_production: false,
        data_dir: std::path::PathBuf::from("./unused-in-memory"),
        rest_addr: "127.0.0.1:0".parse().unwrap(),
        rpc_addr: "127.0.0.1:0".parse().unwrap(),
        trusted_cidrs: vec![],
        keyset: rgs_keyset::KeysetSourceConfig::default(),
        keyset_reload_interval: std::time::Duration::from_secs(3600),
        identity: rgs_identity::IdentityConfig::default(),
        ledger: rgs_ledger::LedgerConfig::default(),
        guard: rgs_guard::GuardConfig::default(),
        changecontrol: rgs_changecontrol::ChangeControlConfig::default(),
        ingestion: rgs_ingestion::IngestionConfig::default(),
    }
}

async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn login_then_deposit_round_trips_through_the_router() {
    let (state, _background) = rgs_node::build_state(test_config()).await.expect("build state");

    let operator = Actor::new("op-1", ActorType::Operator);
    state.identity.set_credential(&operator, "op-1", "correct horse battery staple").await.expect("seed credential");

    let account = state.ledger.open_account(None, AccountType::OperatorLiability, rgs_core::Currency::new("USD")).expect("open account");

    let router = rgs_gateway::rest::router(state.clone());

    let login_body = serde_json::json!({
        "meta": {
            "request_id": "req-1",
            "actor": { "id": "op-1", "type": "operator" },
        },
        "actor_id": "op-1",
        "actor_type": "operator",
        "password": "correct horse battery staple",
    });
    let resp = router
        .clone()
        .oneshot(
            Request::post("/v1/identity/login")
                .header("content-type", "application/json")
                .body(Body::from(login_body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["meta"]["result_code"], "ok");
    let access_token = json["data"]["access_token"].as_str().expect("access_token present").to_string();

    let deposit_body = serde_json::json!({
        "meta": {
            "request_id": "req-2",
            "actor": { "id": "op-1", "type": "operator" },
        },
        "idempotency_key": "idem-1",
        "account_id": account.account_id,
        "amount_minor": 5000,
        "currency": "USD",
    });
    let resp = router
        .clone()
        .oneshot(
            Request::post("/v1/ledger/deposit")
                .header("content-type", "application/json")
                .header("authorization", format!("Bearer {access_token}"))
                .body(Body::from(deposit_body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["meta"]["result_code"], "ok");
    assert_eq!(json["data"]["transaction"]["amount_minor"], 5000);
}

#[tokio::test]
async fn deposit_without_bearer_token_is_unauthorized() {
    let (state, _background) = rgs_node::build_state(test_config()).await.expect("build state");
    let router = rgs_gateway::rest::router(state.clone());

    let body = serde_json::json!({
        "meta": {
            "request_id": "req-3",
            "actor": { "id": "op-1", "type": "operator" },
        },
        "idempotency_key": "idem-2",
        "account_id": "does-not-matter",
        "amount_minor": 100,
        "currency": "USD",
    });
    let resp = router
        .oneshot(
            Request::post("/v1/ledger/deposit")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}
