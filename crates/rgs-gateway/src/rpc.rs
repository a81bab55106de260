//! JSON-RPC 2.0 front end, namespace `"rgs"`. Mirrors `rest.rs` method
//! for method: every call builds an [`InboundRequest`] from the envelope
//! the caller supplies (there being no HTTP header to carry the bearer,
//! the token travels as an explicit parameter instead) and defers to the
//! same [`dispatch::dispatch`] pipeline.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::NaiveDate;
use jsonrpsee::core::{async_trait, RpcResult};
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::server::{Server, ServerHandle};
use rgs_core::{Actor, RequestMeta};
use rgs_ledger::LedgerOutcome;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::dispatch::{dispatch, InboundRequest};
use crate::params::*;
use crate::{GatewayResponse, GatewayState};

fn inbound(meta: RequestMeta, path: &str, bearer: Option<String>) -> InboundRequest {
    InboundRequest { meta, path: path.to_string(), method: "RPC".to_string(), bearer }
}

#[rpc(server, namespace = "rgs")]
pub trait RgsApi {
    #[method(name = "login")]
    async fn login(&self, meta: RequestMeta, params: LoginParams) -> RpcResult<GatewayResponse<TokenPairView>>;

    #[method(name = "refresh")]
    async fn refresh(&self, meta: RequestMeta, params: RefreshParams) -> RpcResult<GatewayResponse<TokenPairView>>;

    #[method(name = "listSessions")]
    async fn list_sessions(&self, meta: RequestMeta, bearer: Option<String>) -> RpcResult<GatewayResponse<Vec<rgs_core::identity::RefreshSession>>>;

    #[method(name = "deposit")]
    async fn deposit(&self, meta: RequestMeta, bearer: Option<String>, params: SimpleLedgerParams) -> RpcResult<GatewayResponse<LedgerOutcome>>;

    #[method(name = "withdraw")]
    async fn withdraw(&self, meta: RequestMeta, bearer: Option<String>, params: SimpleLedgerParams) -> RpcResult<GatewayResponse<LedgerOutcome>>;

    #[method(name = "gameplayDebit")]
    async fn gameplay_debit(
        &self,
        meta: RequestMeta,
        bearer: Option<String>,
        params: SimpleLedgerParams,
    ) -> RpcResult<GatewayResponse<LedgerOutcome>>;

    #[method(name = "gameplayCredit")]
    async fn gameplay_credit(
        &self,
        meta: RequestMeta,
        bearer: Option<String>,
        params: SimpleLedgerParams,
    ) -> RpcResult<GatewayResponse<LedgerOutcome>>;

    #[method(name = "manualAdjustment")]
    async fn manual_adjustment(
        &self,
        meta: RequestMeta,
        bearer: Option<String>,
        params: SimpleLedgerParams,
    ) -> RpcResult<GatewayResponse<LedgerOutcome>>;

    #[method(name = "transferToDevice")]
    async fn transfer_to_device(
        &self,
        meta: RequestMeta,
        bearer: Option<String>,
        params: TransferParams,
    ) -> RpcResult<GatewayResponse<LedgerOutcome>>;

    #[method(name = "transferToAccount")]
    async fn transfer_to_account(
        &self,
        meta: RequestMeta,
        bearer: Option<String>,
        params: TransferParams,
    ) -> RpcResult<GatewayResponse<LedgerOutcome>>;

    #[method(name = "resolvePartialTransfer")]
    async fn resolve_partial_transfer(
        &self,
        meta: RequestMeta,
        bearer: Option<String>,
        params: TransactionIdParams,
    ) -> RpcResult<GatewayResponse<LedgerOutcome>>;

    #[method(name = "getBalance")]
    async fn get_balance(
        &self,
        meta: RequestMeta,
        bearer: Option<String>,
        account_id: String,
    ) -> RpcResult<GatewayResponse<rgs_core::ledger::LedgerAccount>>;

    #[method(name = "placeWager")]
    async fn place_wager(
        &self,
        meta: RequestMeta,
        bearer: Option<String>,
        params: PlaceWagerParams,
    ) -> RpcResult<GatewayResponse<rgs_core::wager::Wager>>;

    #[method(name = "settleWager")]
    async fn settle_wager(
        &self,
        meta: RequestMeta,
        bearer: Option<String>,
        params: SettleWagerParams,
    ) -> RpcResult<GatewayResponse<rgs_core::wager::Wager>>;

    #[method(name = "cancelWager")]
    async fn cancel_wager(
        &self,
        meta: RequestMeta,
        bearer: Option<String>,
        params: CancelWagerParams,
    ) -> RpcResult<GatewayResponse<rgs_core::wager::Wager>>;

    #[method(name = "submitEvent")]
    async fn submit_event(
        &self,
        meta: RequestMeta,
        bearer: Option<String>,
        params: SubmitIngestionParams,
    ) -> RpcResult<GatewayResponse<rgs_core::ingestion::BufferEntry>>;

    #[method(name = "generateReport")]
    async fn generate_report(
        &self,
        meta: RequestMeta,
        bearer: Option<String>,
        params: GenerateReportParams,
    ) -> RpcResult<GatewayResponse<rgs_reporting::ReportRun>>;

    #[method(name = "proposeConfigChange")]
    async fn propose_config_change(
        &self,
        meta: RequestMeta,
        bearer: Option<String>,
        params: ProposeConfigChangeParams,
    ) -> RpcResult<GatewayResponse<rgs_core::changecontrol::ConfigChange>>;

    #[method(name = "approveConfigChange")]
    async fn approve_config_change(
        &self,
        meta: RequestMeta,
        bearer: Option<String>,
        params: ChangeIdParams,
    ) -> RpcResult<GatewayResponse<rgs_core::changecontrol::ConfigChange>>;

    #[method(name = "applyConfigChange")]
    async fn apply_config_change(
        &self,
        meta: RequestMeta,
        bearer: Option<String>,
        params: ChangeIdParams,
    ) -> RpcResult<GatewayResponse<rgs_core::changecontrol::ConfigChange>>;

    #[method(name = "rejectConfigChange")]
    async fn reject_config_change(
        &self,
        meta: RequestMeta,
        bearer: Option<String>,
        params: RejectConfigChangeParams,
    ) -> RpcResult<GatewayResponse<rgs_core::changecontrol::ConfigChange>>;

    #[method(name = "verifyAuditChain")]
    async fn verify_audit_chain(
        &self,
        meta: RequestMeta,
        bearer: Option<String>,
        partition_day: NaiveDate,
    ) -> RpcResult<GatewayResponse<VerifyAuditChainView>>;
}

pub struct RpcServer {
    state: Arc<GatewayState>,
}

impl RpcServer {
    pub fn new(state: Arc<GatewayState>) -> Self {
        Self { state }
    }

    /// Start the JSON-RPC server on `addr` with permissive CORS, mirroring
    /// the REST front end. Returns a handle to stop it.
    pub async fn start(self, addr: SocketAddr) -> anyhow::Result<ServerHandle> {
        let cors = CorsLayer::new().allow_methods(Any).allow_origin(Any).allow_headers(Any);

        let server = Server::builder()
            .set_http_middleware(tower::ServiceBuilder::new().layer(cors))
            .build(addr)
            .await?;

        let module = self.into_rpc();
        let handle = server.start(module);
        info!(%addr, "RPC server started");
        Ok(handle)
    }
}

#[async_trait]
impl RgsApiServer for RpcServer {
    async fn login(&self, meta: RequestMeta, params: LoginParams) -> RpcResult<GatewayResponse<TokenPairView>> {
        let req = inbound(meta, "/v1/identity/login", None);
        let identity = self.state.identity.clone();
        let outcome = dispatch(&self.state, req, move |_actor| async move {
            identity.login(&params.actor_id, params.actor_type, &params.password).await.map(TokenPairView::from)
        })
        .await;
        Ok(outcome.response)
    }

    async fn refresh(&self, meta: RequestMeta, params: RefreshParams) -> RpcResult<GatewayResponse<TokenPairView>> {
        let caller_actor_id = meta.actor.id.clone();
        let req = inbound(meta, "/v1/identity/refresh", None);
        let identity = self.state.identity.clone();
        let outcome = dispatch(&self.state, req, move |_actor| async move {
            identity.refresh_token(&caller_actor_id, &params.refresh_token).await.map(TokenPairView::from)
        })
        .await;
        Ok(outcome.response)
    }

    async fn list_sessions(
        &self,
        meta: RequestMeta,
        bearer: Option<String>,
    ) -> RpcResult<GatewayResponse<Vec<rgs_core::identity::RefreshSession>>> {
        let actor_id = meta.actor.id.clone();
        let req = inbound(meta, "/v1/sessions/list", bearer);
        let identity = self.state.identity.clone();
        let outcome = dispatch(&self.state, req, move |_actor| async move { identity.list_sessions(&actor_id) }).await;
        Ok(outcome.response)
    }

    async fn deposit(&self, meta: RequestMeta, bearer: Option<String>, params: SimpleLedgerParams) -> RpcResult<GatewayResponse<LedgerOutcome>> {
        let req = inbound(meta, "/v1/ledger/deposit", bearer);
        let ledger = self.state.ledger.clone();
        let outcome =
            dispatch(&self.state, req, move |actor: Actor| async move { ledger.deposit(params.into_request(actor)).await }).await;
        Ok(outcome.response)
    }

    async fn withdraw(&self, meta: RequestMeta, bearer: Option<String>, params: SimpleLedgerParams) -> RpcResult<GatewayResponse<LedgerOutcome>> {
        let req = inbound(meta, "/v1/ledger/withdraw", bearer);
        let ledger = self.state.ledger.clone();
        let outcome =
            dispatch(&self.state, req, move |actor: Actor| async move { ledger.withdraw(params.into_request(actor)).await }).await;
        Ok(outcome.response)
    }

    async fn gameplay_debit(
        &self,
        meta: RequestMeta,
        bearer: Option<String>,
        params: SimpleLedgerParams,
    ) -> RpcResult<GatewayResponse<LedgerOutcome>> {
        let req = inbound(meta, "/v1/ledger/gameplay-debit", bearer);
        let ledger = self.state.ledger.clone();
        let outcome =
            dispatch(&self.state, req, move |actor: Actor| async move { ledger.gameplay_debit(params.into_request(actor)).await }).await;
        Ok(outcome.response)
    }

    async fn gameplay_credit(
        &self,
        meta: RequestMeta,
        bearer: Option<String>,
        params: SimpleLedgerParams,
    ) -> RpcResult<GatewayResponse<LedgerOutcome>> {
        let req = inbound(meta, "/v1/ledger/gameplay-credit", bearer);
        let ledger = self.state.ledger.clone();
        let outcome =
            dispatch(&self.state, req, move |actor: Actor| async move { ledger.gameplay_credit(params.into_request(actor)).await }).await;
        Ok(outcome.response)
    }

    async fn manual_adjustment(
        &self,
        meta: RequestMeta,
        bearer: Option<String>,
        params: SimpleLedgerParams,
    ) -> RpcResult<GatewayResponse<LedgerOutcome>> {
        let req = inbound(meta, "/v1/ledger/manual-adjustment", bearer);
        let ledger = self.state.ledger.clone();
        let outcome = dispatch(&self.state, req, move |actor: Actor| async move {
            ledger.manual_adjustment(params.into_request(actor)).await
        })
        .await;
        Ok(outcome.response)
    }

    async fn transfer_to_device(
        &self,
        meta: RequestMeta,
        bearer: Option<String>,
        params: TransferParams,
    ) -> RpcResult<GatewayResponse<LedgerOutcome>> {
        let req = inbound(meta, "/v1/ledger/transfer-to-device", bearer);
        let ledger = self.state.ledger.clone();
        let outcome = dispatch(&self.state, req, move |actor: Actor| async move {
            ledger.transfer_to_device(params.into_request(actor)).await
        })
        .await;
        Ok(outcome.response)
    }

    async fn transfer_to_account(
        &self,
        meta: RequestMeta,
        bearer: Option<String>,
        params: TransferParams,
    ) -> RpcResult<GatewayResponse<LedgerOutcome>> {
        let req = inbound(meta, "/v1/ledger/transfer-to-account", bearer);
        let ledger = self.state.ledger.clone();
        let outcome = dispatch(&self.state, req, move |actor: Actor| async move {
            ledger.transfer_to_account(params.into_request(actor)).await
        })
        .await;
        Ok(outcome.response)
    }

    async fn resolve_partial_transfer(
        &self,
        meta: RequestMeta,
        bearer: Option<String>,
        params: TransactionIdParams,
    ) -> RpcResult<GatewayResponse<LedgerOutcome>> {
        let req = inbound(meta, "/v1/ledger/resolve-partial-transfer", bearer);
        let ledger = self.state.ledger.clone();
        let outcome = dispatch(&self.state, req, move |actor: Actor| async move {
            ledger.resolve_partial_transfer(&actor, &params.transaction_id).await
        })
        .await;
        Ok(outcome.response)
    }

    async fn get_balance(
        &self,
        meta: RequestMeta,
        bearer: Option<String>,
        account_id: String,
    ) -> RpcResult<GatewayResponse<rgs_core::ledger::LedgerAccount>> {
        let req = inbound(meta, "/v1/ledger/balance", bearer);
        let ledger = self.state.ledger.clone();
        let outcome = dispatch(&self.state, req, move |_actor| async move { ledger.get_balance(&account_id) }).await;
        Ok(outcome.response)
    }

    async fn place_wager(
        &self,
        meta: RequestMeta,
        bearer: Option<String>,
        params: PlaceWagerParams,
    ) -> RpcResult<GatewayResponse<rgs_core::wager::Wager>> {
        let req = inbound(meta, "/v1/wagering/place", bearer);
        let wagering = self.state.wagering.clone();
        let outcome =
            dispatch(&self.state, req, move |actor: Actor| async move { wagering.place_wager(params.into_request(actor)).await }).await;
        Ok(outcome.response)
    }

    async fn settle_wager(
        &self,
        meta: RequestMeta,
        bearer: Option<String>,
        params: SettleWagerParams,
    ) -> RpcResult<GatewayResponse<rgs_core::wager::Wager>> {
        let req = inbound(meta, "/v1/wagering/settle", bearer);
        let wagering = self.state.wagering.clone();
        let outcome =
            dispatch(&self.state, req, move |actor: Actor| async move { wagering.settle_wager(params.into_request(actor)).await }).await;
        Ok(outcome.response)
    }

    async fn cancel_wager(
        &self,
        meta: RequestMeta,
        bearer: Option<String>,
        params: CancelWagerParams,
    ) -> RpcResult<GatewayResponse<rgs_core::wager::Wager>> {
        let req = inbound(meta, "/v1/wagering/cancel", bearer);
        let wagering = self.state.wagering.clone();
        let outcome =
            dispatch(&self.state, req, move |actor: Actor| async move { wagering.cancel_wager(params.into_request(actor)).await }).await;
        Ok(outcome.response)
    }

    async fn submit_event(
        &self,
        meta: RequestMeta,
        bearer: Option<String>,
        params: SubmitIngestionParams,
    ) -> RpcResult<GatewayResponse<rgs_core::ingestion::BufferEntry>> {
        let req = inbound(meta, "/v1/events/submit", bearer);
        let ingestion = self.state.ingestion.clone();
        let outcome = dispatch(&self.state, req, move |actor: Actor| async move {
            ingestion.submit(&actor, &params.boundary_id, params.record).await
        })
        .await;
        Ok(outcome.response)
    }

    async fn generate_report(
        &self,
        meta: RequestMeta,
        bearer: Option<String>,
        params: GenerateReportParams,
    ) -> RpcResult<GatewayResponse<rgs_reporting::ReportRun>> {
        let operator_id = meta.actor.id.clone();
        let req = inbound(meta, "/v1/reporting/generate", bearer);
        let reporting = self.state.reporting.clone();
        let outcome =
            dispatch(&self.state, req, move |_actor| async move { reporting.generate_report(params.into_request(operator_id)).await })
                .await;
        Ok(outcome.response)
    }

    async fn propose_config_change(
        &self,
        meta: RequestMeta,
        bearer: Option<String>,
        params: ProposeConfigChangeParams,
    ) -> RpcResult<GatewayResponse<rgs_core::changecontrol::ConfigChange>> {
        let req = inbound(meta, "/v1/config/propose", bearer);
        let changecontrol = self.state.changecontrol.clone();
        let outcome = dispatch(&self.state, req, move |actor: Actor| async move {
            changecontrol
                .propose_change(&actor, &params.namespace, &params.key, params.proposed_value, params.reason)
                .await
        })
        .await;
        Ok(outcome.response)
    }

    async fn approve_config_change(
        &self,
        meta: RequestMeta,
        bearer: Option<String>,
        params: ChangeIdParams,
    ) -> RpcResult<GatewayResponse<rgs_core::changecontrol::ConfigChange>> {
        let req = inbound(meta, "/v1/config/approve", bearer);
        let changecontrol = self.state.changecontrol.clone();
        let outcome =
            dispatch(&self.state, req, move |actor: Actor| async move { changecontrol.approve_change(&actor, &params.change_id).await })
                .await;
        Ok(outcome.response)
    }

    async fn apply_config_change(
        &self,
        meta: RequestMeta,
        bearer: Option<String>,
        params: ChangeIdParams,
    ) -> RpcResult<GatewayResponse<rgs_core::changecontrol::ConfigChange>> {
        let req = inbound(meta, "/v1/config/apply", bearer);
        let changecontrol = self.state.changecontrol.clone();
        let outcome =
            dispatch(&self.state, req, move |actor: Actor| async move { changecontrol.apply_change(&actor, &params.change_id).await })
                .await;
        Ok(outcome.response)
    }

    async fn reject_config_change(
        &self,
        meta: RequestMeta,
        bearer: Option<String>,
        params: RejectConfigChangeParams,
    ) -> RpcResult<GatewayResponse<rgs_core::changecontrol::ConfigChange>> {
        let req = inbound(meta, "/v1/config/reject", bearer);
        let changecontrol = self.state.changecontrol.clone();
        let outcome = dispatch(&self.state, req, move |actor: Actor| async move {
            changecontrol.reject_change(&actor, &params.change_id, params.reason).await
        })
        .await;
        Ok(outcome.response)
    }

    async fn verify_audit_chain(
        &self,
        meta: RequestMeta,
        bearer: Option<String>,
        partition_day: NaiveDate,
    ) -> RpcResult<GatewayResponse<VerifyAuditChainView>> {
        let req = inbound(meta, "/v1/audit/verify", bearer);
        let audit = self.state.audit.clone();
        let outcome =
            dispatch(&self.state, req, move |_actor| async move { audit.verify(partition_day).map(VerifyAuditChainView::from) }).await;
        Ok(outcome.response)
    }
}
