//! Transport-agnostic dispatch (component K): the JSON-RPC and REST front
//! ends are both thin adapters over the same five-step pipeline —
//! allowlist check, bearer verification, actor-match, admin-path guard,
//! handler — so the two transports stay isomorphic by construction
//! rather than by discipline (§4.K, §6).

pub mod auth;
pub mod dispatch;
pub mod params;
pub mod rest;
pub mod rpc;

use std::sync::Arc;

use rgs_audit::AuditChain;
use rgs_changecontrol::ChangeControlService;
use rgs_core::Clock;
use rgs_guard::RemoteAccessGuard;
use rgs_identity::IdentityService;
use rgs_ingestion::IngestionService;
use rgs_keyset::KeysetManager;
use rgs_ledger::LedgerService;
use rgs_reporting::ReportingService;
use rgs_wagering::WageringService;

/// Everything a handler needs, shared across both transports.
#[derive(Clone)]
pub struct GatewayState {
    pub keyset: Arc<KeysetManager>,
    pub guard: Arc<RemoteAccessGuard>,
    pub audit: Arc<AuditChain>,
    pub identity: Arc<IdentityService>,
    pub ledger: Arc<LedgerService>,
    pub wagering: Arc<WageringService>,
    pub ingestion: Arc<IngestionService>,
    pub changecontrol: Arc<ChangeControlService>,
    pub reporting: Arc<ReportingService>,
    pub clock: Arc<dyn Clock>,
}

/// The envelope every handler result is wrapped in before it crosses the
/// wire, on both transports (§6).
#[derive(Clone, Debug, serde::Serialize)]
pub struct GatewayResponse<T: serde::Serialize> {
    pub meta: rgs_core::ResponseMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}
