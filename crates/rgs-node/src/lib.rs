//! Service wiring shared by the `rgs-node` binary and its integration
//! tests: one function that turns an [`RgsConfig`] into a fully built
//! [`GatewayState`], with every background task already spawned.

pub mod config;

use std::sync::Arc;

use anyhow::Context;

use rgs_audit::AuditChain;
use rgs_changecontrol::ChangeControlService;
use rgs_core::{Clock, RealClock};
use rgs_crypto::TrustedCidrs;
use rgs_gateway::GatewayState;
use rgs_guard::RemoteAccessGuard;
use rgs_identity::IdentityService;
use rgs_ingestion::IngestionService;
use rgs_keyset::KeysetManager;
use rgs_ledger::LedgerService;
use rgs_reporting::ReportingService;
use rgs_storage::Backend;
use rgs_wagering::WageringService;

pub use config::RgsConfig;

/// Background task handles, kept alive for as long as the node runs.
/// Dropping this stops nothing by itself — the tasks are detached — but
/// holding it prevents "unused" warnings from looking like a dead task.
pub struct BackgroundTasks {
    pub keyset_reload: tokio::task::JoinHandle<()>,
    pub session_sweep: tokio::task::JoinHandle<()>,
    pub idempotency_cleanup: tokio::task::JoinHandle<()>,
}

/// Build every subsystem service on top of a fresh storage backend and
/// return the shared gateway state plus the background task handles.
pub async fn build_state(cfg: RgsConfig) -> anyhow::Result<(Arc<GatewayState>, BackgroundTasks)> {
    let backend = if cfg.strict_production {
        std::fs::create_dir_all(&cfg.data_dir).with_context(|| format!("creating data dir {}", cfg.data_dir.display()))?;
        Backend::open_durable(&cfg.data_dir).context("opening durable storage backend")?
    } else {
        Backend::in_memory()
    };

    let clock: Arc<dyn Clock> = Arc::new(RealClock);

    let keyset = KeysetManager::load(cfg.keyset, cfg.strict_production).context("loading keyset")?;
    let keyset_reload = keyset.spawn_reloader(cfg.keyset_reload_interval);

    let audit = Arc::new(AuditChain::new(&backend, Arc::clone(&clock)).context("opening audit chain")?);

    let trusted = TrustedCidrs::parse(&cfg.trusted_cidrs).context("parsing trusted_cidrs")?;
    let guard = Arc::new(RemoteAccessGuard::new(&backend, trusted, Arc::clone(&clock), cfg.guard).context("starting remote-access guard")?);

    let identity =
        Arc::new(IdentityService::new(&backend, Arc::clone(&keyset), Arc::clone(&audit), Arc::clone(&clock), cfg.identity)
            .context("starting identity service")?);
    let session_sweep = Arc::clone(&identity).spawn_session_sweeper();

    let ledger = Arc::new(
        LedgerService::new(&backend, Arc::clone(&audit), Arc::clone(&clock), cfg.ledger, cfg.strict_production)
            .context("starting ledger service")?,
    );
    let idempotency_cleanup = Arc::clone(&ledger).spawn_idempotency_cleaner();

    let wagering = Arc::new(
        WageringService::new(&backend, Arc::clone(&ledger), Arc::clone(&audit), Arc::clone(&clock))
            .context("starting wagering service")?,
    );

    let ingestion = Arc::new(
        IngestionService::new(&backend, Arc::clone(&audit), Arc::clone(&clock), cfg.ingestion).context("starting ingestion service")?,
    );

    let changecontrol = Arc::new(
        ChangeControlService::new(&backend, Arc::clone(&keyset), Arc::clone(&audit), Arc::clone(&clock), cfg.changecontrol)
            .context("starting change-control service")?,
    );

    let reporting = Arc::new(
        ReportingService::new(&backend, Arc::clone(&audit), Arc::clone(&ledger), Arc::clone(&clock))
            .context("starting reporting service")?,
    );

    let state = Arc::new(GatewayState {
        keyset,
        guard,
        audit,
        identity,
        ledger,
        wagering,
        ingestion,
        changecontrol,
        reporting,
        clock,
    });

    Ok((state, BackgroundTasks { keyset_reload, session_sweep, idempotency_cleanup }))
}
