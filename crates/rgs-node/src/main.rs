//! rgs-node — the RGS backend's single-process binary.
//!
//! Startup sequence:
//!   1. Build every subsystem service on top of the chosen storage
//!      backend and spawn the long-running background tasks (§5
//!      "Scheduling model") — see [`rgs_node::build_state`].
//!   2. Start the REST and RPC transports, both delegating to
//!      `rgs_gateway::dispatch`.
//!   3. Wait for a shutdown signal and drain.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use rgs_gateway::rpc::RpcServer;
use rgs_node::config::RgsConfig;

#[derive(Parser, Debug)]
#[command(name = "rgs-node", version, about = "Remote Gaming System backend — RPC + REST, one process")]
struct Args {
    /// Override the data directory (otherwise RGS_DATA_DIR / ./rgs-data).
    #[arg(long)]
    data_dir: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,rgs=debug".parse().unwrap()))
        .init();

    let args = Args::parse();
    let mut cfg = RgsConfig::from_env();
    if let Some(dir) = args.data_dir {
        cfg.data_dir = dir;
    }
    info!(strict_production = cfg.strict_production, "rgs-node starting");

    let rest_addr = cfg.rest_addr;
    let rpc_addr = cfg.rpc_addr;

    let (state, _background) = rgs_node::build_state(cfg).await.context("building gateway state")?;

    let rest_state = Arc::clone(&state);
    let rest_task = tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(rest_addr).await.expect("binding REST listener");
        info!(%rest_addr, "REST server started");
        axum::serve(listener, rgs_gateway::rest::router(rest_state)).await.expect("REST server failure");
    });

    let rpc_handle = RpcServer::new(Arc::clone(&state)).start(rpc_addr).await.context("starting RPC server")?;

    info!("rgs-node ready");
    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown signal received, draining");

    let _ = rpc_handle.stop();
    rest_task.abort();

    Ok(())
}
