//! Margo Edge Agent
//!
//! Runs on a single host and keeps its docker-compose deployments in sync
//! with a desired-state manifest published in an OCI registry. Packages are
//! signature-verified before activation; deployments dropped from the
//! manifest are torn down and removed.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use margo_edge_agent::compose::ComposeOrchestrator;
use margo_edge_agent::config::Config;
use margo_edge_agent::registry::{Reference, RegistryClient, RegistryConfig};
use margo_edge_agent::store::DeploymentStore;
use margo_edge_agent::verify::PgpVerifier;
use margo_edge_agent::{credentials, Reconciler};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::parse();
    info!(
        deploy_dir = %config.deploy_dir.display(),
        manifest_ref = %config.manifest_ref,
        interval_secs = config.interval_secs,
        "starting edge agent"
    );

    let desired_ref = Reference::parse(&config.manifest_ref)
        .context("invalid desired-state manifest reference")?;

    let registry = RegistryClient::new(RegistryConfig {
        authorization: credentials::resolve_authorization(&desired_ref.registry),
        ..RegistryConfig::default()
    })
    .context("failed to build registry client")?;

    let store = DeploymentStore::open(&config.deploy_dir)
        .context("failed to open deployment directory")?;

    let orchestrator = Arc::new(ComposeOrchestrator::new(
        config.compose_bin.clone(),
        &config.docker_socket,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler = Reconciler::new(
        registry,
        desired_ref,
        store,
        Arc::new(PgpVerifier),
        orchestrator,
        config.reconcile_interval(),
        shutdown_rx,
    );
    let reconciler_handle = tokio::spawn(async move { reconciler.run().await });

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received interrupt, exiting gracefully");
        }
        _ = sigterm.recv() => {
            info!("received termination request, exiting gracefully");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = reconciler_handle.await;

    info!("edge agent shutdown complete");
    Ok(())
}
