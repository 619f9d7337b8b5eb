//! Configuration for the edge agent.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Edge reconciliation agent.
///
/// Periodically pulls the desired-state manifest from an OCI registry and
/// converges local docker-compose deployments toward it.
#[derive(Debug, Clone, Parser)]
#[command(name = "edge-agent", version)]
pub struct Config {
    /// Directory holding local deployments.
    #[arg(long, env = "EDGE_AGENT_DEPLOY_DIR", default_value = "./deploy")]
    pub deploy_dir: PathBuf,

    /// Registry reference of the desired-state artifact.
    #[arg(
        long,
        env = "EDGE_AGENT_MANIFEST_REF",
        default_value = "ghcr.io/silvanoc/poc-deploy:desired"
    )]
    pub manifest_ref: String,

    /// Seconds between reconciliation passes.
    #[arg(long, env = "EDGE_AGENT_INTERVAL", default_value_t = 3)]
    pub interval_secs: u64,

    /// docker-compose binary to invoke.
    #[arg(long, env = "EDGE_AGENT_COMPOSE_BIN", default_value = "docker-compose")]
    pub compose_bin: String,

    /// Docker daemon socket for image loads.
    #[arg(
        long,
        env = "EDGE_AGENT_DOCKER_SOCKET",
        default_value = "/var/run/docker.sock"
    )]
    pub docker_socket: PathBuf,
}

impl Config {
    /// Interval between reconciliation passes.
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}
