//! Deployment lifecycle management via docker-compose.
//!
//! The orchestrator interface abstracts deployment lifecycle operations:
//! - Bringing a deployment directory's services up (idempotent)
//! - Tearing a deployment down
//! - Loading image archives into the local runtime
//!
//! The external tool is the sole source of truth for "is it running"; no
//! process state is tracked locally. A mock implementation is provided for
//! testing.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::docker::{DockerClient, DockerError};

/// File that marks a directory as an orchestrated deployment.
pub const COMPOSE_FILE: &str = "docker-compose.yaml";

/// Errors from orchestration operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {status} in {dir}")]
    NonZeroExit {
        command: String,
        status: std::process::ExitStatus,
        dir: PathBuf,
    },

    #[error("image load failed: {0}")]
    ImageLoad(#[from] DockerError),
}

/// Deployment lifecycle operations.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Ensure the deployment rooted at `dir` is running. A no-op when the
    /// orchestrator reports active services.
    async fn ensure_running(&self, dir: &Path) -> Result<(), OrchestratorError>;

    /// Bring the deployment rooted at `dir` down.
    async fn tear_down(&self, dir: &Path) -> Result<(), OrchestratorError>;

    /// Load a container image archive into the local runtime.
    async fn load_image(&self, archive: &Path) -> Result<(), OrchestratorError>;
}

/// docker-compose implementation of [`Orchestrator`].
pub struct ComposeOrchestrator {
    compose_bin: String,
    docker: DockerClient,
}

impl ComposeOrchestrator {
    /// Create a new orchestrator shelling out to `compose_bin`, with image
    /// loads going to the daemon at `docker_socket`.
    pub fn new(compose_bin: impl Into<String>, docker_socket: impl AsRef<Path>) -> Self {
        Self {
            compose_bin: compose_bin.into(),
            docker: DockerClient::new(docker_socket),
        }
    }

    async fn run_compose(&self, dir: &Path, args: &[&str]) -> Result<(), OrchestratorError> {
        let command = format!("{} {}", self.compose_bin, args.join(" "));
        debug!(command = %command, dir = %dir.display(), "running compose command");

        let status = Command::new(&self.compose_bin)
            .args(args)
            .current_dir(dir)
            .status()
            .await
            .map_err(|source| OrchestratorError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !status.success() {
            return Err(OrchestratorError::NonZeroExit {
                command,
                status,
                dir: dir.to_path_buf(),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl Orchestrator for ComposeOrchestrator {
    async fn ensure_running(&self, dir: &Path) -> Result<(), OrchestratorError> {
        let output = Command::new(&self.compose_bin)
            .args(["ps", "-q"])
            .current_dir(dir)
            .output()
            .await
            .map_err(|source| OrchestratorError::Spawn {
                command: format!("{} ps -q", self.compose_bin),
                source,
            })?;

        if !output.status.success() {
            return Err(OrchestratorError::NonZeroExit {
                command: format!("{} ps -q", self.compose_bin),
                status: output.status,
                dir: dir.to_path_buf(),
            });
        }

        // Any listed container id means the deployment is already up.
        if !output.stdout.is_empty() {
            return Ok(());
        }

        info!(dir = %dir.display(), "starting deployment");
        self.run_compose(dir, &["up", "--detach", "--remove-orphans"])
            .await
    }

    async fn tear_down(&self, dir: &Path) -> Result<(), OrchestratorError> {
        info!(dir = %dir.display(), "stopping deployment");
        self.run_compose(dir, &["down"]).await
    }

    async fn load_image(&self, archive: &Path) -> Result<(), OrchestratorError> {
        self.docker.load_image(archive).await?;
        Ok(())
    }
}

/// Recorded orchestrator call, for assertions in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorCall {
    EnsureRunning(PathBuf),
    TearDown(PathBuf),
    LoadImage(PathBuf),
}

/// Mock orchestrator for testing and development.
#[derive(Default)]
pub struct MockOrchestrator {
    calls: Mutex<Vec<OrchestratorCall>>,
    fail_ensure: bool,
}

impl MockOrchestrator {
    /// Create a mock orchestrator that records calls and always succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock orchestrator whose `ensure_running` always fails.
    pub fn failing() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_ensure: true,
        }
    }

    /// Calls recorded so far, in order.
    pub fn calls(&self) -> Vec<OrchestratorCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: OrchestratorCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Orchestrator for MockOrchestrator {
    async fn ensure_running(&self, dir: &Path) -> Result<(), OrchestratorError> {
        self.record(OrchestratorCall::EnsureRunning(dir.to_path_buf()));
        if self.fail_ensure {
            return Err(OrchestratorError::Spawn {
                command: "mock".to_string(),
                source: std::io::Error::other("mock configured to fail"),
            });
        }
        Ok(())
    }

    async fn tear_down(&self, dir: &Path) -> Result<(), OrchestratorError> {
        self.record(OrchestratorCall::TearDown(dir.to_path_buf()));
        Ok(())
    }

    async fn load_image(&self, archive: &Path) -> Result<(), OrchestratorError> {
        self.record(OrchestratorCall::LoadImage(archive.to_path_buf()));
        Ok(())
    }
}
