//! Reconciliation loop for converging local deployments.
//!
//! The reconciler:
//! - Periodically fetches the desired-state manifest from the registry
//! - Applies each component through a fetch/verify/unpack/deploy pipeline
//! - Purges local deployments absent from the desired state
//!
//! The digest stored in a deployment's marker file is the sole idempotency
//! key: a component whose stored digest matches the digest embedded in its
//! package location is only ensured running, with no network access.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::compose::{Orchestrator, OrchestratorError, COMPOSE_FILE};
use crate::desired::{self, ComponentSpec, DesiredStateError};
use crate::extract;
use crate::registry::{BlobLocation, Reference, RegistryClient, RegistryError};
use crate::store::DeploymentStore;
use crate::verify::{PackageVerifier, VerifyError};

/// Suffix of the application descriptor inside a package.
const APP_SUFFIX: &str = ".app";

/// Suffix of container image archives inside a deployment payload.
const IMAGE_ARCHIVE_SUFFIX: &str = ".tar";

/// Errors aborting a whole reconciliation pass.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("desired state unavailable: {0}")]
    DesiredState(#[from] DesiredStateError),

    #[error("deployment store error: {0}")]
    Io(#[from] io::Error),

    #[error("reconciliation cancelled")]
    Cancelled,
}

/// Errors scoped to a single component's apply pipeline.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("package rejected: {0}")]
    Verify(#[from] VerifyError),

    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("package contains no application descriptor")]
    MissingDescriptor,

    #[error("apply cancelled")]
    Cancelled,
}

/// Reconciler for converging local deployments toward the desired state.
pub struct Reconciler {
    registry: RegistryClient,
    desired_ref: Reference,
    store: DeploymentStore,
    verifier: Arc<dyn PackageVerifier>,
    orchestrator: Arc<dyn Orchestrator>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Reconciler {
    /// Create a new reconciler with its collaborators passed explicitly.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: RegistryClient,
        desired_ref: Reference,
        store: DeploymentStore,
        verifier: Arc<dyn PackageVerifier>,
        orchestrator: Arc<dyn Orchestrator>,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            desired_ref,
            store,
            verifier,
            orchestrator,
            interval,
            shutdown,
        }
    }

    /// Run the reconciliation loop until shutdown.
    ///
    /// Passes never overlap: a tick arriving while a pass is in flight is
    /// skipped, not queued. Errors from a pass are logged and retried on the
    /// next tick.
    pub async fn run(&self) {
        info!(
            interval_secs = self.interval.as_secs(),
            manifest = %format!("{}/{}:{}", self.desired_ref.registry, self.desired_ref.repository, self.desired_ref.reference),
            "starting reconciliation loop"
        );

        let mut shutdown = self.shutdown.clone();
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.reconcile().await {
                        Ok(()) => {}
                        Err(ReconcileError::Cancelled) => {
                            info!("reconciliation pass cancelled");
                        }
                        Err(e) => {
                            error!(error = %e, "reconciliation failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Perform a single reconciliation pass.
    ///
    /// A component failure is logged and does not abort the pass; purge runs
    /// after all apply attempts regardless of their outcome. Only the
    /// desired-state fetch is fatal to the pass.
    pub async fn reconcile(&self) -> Result<(), ReconcileError> {
        self.ensure_not_cancelled()
            .map_err(|_| ReconcileError::Cancelled)?;

        debug!("starting reconciliation pass");
        let deployment = desired::fetch_desired_state(&self.registry, &self.desired_ref).await?;

        let mut allowed = HashSet::new();
        for component in &deployment.spec.deployment_profile.components {
            allowed.insert(component.name.clone());

            if let Err(e) = self.apply_component(component).await {
                error!(
                    component = %component.name,
                    error = %e,
                    "failed to apply component"
                );
            }
        }

        self.purge_stale(&allowed).await?;
        Ok(())
    }

    /// Drive one component to its desired state.
    async fn apply_component(&self, spec: &ComponentSpec) -> Result<(), ApplyError> {
        let key_location = BlobLocation::parse(&spec.properties.key_location)?;
        let package_location = BlobLocation::parse(&spec.properties.package_location)?;
        let expected_digest = package_location.digest.clone();

        let dir = self.store.component_dir(&spec.name);

        if self.store.stored_digest(&spec.name)?.as_deref() == Some(expected_digest.as_str()) {
            debug!(component = %spec.name, "deployment is up to date");
            // Still ensure it is running, e.g. after a host reboot.
            if let Err(e) = self.orchestrator.ensure_running(&dir).await {
                warn!(component = %spec.name, error = %e, "failed to start deployment");
            }
            return Ok(());
        }

        self.ensure_not_cancelled()?;
        info!(
            component = %spec.name,
            digest = %expected_digest,
            "fetching package from registry"
        );

        // Scratch area owned by this pipeline; removed on exit either way.
        let scratch = tempfile::Builder::new().prefix(&spec.name).tempdir()?;

        let keyring = self.fetch_blob(&key_location).await?;
        self.ensure_not_cancelled()?;
        let package = self.fetch_blob(&package_location).await?;

        extract::unpack_tgz(&package[..], scratch.path(), true)?;

        let descriptor = extract::find_files_with_suffix(scratch.path(), APP_SUFFIX)?
            .into_iter()
            .next()
            .ok_or(ApplyError::MissingDescriptor)?;
        let signature = PathBuf::from(format!("{}.sig", descriptor.display()));

        self.verifier
            .verify_detached(&keyring, &descriptor, &signature)?;

        // Stale container state must not coexist with the new content: tear
        // down and discard the old deployment before materializing this one.
        if self.store.has_descriptor(&spec.name, COMPOSE_FILE) {
            self.orchestrator.tear_down(&dir).await?;
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;

        let payload = File::open(&descriptor)?;
        extract::unpack_tgz(payload, &dir, true)?;

        for archive in extract::find_files_with_suffix(&dir, IMAGE_ARCHIVE_SUFFIX)? {
            self.orchestrator.load_image(&archive).await?;
        }

        // Record the digest only once the directory actually holds the
        // verified content it claims.
        self.store.write_digest(&spec.name, &expected_digest)?;
        info!(component = %spec.name, digest = %expected_digest, "component applied");

        if let Err(e) = self.orchestrator.ensure_running(&dir).await {
            warn!(component = %spec.name, error = %e, "failed to start deployment");
        }

        Ok(())
    }

    /// Remove local deployments missing from the desired state.
    async fn purge_stale(&self, allowed: &HashSet<String>) -> io::Result<()> {
        for name in self.store.list_components()? {
            if allowed.contains(&name) {
                continue;
            }

            info!(component = %name, "purging stale deployment");
            let dir = self.store.component_dir(&name);
            if let Err(e) = self.orchestrator.tear_down(&dir).await {
                warn!(component = %name, error = %e, "failed to stop stale deployment");
            }
            if let Err(e) = self.store.remove_component(&name) {
                warn!(component = %name, error = %e, "failed to remove stale deployment");
            }
        }
        Ok(())
    }

    async fn fetch_blob(&self, location: &BlobLocation) -> Result<Vec<u8>, RegistryError> {
        let client = self.registry.for_registry(&location.registry)?;
        client
            .fetch_blob(&location.repository, &location.digest)
            .await
    }

    fn ensure_not_cancelled(&self) -> Result<(), ApplyError> {
        if *self.shutdown.borrow() {
            return Err(ApplyError::Cancelled);
        }
        Ok(())
    }
}
