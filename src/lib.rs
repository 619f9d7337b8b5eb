//! Margo Edge Agent Library
//!
//! A single-node reconciliation agent: it periodically pulls a desired-state
//! manifest from an OCI registry and converges the local set of
//! docker-compose deployments toward it, verifying package signatures before
//! activation.
//!
//! ## Architecture
//!
//! - **Reconciler**: fetches the desired state and drives the per-component
//!   fetch/verify/unpack/deploy pipeline, then purges stale deployments
//! - **Registry**: OCI manifest/blob retrieval with digest verification
//! - **Verify**: detached OpenPGP signature checks against a published key ring
//! - **Compose**: deployment lifecycle via docker-compose, image loads via
//!   the Docker Engine socket
//! - **Store**: the on-disk deployment tree and its digest markers
//!
//! ## Modules
//!
//! - `registry`: OCI distribution client and reference parsing
//! - `desired`: desired-state document schema and fetcher
//! - `extract`: tolerant tgz extraction and payload discovery
//! - `verify`: signature verification
//! - `docker`: Docker Engine API over the Unix socket
//! - `compose`: orchestration interface and docker-compose implementation
//! - `store`: local deployment records
//! - `reconciler`: the control loop and per-pass algorithm

pub mod compose;
pub mod config;
pub mod credentials;
pub mod desired;
pub mod docker;
pub mod extract;
pub mod registry;
pub mod reconciler;
pub mod store;
pub mod verify;

// Re-export commonly used types
pub use compose::{ComposeOrchestrator, MockOrchestrator, Orchestrator};
pub use desired::{ApplicationDeployment, ComponentSpec};
pub use reconciler::Reconciler;
pub use registry::{BlobLocation, Reference, RegistryClient, RegistryConfig};
pub use store::DeploymentStore;
pub use verify::{PackageVerifier, PgpVerifier};
