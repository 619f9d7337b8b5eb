//! Desired-state manifest schema and fetcher.
//!
//! The desired state lives in an OCI artifact: one of the artifact's layers
//! carries the Margo application-deployment document as YAML, marked by a
//! dedicated media type. The fetcher retrieves the artifact manifest, scans
//! its layers for that media type, downloads the matching blob and parses it.
//!
//! Retry is not handled here; a failed fetch surfaces to the control loop
//! and is retried on the next tick.

use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::registry::{Reference, RegistryClient, RegistryError};

/// Media type marking the layer that holds the desired-state document.
pub const DESIRED_STATE_MEDIA_TYPE: &str = "application/vnd.margo.desired-state.v1+yaml";

/// Errors from desired-state retrieval.
#[derive(Debug, Error)]
pub enum DesiredStateError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("no desired-state layer found in {0}")]
    NotFound(String),

    #[error("malformed desired-state document: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Margo application deployment document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationDeployment {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub spec: Spec,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    pub deployment_profile: DeploymentProfile,
    /// Parameters are part of the schema but not consumed by reconciliation.
    #[serde(default)]
    pub parameters: HashMap<String, Parameter>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentProfile {
    #[serde(rename = "type")]
    pub profile_type: String,
    pub components: Vec<ComponentSpec>,
}

/// One named deployable application unit.
#[derive(Debug, Clone, Deserialize)]
pub struct ComponentSpec {
    pub name: String,
    pub properties: ComponentProperties,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentProperties {
    /// Blob URL of the armored public key ring.
    pub key_location: String,
    /// Blob URL of the package; embeds the content digest that doubles as
    /// the idempotency key for local state.
    pub package_location: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Parameter {
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub targets: Vec<ParameterTarget>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParameterTarget {
    #[serde(default)]
    pub pointer: String,
    #[serde(default)]
    pub components: Vec<String>,
}

/// Fetch and parse the current desired-state document.
pub async fn fetch_desired_state(
    client: &RegistryClient,
    reference: &Reference,
) -> Result<ApplicationDeployment, DesiredStateError> {
    let client = client.for_registry(&reference.registry)?;
    let manifest = client
        .fetch_manifest(&reference.repository, &reference.reference)
        .await?;

    for layer in &manifest.layers {
        if layer.media_type != DESIRED_STATE_MEDIA_TYPE {
            continue;
        }

        debug!(digest = %layer.digest, "found desired-state layer");
        let body = client
            .fetch_blob(&reference.repository, &layer.digest)
            .await?;
        let deployment: ApplicationDeployment = serde_yaml::from_slice(&body)?;
        return Ok(deployment);
    }

    Err(DesiredStateError::NotFound(format!(
        "{}/{}:{}",
        reference.registry, reference.repository, reference.reference
    )))
}
