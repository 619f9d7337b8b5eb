//! OCI registry client for fetching manifests and content-addressed blobs.
//!
//! This module implements the read side of the OCI Distribution Specification:
//! manifest retrieval by tag or digest, and blob retrieval by digest. Blobs
//! are verified against the addressed digest after download.
//!
//! Reference: https://github.com/opencontainers/distribution-spec

use std::io;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("authentication required")]
    AuthRequired,

    #[error("invalid reference: {0}")]
    InvalidReference(String),
}

/// Configuration for the registry client.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Registry URL (e.g., "https://ghcr.io").
    pub registry_url: String,
    /// Optional `Authorization` header value (e.g., "Basic <base64>").
    pub authorization: Option<String>,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            registry_url: "https://ghcr.io".to_string(),
            authorization: None,
            request_timeout: Duration::from_secs(120),
        }
    }
}

/// OCI Distribution client.
pub struct RegistryClient {
    config: RegistryConfig,
    client: Client,
}

impl RegistryClient {
    /// Create a new registry client.
    pub fn new(config: RegistryConfig) -> Result<Self, RegistryError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;

        Ok(Self { config, client })
    }

    /// Create a client for the registry named in `registry`, carrying over
    /// auth and timeout settings. A scheme-less registry defaults to https.
    pub fn for_registry(&self, registry: &str) -> Result<Self, RegistryError> {
        let mut config = self.config.clone();
        config.registry_url = if registry.starts_with("http://") || registry.starts_with("https://")
        {
            registry.to_string()
        } else {
            format!("https://{registry}")
        };
        Self::new(config)
    }

    /// Fetch an image manifest by tag or digest.
    pub async fn fetch_manifest(
        &self,
        repo: &str,
        reference: &str,
    ) -> Result<Manifest, RegistryError> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.config.registry_url, repo, reference
        );

        debug!(url = %url, "fetching manifest");

        let mut request = self.client.get(&url).header(
            "Accept",
            "application/vnd.oci.image.manifest.v1+json, application/vnd.docker.distribution.manifest.v2+json",
        );

        if let Some(auth) = &self.config.authorization {
            request = request.header("Authorization", auth);
        }

        let response = request.send().await?;

        match response.status() {
            StatusCode::OK => {
                let body = response.bytes().await?;

                // A digest reference pins the exact manifest bytes; verify it.
                if reference.starts_with("sha256:") {
                    let computed = format!("sha256:{}", hex::encode(Sha256::digest(&body)));
                    if computed != reference {
                        return Err(RegistryError::DigestMismatch {
                            expected: reference.to_string(),
                            actual: computed,
                        });
                    }
                }

                let manifest: Manifest = serde_json::from_slice(&body)?;
                Ok(manifest)
            }
            StatusCode::NOT_FOUND => Err(RegistryError::NotFound(format!("{repo}:{reference}"))),
            StatusCode::UNAUTHORIZED => Err(RegistryError::AuthRequired),
            _ => Err(RegistryError::Http(response.error_for_status().unwrap_err())),
        }
    }

    /// Fetch a blob by digest, verifying the returned bytes against it.
    pub async fn fetch_blob(&self, repo: &str, digest: &str) -> Result<Vec<u8>, RegistryError> {
        let url = format!("{}/v2/{}/blobs/{}", self.config.registry_url, repo, digest);

        debug!(url = %url, "fetching blob");

        let mut request = self.client.get(&url);

        if let Some(auth) = &self.config.authorization {
            request = request.header("Authorization", auth);
        }

        let response = request.send().await?;

        match response.status() {
            StatusCode::OK => {
                let body = response.bytes().await?;

                let computed = format!("sha256:{}", hex::encode(Sha256::digest(&body)));
                if computed != digest {
                    return Err(RegistryError::DigestMismatch {
                        expected: digest.to_string(),
                        actual: computed,
                    });
                }

                debug!(digest = %digest, size = body.len(), "blob downloaded");
                Ok(body.to_vec())
            }
            StatusCode::NOT_FOUND => Err(RegistryError::NotFound(digest.to_string())),
            StatusCode::UNAUTHORIZED => Err(RegistryError::AuthRequired),
            _ => Err(RegistryError::Http(response.error_for_status().unwrap_err())),
        }
    }
}

/// OCI image manifest.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Schema version.
    pub schema_version: u32,
    /// Media type.
    #[serde(default)]
    pub media_type: Option<String>,
    /// Config descriptor.
    pub config: Descriptor,
    /// Layer descriptors.
    pub layers: Vec<Descriptor>,
}

/// Content descriptor.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: String,
    /// Digest of the content.
    pub digest: String,
    /// Size in bytes.
    pub size: u64,
}

/// A parsed artifact reference: `[scheme://]registry/repo[:tag][@digest]`.
///
/// The registry component keeps an explicit `http://` scheme when given one
/// (local registries); the client defaults to https otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub registry: String,
    pub repository: String,
    pub reference: String,
}

impl Reference {
    /// Parse an artifact reference.
    ///
    /// Examples:
    /// - `ghcr.io/org/repo:desired` -> (ghcr.io, org/repo, desired)
    /// - `registry.example.com/foo/bar@sha256:abc...` -> (registry.example.com, foo/bar, sha256:abc...)
    /// - `localhost:5000/foo:latest` -> (localhost:5000, foo, latest)
    pub fn parse(input: &str) -> Result<Self, RegistryError> {
        let (scheme, rest) = if let Some(rest) = input.strip_prefix("http://") {
            ("http://", rest)
        } else if let Some(rest) = input.strip_prefix("https://") {
            ("", rest)
        } else {
            ("", input)
        };

        let (name_part, reference) = if let Some((name, digest)) = rest.rsplit_once('@') {
            (name, digest.to_string())
        } else if let Some((name, tag)) = rest.rsplit_once(':') {
            if tag.contains('/') {
                // Port in the registry host, not a tag.
                (rest, "latest".to_string())
            } else {
                (name, tag.to_string())
            }
        } else {
            (rest, "latest".to_string())
        };

        let (registry, repository) = name_part
            .split_once('/')
            .ok_or_else(|| RegistryError::InvalidReference(input.to_string()))?;
        if registry.is_empty() || repository.is_empty() {
            return Err(RegistryError::InvalidReference(input.to_string()));
        }

        Ok(Self {
            registry: format!("{scheme}{registry}"),
            repository: repository.to_string(),
            reference,
        })
    }
}

/// Registry coordinates of a single blob, as embedded in manifest URLs:
/// `[scheme://]registry/v2/<repository>/blobs/<digest>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobLocation {
    pub registry: String,
    pub repository: String,
    pub digest: String,
}

impl BlobLocation {
    /// Parse a blob URL into structured registry coordinates.
    pub fn parse(url: &str) -> Result<Self, RegistryError> {
        let (scheme, rest) = if let Some(rest) = url.strip_prefix("http://") {
            ("http://", rest)
        } else if let Some(rest) = url.strip_prefix("https://") {
            ("", rest)
        } else {
            ("", url)
        };

        let (registry, path) = rest
            .split_once("/v2/")
            .ok_or_else(|| RegistryError::InvalidReference(url.to_string()))?;
        let (repository, digest) = path
            .split_once("/blobs/")
            .ok_or_else(|| RegistryError::InvalidReference(url.to_string()))?;

        if registry.is_empty() || repository.is_empty() || !digest.contains(':') {
            return Err(RegistryError::InvalidReference(url.to_string()));
        }

        Ok(Self {
            registry: format!("{scheme}{registry}"),
            repository: repository.to_string(),
            digest: digest.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reference_tag() {
        let r = Reference::parse("ghcr.io/org/repo:desired").unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "org/repo");
        assert_eq!(r.reference, "desired");
    }

    #[test]
    fn test_parse_reference_no_tag() {
        let r = Reference::parse("ghcr.io/org/repo").unwrap();
        assert_eq!(r.reference, "latest");
    }

    #[test]
    fn test_parse_reference_digest() {
        let r = Reference::parse("registry.example.com/foo/bar@sha256:abc123").unwrap();
        assert_eq!(r.registry, "registry.example.com");
        assert_eq!(r.repository, "foo/bar");
        assert_eq!(r.reference, "sha256:abc123");
    }

    #[test]
    fn test_parse_reference_localhost_port() {
        let r = Reference::parse("localhost:5000/myapp:test").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "myapp");
        assert_eq!(r.reference, "test");
    }

    #[test]
    fn test_parse_reference_http_scheme_kept() {
        let r = Reference::parse("http://127.0.0.1:5000/org/repo:desired").unwrap();
        assert_eq!(r.registry, "http://127.0.0.1:5000");
        assert_eq!(r.repository, "org/repo");
    }

    #[test]
    fn test_parse_reference_invalid() {
        assert!(Reference::parse("no-repository").is_err());
    }

    #[test]
    fn test_parse_blob_location() {
        let loc = BlobLocation::parse("https://ghcr.io/v2/org/repo/blobs/sha256:abc123").unwrap();
        assert_eq!(loc.registry, "ghcr.io");
        assert_eq!(loc.repository, "org/repo");
        assert_eq!(loc.digest, "sha256:abc123");
    }

    #[test]
    fn test_parse_blob_location_http() {
        let loc = BlobLocation::parse("http://127.0.0.1:9000/v2/acme/demo/blobs/sha256:ff").unwrap();
        assert_eq!(loc.registry, "http://127.0.0.1:9000");
        assert_eq!(loc.repository, "acme/demo");
    }

    #[test]
    fn test_parse_blob_location_invalid() {
        assert!(BlobLocation::parse("https://ghcr.io/org/repo").is_err());
        assert!(BlobLocation::parse("https://ghcr.io/v2/org/repo/blobs/notadigest").is_err());
    }
}
