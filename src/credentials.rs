//! Registry credential resolution.
//!
//! Credentials are provisioned out of band; this module only reads them.
//! Resolution order: the `EDGE_AGENT_REGISTRY_TOKEN` environment variable
//! (used as a bearer token), then the Docker config file's `auths` entry for
//! the registry host (used as-is for basic auth). Anonymous access otherwise.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerAuth>,
}

#[derive(Debug, Deserialize)]
struct DockerAuth {
    #[serde(default)]
    auth: Option<String>,
}

/// Resolve an `Authorization` header value for `registry`, if any.
pub fn resolve_authorization(registry: &str) -> Option<String> {
    if let Ok(token) = std::env::var("EDGE_AGENT_REGISTRY_TOKEN") {
        if !token.is_empty() {
            return Some(format!("Bearer {token}"));
        }
    }

    let host = registry_host(registry);
    let config = load_docker_config()?;
    let auth = config.auths.get(host).and_then(|a| a.auth.clone())?;

    debug!(registry = %host, "using docker config credentials");
    Some(format!("Basic {auth}"))
}

/// Strip scheme and port from a registry reference, leaving the host key
/// used by the Docker config file.
fn registry_host(registry: &str) -> &str {
    let host = registry
        .strip_prefix("https://")
        .or_else(|| registry.strip_prefix("http://"))
        .unwrap_or(registry);
    host.split('/').next().unwrap_or(host)
}

fn load_docker_config() -> Option<DockerConfig> {
    let path = docker_config_path()?;
    let contents = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&contents) {
        Ok(config) => Some(config),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "unreadable docker config");
            None
        }
    }
}

fn docker_config_path() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("DOCKER_CONFIG") {
        return Some(PathBuf::from(dir).join("config.json"));
    }
    std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".docker").join("config.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_host_strips_scheme() {
        assert_eq!(registry_host("https://ghcr.io"), "ghcr.io");
        assert_eq!(registry_host("http://localhost:5000"), "localhost:5000");
        assert_eq!(registry_host("ghcr.io"), "ghcr.io");
    }

    #[test]
    fn test_docker_config_parse() {
        let json = r#"{"auths": {"ghcr.io": {"auth": "dXNlcjp0b2tlbg=="}}}"#;
        let config: DockerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            config.auths["ghcr.io"].auth.as_deref(),
            Some("dXNlcjp0b2tlbg==")
        );
    }
}
