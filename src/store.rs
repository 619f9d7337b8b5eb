//! On-disk deployment records.
//!
//! The deployment directory tree is the system of record: each component
//! owns `<deploy_dir>/<name>/`, and a `.hash` marker inside it holds the
//! digest of the last successfully applied package. This module is the only
//! place that layout is spelled out.

use std::fs;
use std::io;
use std::path::PathBuf;

/// Digest marker file inside a deployment directory.
pub const DIGEST_MARKER: &str = ".hash";

/// Filesystem-backed store of local deployment records.
#[derive(Debug, Clone)]
pub struct DeploymentStore {
    deploy_dir: PathBuf,
}

impl DeploymentStore {
    /// Open a store rooted at `deploy_dir`, creating the root if needed.
    pub fn open(deploy_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let deploy_dir = deploy_dir.into();
        fs::create_dir_all(&deploy_dir)?;
        Ok(Self { deploy_dir })
    }

    /// Directory owned by the named component.
    pub fn component_dir(&self, name: &str) -> PathBuf {
        self.deploy_dir.join(name)
    }

    /// Digest of the last successfully applied package, if any.
    pub fn stored_digest(&self, name: &str) -> io::Result<Option<String>> {
        let marker = self.component_dir(name).join(DIGEST_MARKER);
        match fs::read_to_string(&marker) {
            Ok(digest) => Ok(Some(digest.trim().to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Persist `digest` as the component's applied-package digest.
    pub fn write_digest(&self, name: &str, digest: &str) -> io::Result<()> {
        fs::write(self.component_dir(name).join(DIGEST_MARKER), digest)
    }

    /// Names of all components currently present on disk.
    pub fn list_components(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.deploy_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Remove a component's directory and everything in it.
    pub fn remove_component(&self, name: &str) -> io::Result<()> {
        let dir = self.component_dir(name);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Whether the component declares an orchestration descriptor.
    pub fn has_descriptor(&self, name: &str, descriptor: &str) -> bool {
        self.component_dir(name).join(descriptor).exists()
    }
}
