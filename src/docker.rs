//! Docker Engine API client for loading image archives.
//!
//! Talks to the local daemon over its Unix socket. Only the image-load
//! operation is needed: deployment payloads may ship container images as
//! tar archives which must be present in the local runtime before
//! `docker-compose up` can start services.
//!
//! Reference: https://docs.docker.com/engine/api/ (POST /images/load)

use std::path::Path;

use hyper::{body::Buf, Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use thiserror::Error;
use tracing::{debug, info};

/// Errors from the Docker Engine API.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
}

/// Docker Engine API client over the daemon's Unix socket.
pub struct DockerClient {
    socket_path: String,
    client: Client<UnixConnector>,
}

impl DockerClient {
    /// Create a new client for the given daemon socket path.
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        let socket_path = socket_path.as_ref().to_string_lossy().to_string();
        let client = Client::unix();
        Self {
            socket_path,
            client,
        }
    }

    /// Load an image tar archive into the daemon.
    ///
    /// The daemon's textual progress output is logged line by line.
    pub async fn load_image(&self, archive: &Path) -> Result<(), DockerError> {
        let bytes = tokio::fs::read(archive).await?;

        debug!(
            archive = %archive.display(),
            size = bytes.len(),
            "loading image archive"
        );

        let uri = Uri::new(&self.socket_path, "/images/load?quiet=0");
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("Content-Type", "application/x-tar")
            .body(Body::from(bytes))?;

        let response = self.client.request(request).await?;
        let status = response.status();
        let body = hyper::body::aggregate(response.into_body()).await?;

        if !status.is_success() {
            let message = String::from_utf8_lossy(body.chunk()).to_string();
            return Err(DockerError::Api {
                status: status.as_u16(),
                message,
            });
        }

        for line in String::from_utf8_lossy(body.chunk()).lines() {
            if !line.trim().is_empty() {
                info!(archive = %archive.display(), progress = %line, "image load");
            }
        }

        Ok(())
    }
}

impl From<hyper::http::Error> for DockerError {
    fn from(err: hyper::http::Error) -> Self {
        DockerError::Api {
            status: 0,
            message: err.to_string(),
        }
    }
}
