//! Detached signature verification against an armored public key ring.
//!
//! A package is trusted only if its application descriptor carries a
//! detached OpenPGP signature that verifies against the key ring published
//! alongside it. Key-parse failures, I/O failures and signature failures are
//! reported distinctly so the reconciler can say why a package was rejected.

use std::fs;
use std::io::Cursor;
use std::path::Path;

use pgp::composed::{Deserializable, SignedPublicKey, StandaloneSignature};
use thiserror::Error;
use tracing::debug;

/// Errors from signature verification.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("failed to parse public key ring: {0}")]
    KeyParse(#[source] pgp::errors::Error),

    #[error("signature verification failed: {0}")]
    SignatureInvalid(#[source] pgp::errors::Error),

    #[error("signature does not match any key in the ring")]
    NoValidBinding,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Verifies a detached signature of a file against a public key ring.
///
/// The trait exists so reconciler tests can substitute a double; production
/// code uses [`PgpVerifier`].
pub trait PackageVerifier: Send + Sync {
    fn verify_detached(
        &self,
        keyring: &[u8],
        signed_file: &Path,
        signature_file: &Path,
    ) -> Result<(), VerifyError>;
}

/// OpenPGP implementation of [`PackageVerifier`].
pub struct PgpVerifier;

impl PackageVerifier for PgpVerifier {
    fn verify_detached(
        &self,
        keyring: &[u8],
        signed_file: &Path,
        signature_file: &Path,
    ) -> Result<(), VerifyError> {
        debug!(signed = %signed_file.display(), "verifying signature");

        let (keys, _headers) = SignedPublicKey::from_armor_many(Cursor::new(keyring))
            .map_err(VerifyError::KeyParse)?;
        let keys: Vec<SignedPublicKey> = keys
            .collect::<Result<_, _>>()
            .map_err(VerifyError::KeyParse)?;

        let data = fs::read(signed_file)?;
        let sig_bytes = fs::read(signature_file)?;
        let signature = parse_signature(&sig_bytes)?;

        for key in &keys {
            if signature.verify(key, &data).is_ok() {
                debug!(signed = %signed_file.display(), "signature verified");
                return Ok(());
            }
            for subkey in &key.public_subkeys {
                if signature.verify(subkey, &data).is_ok() {
                    debug!(signed = %signed_file.display(), "signature verified by subkey");
                    return Ok(());
                }
            }
        }

        Err(VerifyError::NoValidBinding)
    }
}

/// Parse a detached signature, armored or binary.
fn parse_signature(bytes: &[u8]) -> Result<StandaloneSignature, VerifyError> {
    if bytes.starts_with(b"-----BEGIN") {
        StandaloneSignature::from_armor_single(Cursor::new(bytes))
            .map(|(sig, _)| sig)
            .map_err(VerifyError::SignatureInvalid)
    } else {
        StandaloneSignature::from_bytes(Cursor::new(bytes)).map_err(VerifyError::SignatureInvalid)
    }
}
