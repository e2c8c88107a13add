//! Ed25519 key identities
//!
//! The hub owns one keypair used to sign node credentials. Nodes generate
//! their own keypair and only ever hand the hub their public key. A key's
//! fingerprint is the truncated SHA-256 of its public key bytes

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Length of a key fingerprint in hex characters (32 = 128 bits)
const FINGERPRINT_LENGTH: usize = 32;

/// A named Ed25519 keypair, serializable to disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyIdentity {
    /// Truncated SHA-256 of the public key
    pub fingerprint: String,

    /// Ed25519 public key (base64 encoded)
    pub public_key: String,

    /// Ed25519 private key (base64 encoded)
    #[serde(skip_serializing_if = "Option::is_none")]
    secret_key: Option<String>,

    /// Human-readable name
    pub name: String,

    /// When the keypair was generated
    pub created_at: DateTime<Utc>,
}

impl KeyIdentity {
    /// Generate a new identity with a random keypair
    #[must_use]
    pub fn generate(name: &str) -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public_key_bytes = signing_key.verifying_key().to_bytes();

        Self {
            fingerprint: compute_fingerprint(&public_key_bytes),
            public_key: base64_encode(&public_key_bytes),
            secret_key: Some(base64_encode(signing_key.as_bytes())),
            name: name.to_string(),
            created_at: Utc::now(),
        }
    }

    /// Load identity from a file, or create a new one if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns error if file operations fail or JSON is invalid
    pub fn load_or_create(path: &Path, default_name: &str) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            let identity: Self = serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("invalid hub identity: {e}")))?;
            if !identity.has_secret_key() {
                return Err(Error::Config(format!(
                    "hub identity at {} has no secret key",
                    path.display()
                )));
            }
            tracing::debug!(fingerprint = %identity.fingerprint, "loaded hub identity");
            Ok(identity)
        } else {
            let identity = Self::generate(default_name);

            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }

            let content = serde_json::to_string_pretty(&identity)?;
            fs::write(path, content)?;

            tracing::info!(fingerprint = %identity.fingerprint, "created new hub identity");
            Ok(identity)
        }
    }

    /// Sign a payload with the secret key
    ///
    /// # Errors
    ///
    /// Returns error if identity has no secret key
    pub fn sign(&self, payload: &[u8]) -> Result<String> {
        let secret_key = self
            .secret_key
            .as_ref()
            .ok_or_else(|| Error::Auth("identity has no secret key".to_string()))?;

        let key_bytes = base64_decode(secret_key)?;
        let signing_key = SigningKey::try_from(key_bytes.as_slice())
            .map_err(|e| Error::Auth(format!("invalid secret key: {e}")))?;

        Ok(base64_encode(&signing_key.sign(payload).to_bytes()))
    }

    /// Verify a signature against this identity's public key
    ///
    /// # Errors
    ///
    /// Returns error if the public key or signature is malformed
    pub fn verify(&self, payload: &[u8], signature: &str) -> Result<bool> {
        verify_signature(&self.public_key, payload, signature)
    }

    /// Create a public-only copy of this identity (for sharing)
    #[must_use]
    pub fn public_only(&self) -> Self {
        Self {
            secret_key: None,
            ..self.clone()
        }
    }

    /// Check if this identity has a secret key
    #[must_use]
    pub const fn has_secret_key(&self) -> bool {
        self.secret_key.is_some()
    }

    /// First 8 characters of the fingerprint
    #[must_use]
    pub fn short_id(&self) -> &str {
        &self.fingerprint[..8.min(self.fingerprint.len())]
    }
}

/// Verify a signature from a base64 public key
///
/// # Errors
///
/// Returns error if public key or signature format is invalid
pub fn verify_signature(public_key: &str, payload: &[u8], signature: &str) -> Result<bool> {
    let verifying_key = decode_public_key(public_key)?;

    let sig_bytes = base64_decode(signature)?;
    let signature = Signature::try_from(sig_bytes.as_slice())
        .map_err(|e| Error::Auth(format!("invalid signature format: {e}")))?;

    Ok(verifying_key.verify(payload, &signature).is_ok())
}

/// Fingerprint of a base64 public key
///
/// # Errors
///
/// Returns error if the key is not a valid Ed25519 public key
pub fn fingerprint(public_key: &str) -> Result<String> {
    let key = decode_public_key(public_key)?;
    Ok(compute_fingerprint(key.as_bytes()))
}

fn decode_public_key(public_key: &str) -> Result<VerifyingKey> {
    let bytes = base64_decode(public_key)?;
    VerifyingKey::try_from(bytes.as_slice())
        .map_err(|e| Error::Auth(format!("invalid public key: {e}")))
}

fn compute_fingerprint(public_key: &[u8]) -> String {
    let hash = Sha256::digest(public_key);

    // Each byte = 2 hex chars
    hex::encode(&hash[..FINGERPRINT_LENGTH / 2])
}

fn base64_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn base64_decode(data: &str) -> Result<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| Error::Auth(format!("invalid base64: {e}")))
}
