//! Session challenges
//!
//! Every node session starts with a fresh nonce the node must sign with the
//! key named in its credential

use chrono::{DateTime, Duration, Utc};
use rand::Rng;

use super::identity::verify_signature;
use crate::{Error, Result};

/// Nonce length in bytes
const NONCE_LENGTH: usize = 32;

/// Challenge for proving possession of a node key
#[derive(Debug, Clone)]
pub struct Challenge {
    /// Random hex nonce to sign
    pub nonce: String,

    /// When the challenge expires
    pub expires_at: DateTime<Utc>,
}

impl Challenge {
    /// Generate a challenge valid for `ttl`
    #[must_use]
    pub fn generate(ttl: std::time::Duration) -> Self {
        let ttl = Duration::from_std(ttl).unwrap_or_else(|_| Duration::seconds(60));
        Self {
            nonce: generate_nonce(NONCE_LENGTH),
            expires_at: Utc::now() + ttl,
        }
    }

    /// Check if the challenge has expired
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Verify the node's signature over the nonce
    ///
    /// # Errors
    ///
    /// Returns `Error::Auth` if the challenge expired or the proof is invalid
    pub fn verify_proof(&self, public_key: &str, proof: &str) -> Result<()> {
        if self.is_expired() {
            return Err(Error::Auth("challenge expired".to_string()));
        }

        if verify_signature(public_key, self.nonce.as_bytes(), proof)? {
            Ok(())
        } else {
            Err(Error::Auth("challenge proof mismatch".to_string()))
        }
    }
}

/// Generate a random hex nonce
fn generate_nonce(length: usize) -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..length).map(|_| rng.r#gen()).collect();
    hex::encode(bytes)
}
