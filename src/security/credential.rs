//! Node credentials issued at enrollment
//!
//! A credential binds a node id to the node's public key and is signed by
//! the hub key. Presenting it (together with proof of the node key) is the
//! only way into a session

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::identity::{KeyIdentity, verify_signature};
use crate::nodes::NodeId;
use crate::{Error, Result};

/// Identity issued to an accepted node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Node id assigned by the hub
    pub node_id: NodeId,

    /// Node's Ed25519 public key (base64)
    pub public_key: String,

    /// Issue time
    pub issued_at: DateTime<Utc>,

    /// Public key of the issuing hub (base64)
    pub hub_key: String,

    /// Hub signature over the credential payload (base64)
    pub signature: String,
}

impl Credential {
    /// Sign a credential for `node_id` with the hub key
    ///
    /// # Errors
    ///
    /// Returns error if the hub identity cannot sign
    pub fn issue(hub: &KeyIdentity, node_id: NodeId, public_key: &str) -> Result<Self> {
        let issued_at = Utc::now();
        let payload = signing_payload(&node_id, public_key, &issued_at);
        let signature = hub.sign(payload.as_bytes())?;

        Ok(Self {
            node_id,
            public_key: public_key.to_string(),
            issued_at,
            hub_key: hub.public_key.clone(),
            signature,
        })
    }

    /// Check the credential was signed by the hub holding `hub_key`
    ///
    /// # Errors
    ///
    /// Returns `Error::Auth` if the issuer or signature does not match
    pub fn verify(&self, hub_key: &str) -> Result<()> {
        if self.hub_key != hub_key {
            return Err(Error::Auth("credential issued by another hub".to_string()));
        }

        let payload = signing_payload(&self.node_id, &self.public_key, &self.issued_at);
        if verify_signature(hub_key, payload.as_bytes(), &self.signature)? {
            Ok(())
        } else {
            Err(Error::Auth("credential signature mismatch".to_string()))
        }
    }
}

fn signing_payload(node_id: &NodeId, public_key: &str, issued_at: &DateTime<Utc>) -> String {
    format!(
        "{node_id}\n{public_key}\n{}",
        issued_at.to_rfc3339_opts(SecondsFormat::Micros, true)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_id(s: &str) -> NodeId {
        NodeId::parse(s).unwrap()
    }

    #[test]
    fn issued_credential_verifies() {
        let hub = KeyIdentity::generate("hub");
        let node = KeyIdentity::generate("lamp");

        let cred = Credential::issue(&hub, node_id("lamp"), &node.public_key).unwrap();
        assert!(cred.verify(&hub.public_key).is_ok());
    }

    #[test]
    fn tampered_node_id_fails() {
        let hub = KeyIdentity::generate("hub");
        let node = KeyIdentity::generate("lamp");

        let mut cred = Credential::issue(&hub, node_id("lamp"), &node.public_key).unwrap();
        cred.node_id = node_id("door");
        assert!(matches!(cred.verify(&hub.public_key), Err(Error::Auth(_))));
    }

    #[test]
    fn foreign_hub_fails() {
        let hub = KeyIdentity::generate("hub");
        let other = KeyIdentity::generate("other");
        let node = KeyIdentity::generate("lamp");

        let cred = Credential::issue(&other, node_id("lamp"), &node.public_key).unwrap();
        assert!(cred.verify(&hub.public_key).is_err());
    }

    #[test]
    fn survives_json_round_trip() {
        let hub = KeyIdentity::generate("hub");
        let node = KeyIdentity::generate("lamp");
        let cred = Credential::issue(&hub, node_id("lamp"), &node.public_key).unwrap();

        let json = serde_json::to_string(&cred).unwrap();
        let back: Credential = serde_json::from_str(&json).unwrap();
        assert!(back.verify(&hub.public_key).is_ok());
    }
}
