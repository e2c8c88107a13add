//! Hub key material, node credentials and session challenges

pub mod challenge;
pub mod credential;
pub mod identity;

pub use challenge::Challenge;
pub use credential::Credential;
pub use identity::{KeyIdentity, fingerprint, verify_signature};
