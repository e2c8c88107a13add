//! Enrollment authority
//!
//! Unenrolled nodes park a request here until an operator (or the `auto`
//! policy) accepts or rejects it. Acceptance issues a hub-signed credential
//! and records the node as known but not yet connected. Every request is
//! resolved exactly once.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::nodes::NodeRegistry;
use crate::security::{Credential, KeyIdentity, fingerprint};
use crate::{Error, Result};

/// How enrollment requests are approved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnrollmentPolicy {
    /// An operator accepts or rejects each request
    #[default]
    Manual,

    /// Every request is accepted as soon as it arrives
    Auto,
}

impl EnrollmentPolicy {
    /// Parse from string representation
    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "auto" => Self::Auto,
            _ => Self::Manual,
        }
    }
}

impl std::fmt::Display for EnrollmentPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

/// How a request was resolved, delivered to the waiting bootstrap channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrollmentOutcome {
    Accepted(Credential),
    Rejected(String),
}

/// The pending side of a bootstrap connection
#[derive(Debug)]
pub struct EnrollmentHandle {
    /// Requester's Ed25519 public key (base64); one pending request per key
    pub public_key: String,

    /// Proposed display name
    pub label: Option<String>,

    responder: Option<oneshot::Sender<EnrollmentOutcome>>,
}

impl EnrollmentHandle {
    /// Handle whose outcome is delivered through the returned receiver
    #[must_use]
    pub fn new(
        public_key: impl Into<String>,
        label: Option<String>,
    ) -> (Self, oneshot::Receiver<EnrollmentOutcome>) {
        let (tx, rx) = oneshot::channel();
        let handle = Self {
            public_key: public_key.into(),
            label,
            responder: Some(tx),
        };
        (handle, rx)
    }

    /// Handle with nobody waiting on the outcome
    #[must_use]
    pub fn detached(public_key: impl Into<String>, label: Option<String>) -> Self {
        Self {
            public_key: public_key.into(),
            label,
            responder: None,
        }
    }

    fn resolve(mut self, outcome: EnrollmentOutcome) {
        if let Some(tx) = self.responder.take() {
            // Receiver gone means the bootstrap socket already closed
            let _ = tx.send(outcome);
        }
    }
}

/// Operator view of a pending request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingRequest {
    pub id: String,
    pub label: Option<String>,
    pub public_key: String,
    /// Key fingerprint, for comparing against what the node displays
    pub fingerprint: String,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Entry {
    info: PendingRequest,
    handle: EnrollmentHandle,
}

/// Issues node identities after approval
#[derive(Debug)]
pub struct EnrollmentAuthority {
    identity: KeyIdentity,
    policy: EnrollmentPolicy,
    pending: Mutex<Vec<Entry>>,
}

impl EnrollmentAuthority {
    /// Create an authority signing with the hub identity
    #[must_use]
    pub const fn new(identity: KeyIdentity, policy: EnrollmentPolicy) -> Self {
        Self {
            identity,
            policy,
            pending: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub const fn policy(&self) -> EnrollmentPolicy {
        self.policy
    }

    /// Public key credentials are verified against
    #[must_use]
    pub fn hub_key(&self) -> &str {
        &self.identity.public_key
    }

    /// Register a pending request
    ///
    /// # Errors
    ///
    /// Returns `Error::Auth` if the public key is malformed and
    /// `Error::DuplicateRequest` if the key already has a pending request
    pub fn request(&self, handle: EnrollmentHandle) -> Result<String> {
        let fingerprint = fingerprint(&handle.public_key)?;

        let mut pending = self.lock();
        if pending.iter().any(|e| e.handle.public_key == handle.public_key) {
            return Err(Error::DuplicateRequest(fingerprint));
        }

        let id = Uuid::new_v4().to_string();
        let info = PendingRequest {
            id: id.clone(),
            label: handle.label.clone(),
            public_key: handle.public_key.clone(),
            fingerprint,
            requested_at: Utc::now(),
        };
        tracing::info!(
            request_id = %id,
            label = ?info.label,
            fingerprint = %info.fingerprint,
            "enrollment requested"
        );
        pending.push(Entry { info, handle });
        Ok(id)
    }

    /// Ids of unresolved requests, in insertion order
    #[must_use]
    pub fn pending_requests(&self) -> Vec<String> {
        self.lock().iter().map(|e| e.info.id.clone()).collect()
    }

    /// Details of unresolved requests, in insertion order
    #[must_use]
    pub fn pending(&self) -> Vec<PendingRequest> {
        self.lock().iter().map(|e| e.info.clone()).collect()
    }

    fn take(&self, id: &str) -> Result<Entry> {
        let mut pending = self.lock();
        let index = pending
            .iter()
            .position(|e| e.info.id == id)
            .ok_or_else(|| Error::UnknownRequest(id.to_string()))?;
        Ok(pending.remove(index))
    }

    /// Accept a request, issue its credential and enroll the node
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownRequest` if the request was already resolved
    /// or never existed
    pub fn accept(&self, id: &str, nodes: &NodeRegistry) -> Result<Credential> {
        let Entry { info, handle } = self.take(id)?;

        let node = nodes.enroll(info.label.as_deref(), &info.public_key);
        let credential = match Credential::issue(&self.identity, node.id.clone(), &info.public_key)
        {
            Ok(credential) => credential,
            Err(e) => {
                handle.resolve(EnrollmentOutcome::Rejected("credential issue failed".to_string()));
                return Err(e);
            }
        };

        tracing::info!(request_id = %id, node_id = %node.id, "enrollment accepted");
        handle.resolve(EnrollmentOutcome::Accepted(credential.clone()));
        Ok(credential)
    }

    /// Reject a request; no identity is issued
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownRequest` if the request was already resolved
    /// or never existed
    pub fn reject(&self, id: &str, reason: &str) -> Result<()> {
        let Entry { handle, .. } = self.take(id)?;
        tracing::info!(request_id = %id, reason, "enrollment rejected");
        handle.resolve(EnrollmentOutcome::Rejected(reason.to_string()));
        Ok(())
    }

    /// Drop a request whose bootstrap connection went away
    ///
    /// Returns false if it was already resolved.
    pub fn withdraw(&self, id: &str) -> bool {
        self.reject(id, "withdrawn").is_ok()
    }
}
