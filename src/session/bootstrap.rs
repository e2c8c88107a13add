//! Enrollment bootstrap channel
//!
//! A node without a credential sends one `enrollment_request`, learns its
//! request id, then waits on the same channel for the operator's decision.
//! Hanging up while the request is pending withdraws it.

use std::fmt::Display;
use std::sync::Arc;

use futures::{Sink, Stream, StreamExt};

use super::{hang_up, send};
use crate::enrollment::{EnrollmentHandle, EnrollmentOutcome};
use crate::hub::Hub;
use crate::protocol::{self, Frame};

/// How a bootstrap exchange ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapEnd {
    /// Outcome delivered to the node
    Resolved(EnrollmentOutcome),
    /// Node hung up while its request was pending
    Withdrawn,
    /// Hub shut down while the request was pending
    Shutdown,
    /// Channel closed or went quiet before a request arrived
    Abandoned,
    /// Request could not be registered; carries the error code sent
    Refused(&'static str),
}

/// Resolves when the peer hangs up; further frames are ignored
async fn closed<S>(inbound: &mut S)
where
    S: Stream<Item = String> + Unpin,
{
    while inbound.next().await.is_some() {}
}

/// Drive one bootstrap exchange
pub async fn run<S, K>(hub: Arc<Hub>, mut inbound: S, mut outbound: K) -> BootstrapEnd
where
    S: Stream<Item = String> + Unpin,
    K: Sink<String> + Unpin,
    K::Error: Display,
{
    let end = exchange(&hub, &mut inbound, &mut outbound).await;
    hang_up(&mut outbound, hub.config().session.write_timeout).await;
    end
}

async fn exchange<S, K>(hub: &Hub, inbound: &mut S, outbound: &mut K) -> BootstrapEnd
where
    S: Stream<Item = String> + Unpin,
    K: Sink<String> + Unpin,
    K::Error: Display,
{
    let limit = hub.config().session.write_timeout;
    let mut shutdown = hub.shutdown_signal();

    let first = tokio::select! {
        () = shutdown.wait() => return BootstrapEnd::Shutdown,
        first = tokio::time::timeout(hub.config().session.hello_grace, inbound.next()) => first,
    };
    let Ok(Some(first)) = first else {
        tracing::debug!("bootstrap channel closed before enrollment request");
        return BootstrapEnd::Abandoned;
    };

    let (name, public_key) = match protocol::decode(&first) {
        Ok(Frame::EnrollmentRequest { name, public_key }) => (name, public_key),
        other => {
            let message = match other {
                Ok(frame) => format!("expected enrollment_request, got {}", frame.kind()),
                Err(e) => e.to_string(),
            };
            tracing::warn!(reason = %message, "protocol violation on bootstrap channel");
            let _ = send(outbound, &Frame::error("protocol_violation", message), limit).await;
            return BootstrapEnd::Refused("protocol_violation");
        }
    };

    let (handle, mut decision) = EnrollmentHandle::new(public_key, name);
    let request_id = match hub.request_enrollment(handle) {
        Ok(id) => id,
        Err(e) => {
            tracing::info!(error = %e, "enrollment request refused");
            let _ = send(outbound, &Frame::error(e.code(), e.to_string()), limit).await;
            return BootstrapEnd::Refused(e.code());
        }
    };

    let pending = Frame::EnrollmentPending {
        request_id: request_id.clone(),
    };
    if send(outbound, &pending, limit).await.is_err() {
        hub.withdraw_enrollment(&request_id);
        return BootstrapEnd::Withdrawn;
    }

    let outcome = tokio::select! {
        biased;

        outcome = &mut decision => outcome.ok(),
        () = closed(inbound) => {
            if hub.withdraw_enrollment(&request_id) {
                tracing::info!(request_id = %request_id, "enrollment withdrawn");
                return BootstrapEnd::Withdrawn;
            }
            // Resolved just as the node hung up; nobody left to tell
            return decision.try_recv().map_or(BootstrapEnd::Withdrawn, BootstrapEnd::Resolved);
        }
        () = shutdown.wait() => {
            if hub.withdraw_enrollment(&request_id) {
                None
            } else {
                decision.try_recv().ok()
            }
        }
    };

    let Some(outcome) = outcome else {
        let reply = Frame::EnrollmentReject {
            reason: "hub shutting down".to_string(),
        };
        let _ = send(outbound, &reply, limit).await;
        return BootstrapEnd::Shutdown;
    };

    let reply = match &outcome {
        EnrollmentOutcome::Accepted(credential) => Frame::EnrollmentAccept {
            credential: credential.clone(),
        },
        EnrollmentOutcome::Rejected(reason) => Frame::EnrollmentReject {
            reason: reason.clone(),
        },
    };
    let _ = send(outbound, &reply, limit).await;
    BootstrapEnd::Resolved(outcome)
}
