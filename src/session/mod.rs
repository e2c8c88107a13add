//! Node transport sessions
//!
//! One task per connected node. The task is written against a plain
//! `Stream` of inbound text frames and a `Sink` of outbound ones, so the
//! WebSocket handler and in-memory tests drive the same code.

pub mod bootstrap;
pub mod queue;

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};

pub use self::queue::CommandQueue;
use crate::hub::{Hub, ShutdownSignal};
use crate::nodes::NodeId;
use crate::protocol::{self, Frame, Hello};
use crate::security::Challenge;
use crate::{Error, Result};

/// Reference to a live session, shared between the table and its task
#[derive(Debug, Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

#[derive(Debug)]
struct SessionInner {
    id: u64,
    queue: CommandQueue,
    finished: AtomicBool,
}

impl SessionHandle {
    fn new(id: u64, node: NodeId, depth: usize) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id,
                queue: CommandQueue::new(node, depth),
                finished: AtomicBool::new(false),
            }),
        }
    }

    /// Epoch distinguishing this session from earlier ones of the same node
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[must_use]
    pub fn queue(&self) -> &CommandQueue {
        &self.inner.queue
    }

    /// Ask the session task to stop
    pub fn close(&self) {
        self.inner.queue.close();
    }

    /// Claim the right to run end-of-session bookkeeping
    ///
    /// Returns true exactly once per session, however many paths race to
    /// close it.
    pub fn finish(&self) -> bool {
        !self.inner.finished.swap(true, Ordering::AcqRel)
    }
}

/// Current session per node
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<NodeId, SessionHandle>>,
    next_id: AtomicU64,
}

impl SessionTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<NodeId, SessionHandle>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<NodeId, SessionHandle>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new session for `node`, closing any session it replaces
    pub fn open(&self, node: &NodeId, depth: usize) -> SessionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = SessionHandle::new(id, node.clone(), depth);
        let previous = self.write().insert(node.clone(), handle.clone());
        if let Some(previous) = previous {
            tracing::info!(node_id = %node, old = previous.id(), new = id, "session replaced");
            previous.close();
        }
        handle
    }

    /// Current session of a node
    #[must_use]
    pub fn get(&self, node: &NodeId) -> Option<SessionHandle> {
        self.read().get(node).cloned()
    }

    #[must_use]
    pub fn contains(&self, node: &NodeId) -> bool {
        self.read().contains_key(node)
    }

    /// Remove the entry for `node` if `session` is still the current one
    ///
    /// Returns true when it was, i.e. the node is now without a session.
    pub fn release(&self, node: &NodeId, session: u64) -> bool {
        self.release_and(node, session, || ()).is_some()
    }

    /// Like [`release`](Self::release), running `then` before the table is
    /// unlocked
    ///
    /// A session opened concurrently for the same node lands either before
    /// the release, which then fails, or after `then` has returned.
    pub fn release_and<R>(&self, node: &NodeId, session: u64, then: impl FnOnce() -> R) -> Option<R> {
        let mut sessions = self.write();
        if sessions.get(node).is_some_and(|h| h.id() == session) {
            sessions.remove(node);
            Some(then())
        } else {
            None
        }
    }

    /// Run `then` if `node` has no session, holding off new sessions until
    /// it returns
    pub fn if_absent<R>(&self, node: &NodeId, then: impl FnOnce() -> R) -> Option<R> {
        let sessions = self.write();
        if sessions.contains_key(node) {
            None
        } else {
            Some(then())
        }
    }

    /// Close and forget the session of `node`
    pub fn close(&self, node: &NodeId) -> bool {
        let removed = self.write().remove(node);
        removed.is_some_and(|handle| {
            handle.close();
            true
        })
    }

    /// Ask every session to stop; entries are released as tasks exit
    pub fn close_all(&self) {
        for handle in self.read().values() {
            handle.close();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed the stream or a read failed
    PeerClosed,
    /// A write to the peer failed
    WriteFailed,
    /// Hub is shutting down
    Shutdown,
    /// Another session took over, or the node was removed
    Replaced,
    /// No hello within the grace period
    HelloTimeout,
    /// Malformed or out-of-order frame, or failed authentication
    Violation(String),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PeerClosed => write!(f, "peer closed"),
            Self::WriteFailed => write!(f, "write failed"),
            Self::Shutdown => write!(f, "shutdown"),
            Self::Replaced => write!(f, "replaced"),
            Self::HelloTimeout => write!(f, "hello timeout"),
            Self::Violation(reason) => write!(f, "protocol violation: {reason}"),
        }
    }
}

async fn send<K>(outbound: &mut K, frame: &Frame, limit: Duration) -> std::result::Result<(), CloseReason>
where
    K: Sink<String> + Unpin,
    K::Error: Display,
{
    let text = protocol::encode(frame).map_err(|e| CloseReason::Violation(e.to_string()))?;
    match tokio::time::timeout(limit, outbound.send(text)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            tracing::debug!(error = %e, frame = frame.kind(), "session write failed");
            Err(CloseReason::WriteFailed)
        }
        Err(_) => {
            tracing::warn!(frame = frame.kind(), timeout = ?limit, "peer stopped reading");
            Err(CloseReason::WriteFailed)
        }
    }
}

/// [`send`], abandoned as soon as the hub starts shutting down
async fn deliver<K>(
    outbound: &mut K,
    frame: &Frame,
    limit: Duration,
    shutdown: &mut ShutdownSignal,
) -> std::result::Result<(), CloseReason>
where
    K: Sink<String> + Unpin,
    K::Error: Display,
{
    tokio::select! {
        () = shutdown.wait() => Err(CloseReason::Shutdown),
        sent = send(outbound, frame, limit) => sent,
    }
}

async fn hang_up<K>(outbound: &mut K, limit: Duration)
where
    K: Sink<String> + Unpin,
{
    let _ = tokio::time::timeout(limit, outbound.close()).await;
}

/// Check a hello against the hub key, the registry and the session challenge
///
/// # Errors
///
/// Returns `Error::ProtocolViolation` describing the first check that failed
pub fn verify_hello(hub: &Hub, node_id: &NodeId, challenge: &Challenge, hello: &Hello) -> Result<()> {
    let credential = &hello.credential;
    let violation = |e: Error| Error::ProtocolViolation(e.to_string());

    credential.verify(hub.hub_key()).map_err(violation)?;

    if &credential.node_id != node_id {
        return Err(Error::ProtocolViolation(format!(
            "credential for {} presented on session of {node_id}",
            credential.node_id
        )));
    }

    let node = hub
        .nodes()
        .get(node_id)
        .ok_or_else(|| Error::ProtocolViolation(format!("node {node_id} is not enrolled")))?;
    if node.public_key != credential.public_key {
        return Err(Error::ProtocolViolation(
            "credential key does not match enrolled key".to_string(),
        ));
    }

    challenge
        .verify_proof(&credential.public_key, &hello.proof)
        .map_err(violation)
}

/// Drive one node session until it closes
///
/// Sends the challenge, waits for a verified hello within the grace period,
/// then processes frames in receipt order while forwarding queued commands.
pub async fn run<S, K>(hub: Arc<Hub>, node_id: NodeId, mut inbound: S, mut outbound: K) -> CloseReason
where
    S: Stream<Item = String> + Unpin,
    K: Sink<String> + Unpin,
    K::Error: Display,
{
    let limit = hub.config().session.write_timeout;
    if let Err(e) = hub.nodes().mark_connecting(&node_id) {
        tracing::info!(node_id = %node_id, error = %e, "session refused");
        let _ = send(&mut outbound, &Frame::error("unknown_node", e.to_string()), limit).await;
        hang_up(&mut outbound, limit).await;
        return CloseReason::Violation(e.to_string());
    }

    tracing::info!(node_id = %node_id, "session connected");
    let mut shutdown = hub.shutdown_signal();
    let grace = hub.config().session.hello_grace;
    let challenge = Challenge::generate(grace);

    let handshake = async {
        let nonce = challenge.nonce.clone();
        deliver(&mut outbound, &Frame::Challenge { nonce }, limit, &mut shutdown).await?;

        let first = tokio::select! {
            () = shutdown.wait() => return Err(CloseReason::Shutdown),
            first = tokio::time::timeout(grace, inbound.next()) => first,
        };

        let text = match first {
            Err(_) => return Err(CloseReason::HelloTimeout),
            Ok(None) => return Err(CloseReason::PeerClosed),
            Ok(Some(text)) => text,
        };

        match protocol::decode(&text) {
            Ok(Frame::Hello(hello)) => verify_hello(&hub, &node_id, &challenge, &hello)
                .map(|()| hello)
                .map_err(|e| CloseReason::Violation(e.to_string())),
            Ok(other) => Err(CloseReason::Violation(format!(
                "expected hello, got {}",
                other.kind()
            ))),
            Err(e) => Err(CloseReason::Violation(e.to_string())),
        }
    };

    let hello = match handshake.await {
        Ok(hello) => hello,
        Err(reason) => {
            if let CloseReason::Violation(message) = &reason {
                tracing::warn!(node_id = %node_id, reason = %message, "protocol violation");
                let _ = send(&mut outbound, &Frame::error("protocol_violation", message.clone()), limit).await;
            } else {
                tracing::info!(node_id = %node_id, reason = %reason, "session closed before hello");
            }
            hang_up(&mut outbound, limit).await;
            hub.connect_abandoned(&node_id);
            return reason;
        }
    };

    let handle = hub.sessions().open(&node_id, hub.config().session.command_queue_depth);
    let devices = hub.declare(&node_id, hello);
    tracing::info!(
        node_id = %node_id,
        session = handle.id(),
        devices = devices.len(),
        "hello accepted"
    );

    let welcome = Frame::Welcome {
        node_id: node_id.clone(),
    };
    let reason = match deliver(&mut outbound, &welcome, limit, &mut shutdown).await {
        Ok(()) => serve(&hub, &node_id, &handle, &mut shutdown, &mut inbound, &mut outbound).await,
        Err(reason) => reason,
    };

    if let CloseReason::Violation(message) = &reason {
        tracing::warn!(node_id = %node_id, reason = %message, "protocol violation");
        let _ = send(&mut outbound, &Frame::error("protocol_violation", message.clone()), limit).await;
    }
    hang_up(&mut outbound, limit).await;

    handle.close();
    if handle.finish() {
        hub.session_ended(&node_id, handle.id());
    }
    tracing::info!(node_id = %node_id, session = handle.id(), reason = %reason, "session disconnected");
    reason
}

async fn serve<S, K>(
    hub: &Hub,
    node_id: &NodeId,
    handle: &SessionHandle,
    shutdown: &mut ShutdownSignal,
    inbound: &mut S,
    outbound: &mut K,
) -> CloseReason
where
    S: Stream<Item = String> + Unpin,
    K: Sink<String> + Unpin,
    K::Error: Display,
{
    let limit = hub.config().session.write_timeout;
    loop {
        if handle.queue().is_closed() {
            return if hub.is_shutting_down() {
                CloseReason::Shutdown
            } else {
                CloseReason::Replaced
            };
        }
        for command in handle.queue().drain() {
            if let Err(reason) = deliver(outbound, &Frame::Command(command), limit, shutdown).await {
                return reason;
            }
        }

        tokio::select! {
            () = shutdown.wait() => return CloseReason::Shutdown,

            () = handle.queue().notified() => {}

            next = inbound.next() => {
                let Some(text) = next else {
                    return CloseReason::PeerClosed;
                };
                hub.nodes().touch(node_id);

                let frame = match protocol::decode(&text) {
                    Ok(frame) => frame,
                    Err(e) => return CloseReason::Violation(e.to_string()),
                };

                match frame {
                    Frame::Hello(hello) => {
                        let devices = hub.declare(node_id, hello);
                        tracing::debug!(node_id = %node_id, devices = devices.len(), "node re-declared");
                    }
                    Frame::StatePush { state } => hub.publish_state(node_id, state),
                    Frame::CommandResult { device, cmd, ok, error } => {
                        if ok {
                            tracing::debug!(node_id = %node_id, device = ?device, cmd = %cmd, "command applied");
                        } else {
                            tracing::warn!(node_id = %node_id, device = ?device, cmd = %cmd, error = ?error, "command failed on node");
                        }
                    }
                    Frame::Ping => {
                        if let Err(reason) = deliver(outbound, &Frame::Pong, limit, shutdown).await {
                            return reason;
                        }
                    }
                    other => {
                        return CloseReason::Violation(format!("unexpected {} frame from node", other.kind()));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(s: &str) -> NodeId {
        NodeId::parse(s).unwrap()
    }

    #[test]
    fn replacement_closes_previous() {
        let table = SessionTable::new();
        let first = table.open(&node("lamp"), 4);
        let second = table.open(&node("lamp"), 4);

        assert!(first.queue().is_closed());
        assert!(!second.queue().is_closed());
        assert_ne!(first.id(), second.id());
        assert_eq!(table.get(&node("lamp")).unwrap().id(), second.id());
    }

    #[test]
    fn only_current_session_releases() {
        let table = SessionTable::new();
        let first = table.open(&node("lamp"), 4);
        let second = table.open(&node("lamp"), 4);

        assert!(!table.release(&node("lamp"), first.id()));
        assert!(table.contains(&node("lamp")));
        assert!(table.release(&node("lamp"), second.id()));
        assert!(table.is_empty());
    }

    #[test]
    fn release_and_runs_only_for_current() {
        let table = SessionTable::new();
        let first = table.open(&node("lamp"), 4);
        let second = table.open(&node("lamp"), 4);

        assert_eq!(table.release_and(&node("lamp"), first.id(), || 1), None);
        assert!(table.contains(&node("lamp")));
        assert_eq!(table.release_and(&node("lamp"), second.id(), || 2), Some(2));
        assert!(!table.contains(&node("lamp")));
    }

    #[test]
    fn if_absent_skips_live_node() {
        let table = SessionTable::new();
        assert_eq!(table.if_absent(&node("lamp"), || "ran"), Some("ran"));

        table.open(&node("lamp"), 4);
        assert_eq!(table.if_absent(&node("lamp"), || "ran"), None);
    }

    #[test]
    fn finish_once() {
        let table = SessionTable::new();
        let handle = table.open(&node("lamp"), 4);
        let clone = handle.clone();

        assert!(handle.finish());
        assert!(!clone.finish());
    }

    #[test]
    fn close_forgets_and_stops() {
        let table = SessionTable::new();
        let handle = table.open(&node("lamp"), 4);

        assert!(table.close(&node("lamp")));
        assert!(!table.close(&node("lamp")));
        assert!(handle.queue().is_closed());
        assert!(!table.release(&node("lamp"), handle.id()));
    }

    #[test]
    fn close_all_keeps_entries_until_release() {
        let table = SessionTable::new();
        let a = table.open(&node("a"), 4);
        let b = table.open(&node("b"), 4);

        table.close_all();

        assert!(a.queue().is_closed() && b.queue().is_closed());
        assert_eq!(table.len(), 2);
    }
}
