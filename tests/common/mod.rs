//! Shared test utilities

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use hearth_hub::protocol::{self, Frame, Hello};
use hearth_hub::session::bootstrap::{self, BootstrapEnd};
use hearth_hub::session::{self, CloseReason};
use hearth_hub::{
    Config, Credential, DeviceDescriptor, EnrollmentHandle, Hub, KeyIdentity, NodeDescriptor,
    NodeId, StateTree,
};
use tokio::task::JoinHandle;

/// Config rooted at `dir` with a short hello grace period
#[must_use]
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::with_data_dir(dir);
    config.session.hello_grace = Duration::from_millis(300);
    config.session.write_timeout = Duration::from_millis(200);
    config.persistence.debounce = Duration::from_millis(10);
    config
}

/// Open a hub in `dir`
#[must_use]
pub fn open_hub(dir: &Path) -> Arc<Hub> {
    Hub::open(test_config(dir)).expect("failed to open hub")
}

/// A node process as seen from the hub's side of the wire
pub struct TestNode {
    pub key: KeyIdentity,
    pub credential: Credential,
}

impl TestNode {
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.credential.node_id.clone()
    }

    /// Hello answering `nonce`
    #[must_use]
    pub fn hello(&self, nonce: &str, devices: Vec<DeviceDescriptor>, state: serde_json::Value) -> Frame {
        Frame::Hello(Hello {
            credential: self.credential.clone(),
            proof: self.key.sign(nonce.as_bytes()).expect("sign nonce"),
            node: NodeDescriptor::default(),
            devices,
            state: StateTree::from(state),
        })
    }
}

/// Enroll and accept a node labelled `label`
#[must_use]
pub fn enroll(hub: &Hub, label: &str) -> TestNode {
    let key = KeyIdentity::generate(label);
    let request = hub
        .request_enrollment(EnrollmentHandle::detached(
            key.public_key.clone(),
            Some(label.to_string()),
        ))
        .expect("enrollment request");
    let credential = hub.accept_enrollment(&request).expect("accept");
    TestNode { key, credential }
}

#[must_use]
pub fn device(id: &str, kind: &str) -> DeviceDescriptor {
    DeviceDescriptor {
        id: id.to_string(),
        kind: kind.to_string(),
        ..DeviceDescriptor::default()
    }
}

/// In-memory channel to a hub task: the test plays the node
pub struct Pipe<T = CloseReason> {
    pub to_hub: mpsc::Sender<String>,
    pub from_hub: mpsc::Receiver<String>,
    pub task: JoinHandle<T>,
}

impl Pipe<CloseReason> {
    /// Start a session task for `node_id`
    #[must_use]
    pub fn open(hub: &Arc<Hub>, node_id: NodeId) -> Self {
        Self::with_capacity(hub, node_id, 64)
    }

    /// Session whose outbound channel holds `capacity` unread frames
    /// (plus one per sender) before writes block
    #[must_use]
    pub fn with_capacity(hub: &Arc<Hub>, node_id: NodeId, capacity: usize) -> Self {
        let (to_hub, inbound) = mpsc::channel::<String>(64);
        let (outbound, from_hub) = mpsc::channel::<String>(capacity);
        let task = tokio::spawn(session::run(hub.clone(), node_id, inbound, outbound));
        Self {
            to_hub,
            from_hub,
            task,
        }
    }

    /// Read the challenge nonce
    pub async fn challenge(&mut self) -> String {
        match self.recv().await {
            Frame::Challenge { nonce } => nonce,
            other => panic!("expected challenge, got {other:?}"),
        }
    }

    /// Complete the handshake as `node`
    pub async fn handshake(
        &mut self,
        node: &TestNode,
        devices: Vec<DeviceDescriptor>,
        state: serde_json::Value,
    ) {
        let nonce = self.challenge().await;
        self.send(&node.hello(&nonce, devices, state)).await;
        match self.recv().await {
            Frame::Welcome { node_id } => assert_eq!(node_id, node.id()),
            other => panic!("expected welcome, got {other:?}"),
        }
    }

    /// Round-trip a ping; every frame sent before it has been applied
    pub async fn sync(&mut self) {
        self.send(&Frame::Ping).await;
        match self.recv().await {
            Frame::Pong => {}
            other => panic!("expected pong, got {other:?}"),
        }
    }
}

impl Pipe<BootstrapEnd> {
    /// Start a bootstrap exchange on an enrollment channel
    #[must_use]
    pub fn bootstrap(hub: &Arc<Hub>) -> Self {
        let (to_hub, inbound) = mpsc::channel::<String>(64);
        let (outbound, from_hub) = mpsc::channel::<String>(64);
        let task = tokio::spawn(bootstrap::run(hub.clone(), inbound, outbound));
        Self {
            to_hub,
            from_hub,
            task,
        }
    }

    /// Send an enrollment request and return the pending request id
    pub async fn request(&mut self, key: &KeyIdentity, name: &str) -> String {
        self.send(&Frame::EnrollmentRequest {
            name: Some(name.to_string()),
            public_key: key.public_key.clone(),
        })
        .await;
        match self.recv().await {
            Frame::EnrollmentPending { request_id } => request_id,
            other => panic!("expected enrollment_pending, got {other:?}"),
        }
    }
}

impl<T> Pipe<T> {
    pub async fn send(&mut self, frame: &Frame) {
        let text = protocol::encode(frame).expect("encode");
        self.to_hub.send(text).await.expect("session gone");
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.to_hub.send(text.to_string()).await.expect("session gone");
    }

    /// Next frame from the hub, failing after two seconds
    pub async fn recv(&mut self) -> Frame {
        let text = tokio::time::timeout(Duration::from_secs(2), self.from_hub.next())
            .await
            .expect("timed out waiting for frame")
            .expect("session closed");
        protocol::decode(&text).expect("decode")
    }

    /// Hang up and wait for the session task to finish
    pub async fn close(self) -> T {
        drop(self.to_hub);
        tokio::time::timeout(Duration::from_secs(2), self.task)
            .await
            .expect("session did not end")
            .expect("session task panicked")
    }

    /// Wait for the session to end on its own
    pub async fn finished(self) -> T {
        tokio::time::timeout(Duration::from_secs(2), self.task)
            .await
            .expect("session did not end")
            .expect("session task panicked")
    }
}
