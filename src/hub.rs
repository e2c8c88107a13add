//! The hub aggregate
//!
//! Owns the registries, the enrollment authority, the session table and
//! the snapshot store. Constructed once and shared as `Arc<Hub>` with the
//! HTTP layer and every session task.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::devices::{Device, DeviceKey, DeviceRegistry};
use crate::enrollment::{EnrollmentAuthority, EnrollmentHandle, EnrollmentPolicy, PendingRequest};
use crate::nodes::{Node, NodeId, NodeRegistry};
use crate::protocol::Hello;
use crate::router::{Command, CommandRouter};
use crate::security::{Credential, KeyIdentity};
use crate::session::SessionTable;
use crate::state::StateTree;
use crate::store::{Snapshot, Store};
use crate::{Error, Result};

/// Upper bound on waiting for sessions to close during shutdown
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// View of the hub's shutdown flag held by long-running tasks
#[derive(Debug, Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

impl ShutdownSignal {
    /// Resolve once shutdown has begun, immediately if it already has
    pub async fn wait(&mut self) {
        loop {
            let stop = *self.0.borrow_and_update();
            if stop || self.0.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Central coordination state
#[derive(Debug)]
pub struct Hub {
    config: Config,
    identity: KeyIdentity,
    nodes: NodeRegistry,
    devices: DeviceRegistry,
    enrollment: EnrollmentAuthority,
    sessions: SessionTable,
    store: Store,
    shutdown: watch::Sender<bool>,
    dirty: AtomicBool,
    changed: Notify,
    drained: Notify,
    persist_lock: Mutex<()>,
}

impl Hub {
    /// Open the hub rooted at `config.data_dir`
    ///
    /// Loads or creates the hub identity and restores enrolled nodes and
    /// device metadata. Everything restored starts offline.
    ///
    /// # Errors
    ///
    /// Returns error if the data directory or identity cannot be read or
    /// created
    pub fn open(config: Config) -> Result<Arc<Self>> {
        let store = Store::new(&config.data_dir);
        std::fs::create_dir_all(store.dir())?;

        let identity = KeyIdentity::load_or_create(&store.identity_path(), &config.name)?;

        let nodes = NodeRegistry::new();
        let restored = nodes.restore(store.read_nodes()?);

        let devices = DeviceRegistry::new();
        let report = store
            .read_devices()?
            .map(|document| devices.load_snapshot(&document))
            .unwrap_or_default();

        tracing::info!(
            hub = %config.name,
            fingerprint = %identity.short_id(),
            data_dir = %store.dir().display(),
            nodes = restored,
            devices = report.loaded,
            skipped = report.skipped,
            enrollment = %config.enrollment,
            "hub opened"
        );

        let public = identity.public_only();
        let enrollment = EnrollmentAuthority::new(identity, config.enrollment);
        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            identity: public,
            nodes,
            devices,
            enrollment,
            sessions: SessionTable::new(),
            store,
            shutdown,
            dirty: AtomicBool::new(false),
            changed: Notify::new(),
            drained: Notify::new(),
            persist_lock: Mutex::new(()),
        }))
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Public half of the hub identity
    #[must_use]
    pub const fn identity(&self) -> &KeyIdentity {
        &self.identity
    }

    /// Public key credentials are checked against
    #[must_use]
    pub fn hub_key(&self) -> &str {
        self.enrollment.hub_key()
    }

    #[must_use]
    pub const fn nodes(&self) -> &NodeRegistry {
        &self.nodes
    }

    #[must_use]
    pub const fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    #[must_use]
    pub const fn enrollment(&self) -> &EnrollmentAuthority {
        &self.enrollment
    }

    #[must_use]
    pub const fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    #[must_use]
    pub const fn store(&self) -> &Store {
        &self.store
    }

    #[must_use]
    pub const fn router(&self) -> CommandRouter<'_> {
        CommandRouter::new(&self.devices, &self.nodes, &self.sessions)
    }

    /// Signal that resolves when the hub begins shutting down
    #[must_use]
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        ShutdownSignal(self.shutdown.subscribe())
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    // Enrollment

    /// Register an enrollment request
    ///
    /// Under the `auto` policy the request is accepted before this returns
    /// and the outcome is already delivered to the handle's receiver.
    ///
    /// # Errors
    ///
    /// Returns `Error::DuplicateRequest` if the key already has a pending
    /// request, or `Error::Auth` if the key is malformed
    pub fn request_enrollment(&self, handle: EnrollmentHandle) -> Result<String> {
        let id = self.enrollment.request(handle)?;
        if self.enrollment.policy() == EnrollmentPolicy::Auto {
            self.accept_enrollment(&id)?;
        }
        Ok(id)
    }

    #[must_use]
    pub fn pending_enrollments(&self) -> Vec<PendingRequest> {
        self.enrollment.pending()
    }

    /// Accept a pending request
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownRequest` if already resolved or nonexistent
    pub fn accept_enrollment(&self, id: &str) -> Result<Credential> {
        let credential = self.enrollment.accept(id, &self.nodes)?;
        tracing::info!(node_id = %credential.node_id, "node enrolled");
        self.mark_dirty();
        Ok(credential)
    }

    /// Reject a pending request
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownRequest` if already resolved or nonexistent
    pub fn reject_enrollment(&self, id: &str, reason: &str) -> Result<()> {
        self.enrollment.reject(id, reason)
    }

    /// Withdraw a request whose bootstrap connection dropped
    pub fn withdraw_enrollment(&self, id: &str) -> bool {
        self.enrollment.withdraw(id)
    }

    // Session callbacks

    /// Apply a hello: node declaration, initial state and devices
    ///
    /// Returns the resulting device records. A node removed while its
    /// session was still winding down is not re-created.
    pub fn declare(&self, node_id: &NodeId, hello: Hello) -> Vec<Device> {
        if !self.nodes.contains(node_id) {
            tracing::debug!(node_id = %node_id, "ignoring hello from removed node");
            return Vec::new();
        }

        self.nodes.upsert(node_id, hello.node);
        if let Err(e) = self.nodes.set_state(node_id, hello.state) {
            tracing::debug!(node_id = %node_id, error = %e, "state not applied");
        }

        let devices = hello
            .devices
            .into_iter()
            .filter(|d| {
                let valid = !d.id.is_empty();
                if !valid {
                    tracing::warn!(node_id = %node_id, "skipping device declared without id");
                }
                valid
            })
            .map(|d| self.devices.add(node_id, d))
            .collect();
        self.devices.set_online_by_node(node_id);
        self.mark_dirty();
        devices
    }

    /// Replace a node's published state
    pub fn publish_state(&self, node_id: &NodeId, state: StateTree) {
        if let Err(e) = self.nodes.set_state(node_id, state) {
            tracing::debug!(node_id = %node_id, error = %e, "state push dropped");
        }
    }

    /// A session closed before its hello was accepted
    pub fn connect_abandoned(&self, node_id: &NodeId) {
        self.sessions.if_absent(node_id, || self.node_disconnected(node_id));
        self.drained.notify_waiters();
    }

    /// A session that completed its hello has ended
    ///
    /// Only the node's current session cascades the disconnect; a session
    /// that was replaced leaves the node to its successor. The cascade runs
    /// under the session table lock, so a reconnect cannot slip in between
    /// the release and the offline marking.
    pub fn session_ended(&self, node_id: &NodeId, session: u64) {
        self.sessions.release_and(node_id, session, || self.node_disconnected(node_id));
        self.drained.notify_waiters();
    }

    /// Mark a node disconnected and cascade offline status to its devices
    ///
    /// Returns exactly the devices that went offline.
    pub fn node_disconnected(&self, node_id: &NodeId) -> Vec<Device> {
        if let Err(e) = self.nodes.mark_disconnected(node_id) {
            tracing::debug!(node_id = %node_id, error = %e, "disconnect of unknown node");
        }
        let affected = self.devices.set_offline_by_node(node_id);
        tracing::info!(node_id = %node_id, devices = affected.len(), "node offline");
        affected
    }

    // Operator actions

    /// Route a command to its devices' nodes
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownDevice` or `Error::NodeUnavailable`
    pub fn route(&self, command: &Command) -> Result<usize> {
        self.router().route(command)
    }

    /// Every device with derived online flag and live state
    #[must_use]
    pub fn devices_with_state(&self) -> BTreeMap<DeviceKey, Device> {
        self.devices.all_with_state(&self.nodes)
    }

    /// One device with derived online flag and live state
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownDevice` if no such device exists
    pub fn device_with_state(&self, key: &DeviceKey) -> Result<Device> {
        self.devices
            .get_with_state(key, &self.nodes)
            .ok_or_else(|| Error::UnknownDevice(key.to_string()))
    }

    /// Edit a device's name and/or tags
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownDevice` if no such device exists
    pub fn update_device(
        &self,
        key: &DeviceKey,
        name: Option<String>,
        tags: Option<BTreeSet<String>>,
    ) -> Result<Device> {
        let device = self.devices.update_metadata(key, name, tags)?;
        self.mark_dirty();
        Ok(device)
    }

    /// Delete a device permanently
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownDevice` if no such device exists
    pub fn remove_device(&self, key: &DeviceKey) -> Result<Device> {
        let device = self.devices.remove(key)?;
        tracing::info!(device = %key, "device removed");
        self.mark_dirty();
        Ok(device)
    }

    /// Forget a node and its devices, closing any live session
    ///
    /// The node's credential stops working: sessions are only opened for
    /// known node ids.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownNode` if no such node exists
    pub fn remove_node(&self, node_id: &NodeId) -> Result<Node> {
        let node = self
            .nodes
            .remove(node_id)
            .ok_or_else(|| Error::UnknownNode(node_id.to_string()))?;
        self.sessions.close(node_id);
        let devices = self.devices.remove_by_node(node_id);
        tracing::info!(node_id = %node_id, devices = devices.len(), "node removed");
        self.mark_dirty();
        Ok(node)
    }

    // Persistence

    /// Record that durable data changed
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
        self.changed.notify_one();
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Point-in-time copy of the durable state
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            nodes: self.nodes.records(),
            devices: self.devices.save_snapshot(),
        }
    }

    /// Write a snapshot to disk
    ///
    /// The copy is taken under brief registry read locks; the write runs on
    /// the blocking pool with no registry lock held.
    ///
    /// # Errors
    ///
    /// Returns error if the snapshot cannot be written
    pub async fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        self.dirty.store(false, Ordering::Release);

        let snapshot = self.snapshot();
        let store = self.store.clone();
        let written = tokio::task::spawn_blocking(move || store.write(&snapshot))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;

        if written.is_err() {
            self.dirty.store(true, Ordering::Release);
        }
        written
    }

    /// Spawn the background snapshot writer
    ///
    /// Writes after changes (debounced) and on a fixed interval, until
    /// shutdown begins.
    pub fn spawn_persister(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut shutdown = hub.shutdown_signal();
            let debounce = hub.config.persistence.debounce;
            let mut interval = tokio::time::interval(hub.config.persistence.snapshot_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;

            loop {
                tokio::select! {
                    () = shutdown.wait() => break,
                    () = hub.changed.notified() => {
                        tokio::time::sleep(debounce).await;
                        if !hub.is_dirty() {
                            continue;
                        }
                    }
                    _ = interval.tick() => {}
                }

                if let Err(e) = hub.persist().await {
                    tracing::warn!(error = %e, "snapshot write failed");
                }
            }
            tracing::debug!("persister stopped");
        })
    }

    /// Signal shutdown and ask every session to close
    ///
    /// Operator changes still land after this; [`shutdown`](Self::shutdown)
    /// flushes them.
    pub fn begin_shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            tracing::info!(sessions = self.sessions.len(), "hub shutting down");
        }
        self.sessions.close_all();
    }

    /// Stop every session and flush a final snapshot
    ///
    /// Waits at most a few seconds for sessions to drain. Call once no more
    /// operator requests can arrive.
    ///
    /// # Errors
    ///
    /// Returns error if the final snapshot cannot be written
    pub async fn shutdown(&self) -> Result<()> {
        self.begin_shutdown();

        let drained = tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, async {
            while !self.sessions.is_empty() {
                let notified = self.drained.notified();
                if self.sessions.is_empty() {
                    break;
                }
                let _ = tokio::time::timeout(Duration::from_millis(50), notified).await;
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(remaining = self.sessions.len(), "sessions did not drain in time");
        }

        self.persist().await
    }
}
