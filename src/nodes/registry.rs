//! Node registry for tracking enrolled and connected nodes

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use uuid::Uuid;

use super::types::{ConnectionStatus, Node, NodeDescriptor, NodeId, NodeRecord};
use crate::security::fingerprint;
use crate::state::StateTree;
use crate::{Error, Result};

/// Registry of known nodes
///
/// Mutations are serialized by one reader/writer lock that is only held for
/// the map operation itself. Every read returns an owned copy.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<NodeId, Node>>,
}

impl NodeRegistry {
    /// Create a new empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<NodeId, Node>> {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<NodeId, Node>> {
        self.nodes.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a newly enrolled node as known but not connected
    ///
    /// The id is derived from `label`. A public key that is already enrolled
    /// gets its existing id back; a slug taken by another key is suffixed
    /// with the key fingerprint. Allocation and insertion happen under one
    /// write lock so concurrent enrollments never share an id.
    pub fn enroll(&self, label: Option<&str>, public_key: &str) -> Node {
        let mut nodes = self.write();

        if let Some(node) = nodes.values_mut().find(|n| n.public_key == public_key) {
            if let Some(label) = label {
                node.name = label.to_string();
            }
            return node.clone();
        }

        let base = NodeId::slugify(label.unwrap_or_default());
        let id = if nodes.contains_key(&base) {
            let suffix = fingerprint(public_key)
                .map(|f| f[..6].to_string())
                .unwrap_or_else(|_| Uuid::new_v4().simple().to_string()[..6].to_string());
            let candidate = base.with_suffix(&suffix);
            if nodes.contains_key(&candidate) {
                base.with_suffix(&Uuid::new_v4().simple().to_string()[..8])
            } else {
                candidate
            }
        } else {
            base
        };

        let name = label.map_or_else(|| id.to_string(), ToString::to_string);
        let node = Node::enrolled(id.clone(), &name, public_key);
        nodes.insert(id, node.clone());
        node
    }

    /// Restore persisted nodes, all offline
    pub fn restore(&self, records: Vec<NodeRecord>) -> usize {
        let mut nodes = self.write();
        let mut restored = 0;
        for record in records {
            nodes.entry(record.id.clone()).or_insert_with(|| {
                restored += 1;
                Node::from(record)
            });
        }
        restored
    }

    #[must_use]
    pub fn contains(&self, id: &NodeId) -> bool {
        self.read().contains_key(id)
    }

    /// Move a disconnected node to `Connecting` when a socket opens
    ///
    /// A node that is already connected keeps its status until the new
    /// session proves itself with a hello.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownNode` if the node was never enrolled
    pub fn mark_connecting(&self, id: &NodeId) -> Result<()> {
        let mut nodes = self.write();
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| Error::UnknownNode(id.to_string()))?;
        if node.status == ConnectionStatus::Disconnected {
            node.status = ConnectionStatus::Connecting;
        }
        Ok(())
    }

    /// Create or update a node's declaration and move it to `Connected`
    ///
    /// Idempotent: repeating the same descriptor leaves the same record.
    pub fn upsert(&self, id: &NodeId, descriptor: NodeDescriptor) -> Node {
        let now = Utc::now();
        let mut nodes = self.write();
        let node = nodes
            .entry(id.clone())
            .or_insert_with(|| Node::enrolled(id.clone(), id.as_str(), ""));

        if let Some(name) = descriptor.name {
            node.name = name;
        }
        node.actions = descriptor.actions;
        node.layouts = descriptor.layouts;
        if node.status != ConnectionStatus::Connected {
            node.connected_at = Some(now);
        }
        node.status = ConnectionStatus::Connected;
        node.last_seen = Some(now);
        node.clone()
    }

    /// Replace a node's published state wholesale
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownNode` if the node is not registered
    pub fn set_state(&self, id: &NodeId, state: StateTree) -> Result<()> {
        let mut nodes = self.write();
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| Error::UnknownNode(id.to_string()))?;
        node.state = state;
        node.last_seen = Some(Utc::now());
        Ok(())
    }

    /// Refresh the last-seen timestamp
    pub fn touch(&self, id: &NodeId) {
        if let Some(node) = self.write().get_mut(id) {
            node.last_seen = Some(Utc::now());
        }
    }

    /// Mark a node disconnected, keeping its last known state
    ///
    /// Returns true if the status changed.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownNode` if the node is not registered
    pub fn mark_disconnected(&self, id: &NodeId) -> Result<bool> {
        let mut nodes = self.write();
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| Error::UnknownNode(id.to_string()))?;
        let changed = node.status != ConnectionStatus::Disconnected;
        node.status = ConnectionStatus::Disconnected;
        Ok(changed)
    }

    /// Get a copy of a node by id
    #[must_use]
    pub fn get(&self, id: &NodeId) -> Option<Node> {
        self.read().get(id).cloned()
    }

    /// Snapshot of every known node, ordered by id
    #[must_use]
    pub fn all(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.read().values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Snapshot keyed by id
    #[must_use]
    pub fn snapshot(&self) -> HashMap<NodeId, Node> {
        self.read().clone()
    }

    /// Durable records for persistence, ordered by id
    #[must_use]
    pub fn records(&self) -> Vec<NodeRecord> {
        let mut records: Vec<NodeRecord> = self.read().values().map(Node::record).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Forget a node (operator action)
    pub fn remove(&self, id: &NodeId) -> Option<Node> {
        self.write().remove(id)
    }

    /// Number of known nodes
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
