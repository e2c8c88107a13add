//! Device registry
//!
//! Owns durable device metadata. Online flags and live state are derived
//! from the node registry on read and never persisted.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::types::{Device, DeviceDescriptor, DeviceKey, DeviceRecord};
use crate::nodes::{NodeId, NodeRegistry};
use crate::state::StateTree;
use crate::{Error, Result};

/// Outcome of restoring a snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    pub skipped: usize,
}

/// Registry of logical devices keyed by (node, local id)
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<DeviceKey, Device>>,
}

impl DeviceRegistry {
    /// Create a new empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<DeviceKey, Device>> {
        self.devices.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<DeviceKey, Device>> {
        self.devices.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Merge-upsert a device declared by `node`
    ///
    /// An existing record keeps its operator-set name and tags; type and
    /// traits come from the new declaration.
    pub fn add(&self, node: &NodeId, descriptor: DeviceDescriptor) -> Device {
        let mut device = Device::from_descriptor(node.clone(), descriptor);
        let key = device.key();

        let mut devices = self.write();
        if let Some(existing) = devices.get(&key) {
            device.name.clone_from(&existing.name);
            device.tags.clone_from(&existing.tags);
        }
        devices.insert(key, device.clone());
        device
    }

    /// Delete a device permanently (operator action)
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownDevice` if no such device exists
    pub fn remove(&self, key: &DeviceKey) -> Result<Device> {
        self.write()
            .remove(key)
            .ok_or_else(|| Error::UnknownDevice(key.to_string()))
    }

    /// Delete every device owned by `node`, returning them ordered by key
    pub fn remove_by_node(&self, node: &NodeId) -> Vec<Device> {
        let mut devices = self.write();
        let keys: Vec<DeviceKey> = devices.keys().filter(|k| &k.node == node).cloned().collect();
        let mut removed: Vec<Device> = keys.iter().filter_map(|k| devices.remove(k)).collect();
        removed.sort_by_key(Device::key);
        removed
    }

    /// Operator edit of name and/or tags
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownDevice` if no such device exists
    pub fn update_metadata(
        &self,
        key: &DeviceKey,
        name: Option<String>,
        tags: Option<BTreeSet<String>>,
    ) -> Result<Device> {
        let mut devices = self.write();
        let device = devices
            .get_mut(key)
            .ok_or_else(|| Error::UnknownDevice(key.to_string()))?;
        if let Some(name) = name {
            device.name = name;
        }
        if let Some(tags) = tags {
            device.tags = tags;
        }
        Ok(device.clone())
    }

    /// Mark every device of `node` offline
    ///
    /// Returns exactly the affected devices, ordered by key, so callers can
    /// push deltas without rescanning the registry.
    pub fn set_offline_by_node(&self, node: &NodeId) -> Vec<Device> {
        let mut devices = self.write();
        let mut affected: Vec<Device> = devices
            .values_mut()
            .filter(|d| &d.node == node)
            .map(|d| {
                d.online = false;
                d.state = StateTree::Null;
                d.clone()
            })
            .collect();
        affected.sort_by_key(Device::key);
        affected
    }

    /// Mark every device of `node` online
    pub fn set_online_by_node(&self, node: &NodeId) {
        for device in self.write().values_mut().filter(|d| &d.node == node) {
            device.online = true;
        }
    }

    /// Owning node of a device
    #[must_use]
    pub fn owner(&self, key: &DeviceKey) -> Option<NodeId> {
        self.read().get(key).map(|d| d.node.clone())
    }

    /// Stored copy of a device, without live state
    #[must_use]
    pub fn get(&self, key: &DeviceKey) -> Option<Device> {
        self.read().get(key).cloned()
    }

    /// Devices owned by `node`, ordered by key
    #[must_use]
    pub fn by_node(&self, node: &NodeId) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .read()
            .values()
            .filter(|d| &d.node == node)
            .cloned()
            .collect();
        devices.sort_by_key(Device::key);
        devices
    }

    /// Every device with online flag and live state derived from `nodes`
    ///
    /// The node registry is copied once per call; that copy is the point at
    /// which connection status is observed. A device whose node is unknown
    /// or not connected is reported offline with an empty state.
    #[must_use]
    pub fn all_with_state(&self, nodes: &NodeRegistry) -> BTreeMap<DeviceKey, Device> {
        let devices: Vec<Device> = self.read().values().cloned().collect();
        let nodes = nodes.snapshot();

        devices
            .into_iter()
            .map(|mut device| {
                match nodes.get(&device.node).filter(|n| n.is_connected()) {
                    Some(node) => {
                        device.online = true;
                        device.state = node.state.extract(&device.id);
                    }
                    None => {
                        device.online = false;
                        device.state = StateTree::Null;
                    }
                }
                (device.key(), device)
            })
            .collect()
    }

    /// One device with live state, same rules as [`Self::all_with_state`]
    #[must_use]
    pub fn get_with_state(&self, key: &DeviceKey, nodes: &NodeRegistry) -> Option<Device> {
        let mut device = self.get(key)?;
        match nodes.get(&device.node).filter(crate::nodes::Node::is_connected) {
            Some(node) => {
                device.online = true;
                device.state = node.state.extract(&device.id);
            }
            None => {
                device.online = false;
                device.state = StateTree::Null;
            }
        }
        Some(device)
    }

    /// Point-in-time copy of the durable attributes, keyed by device key
    #[must_use]
    pub fn save_snapshot(&self) -> BTreeMap<String, DeviceRecord> {
        self.read()
            .iter()
            .map(|(key, device)| (key.to_string(), device.record()))
            .collect()
    }

    /// Restore durable attributes from a snapshot document
    ///
    /// Malformed entries are skipped with a warning. Restored devices are
    /// offline with empty state; entries already present are left alone.
    pub fn load_snapshot(&self, snapshot: &serde_json::Value) -> LoadReport {
        let mut report = LoadReport::default();

        let Some(entries) = snapshot.as_object() else {
            let err = Error::SnapshotCorrupt("device snapshot is not an object".to_string());
            tracing::warn!(error = %err, "ignoring device snapshot");
            report.skipped = 1;
            return report;
        };

        let mut devices = self.write();
        for (entry_key, value) in entries {
            let record = match serde_json::from_value::<DeviceRecord>(value.clone()) {
                Ok(record) if !record.id.is_empty() => record,
                Ok(_) => {
                    let err = Error::SnapshotCorrupt(format!("{entry_key}: empty device id"));
                    tracing::warn!(error = %err, "skipping snapshot entry");
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    let err = Error::SnapshotCorrupt(format!("{entry_key}: {e}"));
                    tracing::warn!(error = %err, "skipping snapshot entry");
                    report.skipped += 1;
                    continue;
                }
            };

            let device = Device::from(record);
            devices.entry(device.key()).or_insert(device);
            report.loaded += 1;
        }

        report
    }

    /// Number of devices
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
