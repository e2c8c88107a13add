//! Device registry types

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::nodes::NodeId;
use crate::state::StateTree;
use crate::{Error, Result};

/// Composite device key: owning node plus node-local id
///
/// Rendered as `<node>.<id>`. Node ids never contain a dot, so the key
/// splits unambiguously at the first one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceKey {
    pub node: NodeId,
    pub id: String,
}

impl DeviceKey {
    #[must_use]
    pub fn new(node: NodeId, id: impl Into<String>) -> Self {
        Self {
            node,
            id: id.into(),
        }
    }

    /// Parse `<node>.<id>`
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownDevice` if the key is malformed
    pub fn parse(s: &str) -> Result<Self> {
        let (node, id) = s
            .split_once('.')
            .ok_or_else(|| Error::UnknownDevice(s.to_string()))?;
        if id.is_empty() {
            return Err(Error::UnknownDevice(s.to_string()));
        }
        let node = NodeId::parse(node).map_err(|_| Error::UnknownDevice(s.to_string()))?;
        Ok(Self::new(node, id))
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.id)
    }
}

impl FromStr for DeviceKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DeviceKey {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<DeviceKey> for String {
    fn from(key: DeviceKey) -> Self {
        key.to_string()
    }
}

/// Device as declared by its node in a hello frame
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Node-local id, also the path of the device inside the node state
    pub id: String,

    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeSet<String>>,

    /// Capabilities such as `on_off` or `brightness`
    #[serde(default)]
    pub traits: Vec<String>,
}

/// A logical device owned by a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub node: NodeId,
    pub id: String,

    /// Type tag, refreshed on every declaration
    #[serde(rename = "type")]
    pub kind: String,

    /// Operator-owned display name
    pub name: String,

    /// Operator-owned labels
    pub tags: BTreeSet<String>,

    pub traits: Vec<String>,

    /// Mirrors the owning node's connection status
    pub online: bool,

    /// Sub-tree of the owning node's state at this device's path
    pub state: StateTree,
}

impl Device {
    /// Build a new online device from a declaration
    #[must_use]
    pub fn from_descriptor(node: NodeId, descriptor: DeviceDescriptor) -> Self {
        Self {
            name: descriptor.name.unwrap_or_else(|| descriptor.id.clone()),
            tags: descriptor.tags.unwrap_or_default(),
            node,
            id: descriptor.id,
            kind: descriptor.kind,
            traits: descriptor.traits,
            online: true,
            state: StateTree::Null,
        }
    }

    #[must_use]
    pub fn key(&self) -> DeviceKey {
        DeviceKey::new(self.node.clone(), self.id.clone())
    }

    /// Durable part of the device
    #[must_use]
    pub fn record(&self) -> DeviceRecord {
        DeviceRecord {
            kind: self.kind.clone(),
            node: self.node.clone(),
            id: self.id.clone(),
            name: self.name.clone(),
            tags: self.tags.clone(),
        }
    }
}

/// Persisted device metadata
///
/// Online flag and live state are never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub node: NodeId,
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl From<DeviceRecord> for Device {
    fn from(record: DeviceRecord) -> Self {
        Self {
            node: record.node,
            id: record.id,
            kind: record.kind,
            name: record.name,
            tags: record.tags,
            traits: Vec::new(),
            online: false,
            state: StateTree::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_display_and_parse() {
        let key = DeviceKey::parse("kitchen-light.1").unwrap();
        assert_eq!(key.node.as_str(), "kitchen-light");
        assert_eq!(key.id, "1");
        assert_eq!(key.to_string(), "kitchen-light.1");
    }

    #[test]
    fn key_splits_at_first_dot() {
        let key = DeviceKey::parse("hvac.zone.kitchen").unwrap();
        assert_eq!(key.node.as_str(), "hvac");
        assert_eq!(key.id, "zone.kitchen");
    }

    #[test]
    fn malformed_keys_rejected() {
        for bad in ["nodot", "lamp.", ".1", "Bad Node.1"] {
            assert!(
                matches!(DeviceKey::parse(bad), Err(Error::UnknownDevice(_))),
                "accepted {bad}"
            );
        }
    }

    #[test]
    fn descriptor_defaults_name_to_id() {
        let d: DeviceDescriptor = serde_json::from_str(r#"{"id":"1","type":"dimmer"}"#).unwrap();
        let device = Device::from_descriptor(NodeId::parse("lamp").unwrap(), d);
        assert_eq!(device.name, "1");
        assert_eq!(device.kind, "dimmer");
        assert!(device.tags.is_empty());
        assert!(device.online);
    }

    #[test]
    fn record_uses_type_field_name() {
        let device = Device::from_descriptor(
            NodeId::parse("lamp").unwrap(),
            DeviceDescriptor {
                id: "1".to_string(),
                kind: "dimmer".to_string(),
                ..Default::default()
            },
        );
        let json = serde_json::to_value(device.record()).unwrap();
        assert_eq!(json["type"], "dimmer");
        assert_eq!(json["node"], "lamp");
        assert!(json.get("online").is_none());
    }
}
