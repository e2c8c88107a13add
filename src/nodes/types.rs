//! Node registry types

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::StateTree;
use crate::{Error, Result};

/// Longest node id the hub hands out
const MAX_NODE_ID_LENGTH: usize = 48;

/// Stable node identifier assigned at enrollment
///
/// Always a lowercase slug of `[a-z0-9-]`, so it never contains the `.`
/// that separates node and device in a [`crate::devices::DeviceKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    /// Validate an existing node id
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownNode` if the string is not a valid slug
    pub fn parse(s: &str) -> Result<Self> {
        let valid = !s.is_empty()
            && s.len() <= MAX_NODE_ID_LENGTH
            && s.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(Error::UnknownNode(s.to_string()))
        }
    }

    /// Derive a node id from a free-form label
    #[must_use]
    pub fn slugify(label: &str) -> Self {
        let mut slug = String::with_capacity(label.len());
        for c in label.trim().chars().flat_map(char::to_lowercase) {
            if c.is_ascii_alphanumeric() {
                slug.push(c);
            } else if !slug.is_empty() && !slug.ends_with('-') {
                slug.push('-');
            }
        }
        slug.truncate(MAX_NODE_ID_LENGTH);
        let slug = slug.trim_end_matches('-');

        if slug.is_empty() {
            Self("node".to_string())
        } else {
            Self(slug.to_string())
        }
    }

    /// Append a suffix, keeping within the length limit
    #[must_use]
    pub fn with_suffix(&self, suffix: &str) -> Self {
        let keep = MAX_NODE_ID_LENGTH.saturating_sub(suffix.len() + 1);
        let base = &self.0[..keep.min(self.0.len())];
        Self(format!("{}-{suffix}", base.trim_end_matches('-')))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for NodeId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

/// Session state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Socket open, hello not yet received
    Connecting,

    /// Hello accepted, live state flowing
    Connected,

    /// No live session
    #[default]
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// An action a node accepts, with its ordered argument names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Capabilities declared by a node in its hello frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Display name override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub actions: Vec<Action>,

    /// UI layout hints, passed through untouched
    #[serde(default)]
    pub layouts: Vec<StateTree>,
}

/// A known node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    /// Ed25519 public key the node enrolled with (base64)
    pub public_key: String,
    pub actions: Vec<Action>,
    pub layouts: Vec<StateTree>,
    /// Most recent full state published by the node
    pub state: StateTree,
    pub status: ConnectionStatus,
    pub enrolled_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Node {
    /// A freshly enrolled node that has never connected
    #[must_use]
    pub fn enrolled(id: NodeId, name: &str, public_key: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            public_key: public_key.to_string(),
            actions: Vec::new(),
            layouts: Vec::new(),
            state: StateTree::Null,
            status: ConnectionStatus::Disconnected,
            enrolled_at: Utc::now(),
            connected_at: None,
            last_seen: None,
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    /// Durable part of the node
    #[must_use]
    pub fn record(&self) -> NodeRecord {
        NodeRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            public_key: self.public_key.clone(),
            enrolled_at: self.enrolled_at,
        }
    }
}

/// Persisted node identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub name: String,
    pub public_key: String,
    pub enrolled_at: DateTime<Utc>,
}

impl From<NodeRecord> for Node {
    fn from(record: NodeRecord) -> Self {
        Self {
            enrolled_at: record.enrolled_at,
            ..Self::enrolled(record.id, &record.name, &record.public_key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_labels() {
        assert_eq!(NodeId::slugify("kitchen-light").as_str(), "kitchen-light");
        assert_eq!(NodeId::slugify("Kitchen Light").as_str(), "kitchen-light");
        assert_eq!(NodeId::slugify("  Hall // Sensor #2 ").as_str(), "hall-sensor-2");
        assert_eq!(NodeId::slugify("").as_str(), "node");
        assert_eq!(NodeId::slugify("***").as_str(), "node");
        assert_eq!(NodeId::slugify("a.b").as_str(), "a-b");
    }

    #[test]
    fn slug_length_is_bounded() {
        let long = "x".repeat(200);
        let id = NodeId::slugify(&long);
        assert_eq!(id.as_str().len(), MAX_NODE_ID_LENGTH);
        assert_eq!(id.with_suffix("abc123").as_str().len(), MAX_NODE_ID_LENGTH);
    }

    #[test]
    fn parse_rejects_invalid() {
        assert!(NodeId::parse("kitchen-light").is_ok());
        assert!(NodeId::parse("Kitchen").is_err());
        assert!(NodeId::parse("a.b").is_err());
        assert!(NodeId::parse("").is_err());
    }

    #[test]
    fn serde_validates() {
        let id: NodeId = serde_json::from_str(r#""lamp-1""#).unwrap();
        assert_eq!(id.as_str(), "lamp-1");
        assert!(serde_json::from_str::<NodeId>(r#""bad id""#).is_err());
    }

    #[test]
    fn descriptor_fields_default() {
        let d: NodeDescriptor = serde_json::from_str("{}").unwrap();
        assert!(d.actions.is_empty());
        assert!(d.layouts.is_empty());
        assert!(d.name.is_none());
    }
}
