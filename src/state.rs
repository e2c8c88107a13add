//! Schema-less state tree published by nodes
//!
//! Nodes describe their devices with arbitrary JSON-shaped values whose
//! schema the hub never knows ahead of time. The same type carries
//! operator command arguments and opaque layout hints.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Recursive tagged value: object, array, string, number, boolean or null
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateTree {
    #[default]
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<StateTree>),
    Object(BTreeMap<String, StateTree>),
}

impl StateTree {
    /// An empty object, the usual root of a node's state
    #[must_use]
    pub const fn object() -> Self {
        Self::Object(BTreeMap::new())
    }

    /// Whether the tree carries no information
    ///
    /// Null as well as empty objects and arrays count as empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Array(items) => items.is_empty(),
            Self::Object(map) => map.is_empty(),
            Self::Bool(_) | Self::Number(_) | Self::String(_) => false,
        }
    }

    /// Child of an object node by key
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Self> {
        match self {
            Self::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Resolve a dotted path from this node
    ///
    /// Object members are addressed by key, array elements by numeric index.
    /// An empty path resolves to the node itself.
    #[must_use]
    pub fn path(&self, path: &str) -> Option<&Self> {
        if path.is_empty() {
            return Some(self);
        }

        path.split('.').try_fold(self, |node, segment| match node {
            Self::Object(map) => map.get(segment),
            Self::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }

    /// Owned copy of the sub-tree at `path`, or null when absent
    #[must_use]
    pub fn extract(&self, path: &str) -> Self {
        self.path(path).cloned().unwrap_or_default()
    }

    /// Convert into a `serde_json::Value`
    #[must_use]
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Number(n) => serde_json::Value::Number(n.clone()),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Array(items) => items.iter().map(Self::to_value).collect(),
            Self::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_value())).collect(),
            ),
        }
    }
}

impl From<serde_json::Value> for StateTree {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(Self::from).collect())
            }
            serde_json::Value::Object(map) => {
                Self::Object(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl From<&str> for StateTree {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<bool> for StateTree {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for StateTree {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sample() -> StateTree {
        StateTree::from(json!({
            "1": { "on": true, "level": 40 },
            "zone": { "kitchen": { "temp": 21.5 } },
            "outputs": [ { "on": false }, { "on": true } ]
        }))
    }

    #[test]
    fn path_resolves_object_members() {
        let tree = sample();
        assert_eq!(tree.path("1.on"), Some(&StateTree::Bool(true)));
        assert_eq!(
            tree.path("zone.kitchen.temp").map(StateTree::to_value),
            Some(json!(21.5))
        );
    }

    #[test]
    fn path_resolves_array_index() {
        let tree = sample();
        assert_eq!(tree.path("outputs.1.on"), Some(&StateTree::Bool(true)));
        assert!(tree.path("outputs.7").is_none());
        assert!(tree.path("outputs.first").is_none());
    }

    #[test]
    fn missing_path_extracts_null() {
        let tree = sample();
        assert_eq!(tree.extract("2"), StateTree::Null);
        assert_eq!(tree.extract("1.on.deeper"), StateTree::Null);
        assert!(tree.extract("nope").is_empty());
    }

    #[test]
    fn empty_path_is_root() {
        let tree = sample();
        assert_eq!(tree.path(""), Some(&tree));
    }

    #[test]
    fn emptiness() {
        assert!(StateTree::Null.is_empty());
        assert!(StateTree::object().is_empty());
        assert!(StateTree::Array(vec![]).is_empty());
        assert!(!StateTree::from(false).is_empty());
        assert!(!sample().is_empty());
    }

    #[test]
    fn deserializes_from_wire_json() {
        let tree: StateTree =
            serde_json::from_str(r#"{"a":[1,"two",null,{"b":false}]}"#).unwrap();
        let a = tree.get("a").unwrap();
        assert_eq!(a.path("1"), Some(&StateTree::from("two")));
        assert_eq!(a.path("2"), Some(&StateTree::Null));
        assert_eq!(a.path("3.b"), Some(&StateTree::Bool(false)));
        assert_eq!(tree.to_value(), json!({"a":[1,"two",null,{"b":false}]}));
    }
}
