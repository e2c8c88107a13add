//! Durable snapshot storage
//!
//! Device metadata and enrolled node identities live as JSON documents in
//! the hub data directory. Writes go to a sibling temp file that is renamed
//! over the target, so an interrupted write leaves the previous snapshot.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::devices::DeviceRecord;
use crate::nodes::NodeRecord;
use crate::{Error, Result};

const DEVICES_FILE: &str = "devices.json";
const NODES_FILE: &str = "nodes.json";
const IDENTITY_FILE: &str = "identity.json";

/// Point-in-time copy of everything the hub persists
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub nodes: Vec<NodeRecord>,
    pub devices: BTreeMap<String, DeviceRecord>,
}

/// File-backed snapshot store rooted at the data directory
#[derive(Debug, Clone)]
pub struct Store {
    dir: PathBuf,
}

impl Store {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the hub's signing identity
    #[must_use]
    pub fn identity_path(&self) -> PathBuf {
        self.dir.join(IDENTITY_FILE)
    }

    #[must_use]
    pub fn devices_path(&self) -> PathBuf {
        self.dir.join(DEVICES_FILE)
    }

    #[must_use]
    pub fn nodes_path(&self) -> PathBuf {
        self.dir.join(NODES_FILE)
    }

    /// Write both documents
    ///
    /// # Errors
    ///
    /// Returns error if the data directory or a file cannot be written
    pub fn write(&self, snapshot: &Snapshot) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        write_json_atomic(&self.nodes_path(), &snapshot.nodes)?;
        write_json_atomic(&self.devices_path(), &snapshot.devices)?;
        tracing::debug!(
            nodes = snapshot.nodes.len(),
            devices = snapshot.devices.len(),
            dir = %self.dir.display(),
            "snapshot written"
        );
        Ok(())
    }

    /// Raw device snapshot document
    ///
    /// Returns `None` when no snapshot exists yet or the file is not JSON;
    /// per-entry validation is left to the device registry.
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read
    pub fn read_devices(&self) -> Result<Option<serde_json::Value>> {
        read_json_document(&self.devices_path())
    }

    /// Enrolled node records, skipping malformed entries
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read
    pub fn read_nodes(&self) -> Result<Vec<NodeRecord>> {
        let Some(document) = read_json_document(&self.nodes_path())? else {
            return Ok(Vec::new());
        };

        let Some(entries) = document.as_array() else {
            let err = Error::SnapshotCorrupt("node snapshot is not an array".to_string());
            tracing::warn!(error = %err, "ignoring node snapshot");
            return Ok(Vec::new());
        };

        let records = entries
            .iter()
            .enumerate()
            .filter_map(|(i, value)| {
                serde_json::from_value::<NodeRecord>(value.clone())
                    .map_err(|e| {
                        let err = Error::SnapshotCorrupt(format!("node entry {i}: {e}"));
                        tracing::warn!(error = %err, "skipping snapshot entry");
                    })
                    .ok()
            })
            .collect();

        Ok(records)
    }
}

fn read_json_document(path: &Path) -> Result<Option<serde_json::Value>> {
    if !path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(path)?;
    match serde_json::from_str(&content) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            let err = Error::SnapshotCorrupt(format!("{}: {e}", path.display()));
            tracing::warn!(error = %err, "ignoring unreadable snapshot");
            Ok(None)
        }
    }
}

fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
