//! TOML configuration file loading
//!
//! Supports `~/.config/hearth/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct HearthConfigFile {
    /// Listener and operator API
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Hub identity and storage
    #[serde(default)]
    pub hub: HubFileConfig,

    #[serde(default)]
    pub enrollment: EnrollmentFileConfig,

    /// Node session tuning
    #[serde(default)]
    pub session: SessionFileConfig,

    /// Snapshot scheduling
    #[serde(default)]
    pub persistence: PersistenceFileConfig,
}

/// Server configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// Bind address
    pub host: Option<String>,

    /// Listen port
    pub port: Option<u16>,

    /// Bearer token for operator routes
    pub api_key: Option<String>,
}

/// Hub configuration
#[derive(Debug, Default, Deserialize)]
pub struct HubFileConfig {
    /// Display name
    pub name: Option<String>,

    /// Directory for identity and snapshots
    pub data_dir: Option<String>,

    /// Default tracing filter (e.g. "debug")
    pub log_level: Option<String>,
}

/// Enrollment configuration
#[derive(Debug, Default, Deserialize)]
pub struct EnrollmentFileConfig {
    /// "manual" or "auto"
    pub policy: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    /// Seconds a new session may take to send its hello
    pub hello_grace_secs: Option<u64>,

    /// Outbound commands buffered per node
    pub command_queue_depth: Option<usize>,

    /// Seconds a frame write may block
    pub write_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PersistenceFileConfig {
    /// Periodic snapshot interval
    pub snapshot_interval_secs: Option<u64>,

    /// Delay between a change and the snapshot it triggers
    pub debounce_millis: Option<u64>,
}

/// Load a TOML config file
///
/// Uses the standard path when `path` is `None`. Returns
/// `HearthConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file(path: Option<&Path>) -> HearthConfigFile {
    let Some(path) = path.map(Path::to_path_buf).or_else(config_file_path) else {
        return HearthConfigFile::default();
    };

    if !path.exists() {
        return HearthConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                HearthConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            HearthConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/hearth/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("hearth").join("config.toml"))
}
