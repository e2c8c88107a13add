//! Configuration management for the Hearth hub

pub mod file;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use self::file::HearthConfigFile;
use crate::enrollment::EnrollmentPolicy;
use crate::{Error, Result};

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_NAME: &str = "hearth";
const DEFAULT_HELLO_GRACE_SECS: u64 = 10;
const DEFAULT_COMMAND_QUEUE_DEPTH: usize = 32;
const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 3;
const DEFAULT_SNAPSHOT_INTERVAL_SECS: u64 = 60;
const DEFAULT_DEBOUNCE_MILLIS: u64 = 500;

/// Hub configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Display name of this hub
    pub name: String,

    /// Directory holding the hub identity and snapshots
    pub data_dir: PathBuf,

    /// Default tracing filter when neither `-v` nor `RUST_LOG` is given
    pub log_level: Option<String>,

    /// HTTP server configuration
    pub server: ServerConfig,

    /// How enrollment requests are approved
    pub enrollment: EnrollmentPolicy,

    pub session: SessionConfig,

    pub persistence: PersistenceConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// API key for operator endpoints (from `HEARTH_API_KEY` env)
    pub api_key: Option<String>,
}

/// Node session tuning
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Time a new session has to complete its hello
    pub hello_grace: Duration,

    /// Outbound commands buffered per node before the oldest is dropped
    pub command_queue_depth: usize,

    /// Longest a single frame write may block before the peer is dropped
    pub write_timeout: Duration,
}

/// Snapshot scheduling
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Unconditional snapshot period
    pub snapshot_interval: Duration,

    /// Quiet period after a change before it is written
    pub debounce: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            data_dir: default_data_dir(),
            log_level: None,
            server: ServerConfig {
                host: DEFAULT_HOST.to_string(),
                port: DEFAULT_PORT,
                api_key: None,
            },
            enrollment: EnrollmentPolicy::Manual,
            session: SessionConfig {
                hello_grace: Duration::from_secs(DEFAULT_HELLO_GRACE_SECS),
                command_queue_depth: DEFAULT_COMMAND_QUEUE_DEPTH,
                write_timeout: Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS),
            },
            persistence: PersistenceConfig {
                snapshot_interval: Duration::from_secs(DEFAULT_SNAPSHOT_INTERVAL_SECS),
                debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MILLIS),
            },
        }
    }
}

/// Default data directory: `<data_dir>/hearth`
#[must_use]
pub fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map_or_else(|| PathBuf::from("."), |d| d.data_dir().join("hearth"))
}

impl Config {
    /// Load configuration from the config file and environment
    ///
    /// # Errors
    ///
    /// Returns error if an environment variable holds an invalid value
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let fc = file::load_config_file(config_path);
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Defaults rooted at `data_dir`, ignoring file and environment
    #[must_use]
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Merge a parsed config file with environment lookups
    ///
    /// Environment variables take precedence over the file, which takes
    /// precedence over defaults.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if an environment variable holds an invalid value
    pub fn from_sources(
        fc: HearthConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let defaults = Self::default();

        let server = ServerConfig {
            host: env("HEARTH_HOST")
                .or(fc.server.host)
                .unwrap_or(defaults.server.host),
            port: parse_env(&env, "HEARTH_PORT")?
                .or(fc.server.port)
                .unwrap_or(defaults.server.port),
            api_key: env("HEARTH_API_KEY")
                .or(fc.server.api_key)
                .filter(|k| !k.is_empty()),
        };

        let data_dir = env("HEARTH_DATA_DIR")
            .or(fc.hub.data_dir)
            .map_or(defaults.data_dir, PathBuf::from);

        let enrollment = env("HEARTH_ENROLLMENT")
            .or(fc.enrollment.policy)
            .map_or(defaults.enrollment, |p| EnrollmentPolicy::from_str(&p));

        let session = SessionConfig {
            hello_grace: parse_env(&env, "HEARTH_HELLO_GRACE_SECS")?
                .or(fc.session.hello_grace_secs)
                .map_or(defaults.session.hello_grace, Duration::from_secs),
            command_queue_depth: parse_env(&env, "HEARTH_COMMAND_QUEUE_DEPTH")?
                .or(fc.session.command_queue_depth)
                .unwrap_or(defaults.session.command_queue_depth)
                .max(1),
            write_timeout: parse_env(&env, "HEARTH_WRITE_TIMEOUT_SECS")?
                .or(fc.session.write_timeout_secs)
                .map_or(defaults.session.write_timeout, Duration::from_secs),
        };

        let persistence = PersistenceConfig {
            snapshot_interval: parse_env(&env, "HEARTH_SNAPSHOT_INTERVAL_SECS")?
                .or(fc.persistence.snapshot_interval_secs)
                .map_or(defaults.persistence.snapshot_interval, Duration::from_secs),
            debounce: parse_env(&env, "HEARTH_DEBOUNCE_MILLIS")?
                .or(fc.persistence.debounce_millis)
                .map_or(defaults.persistence.debounce, Duration::from_millis),
        };

        Ok(Self {
            name: env("HEARTH_NAME").or(fc.hub.name).unwrap_or(defaults.name),
            data_dir,
            log_level: env("HEARTH_LOG_LEVEL").or(fc.hub.log_level),
            server,
            enrollment,
            session,
            persistence,
        })
    }

    /// Socket address string for the listener
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn parse_env<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    env(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| Error::Config(format!("{key}: invalid value {raw:?}")))
        })
        .transpose()
}
