//! Error types for the Hearth hub

use thiserror::Error;

/// Result type alias for hub operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the hub
#[derive(Debug, Error)]
pub enum Error {
    /// The same handle already has an unresolved enrollment request
    #[error("duplicate enrollment request: {0}")]
    DuplicateRequest(String),

    /// Enrollment request was already resolved or never existed
    #[error("unknown enrollment request: {0}")]
    UnknownRequest(String),

    /// Device key does not resolve to a known device or owning node
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// Node id is not known to the registry
    #[error("unknown node: {0}")]
    UnknownNode(String),

    /// Node is known but has no live session
    #[error("node unavailable: {0}")]
    NodeUnavailable(String),

    /// Out-of-order or malformed frame; fatal to one session only
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Snapshot record could not be decoded
    #[error("snapshot corrupt: {0}")]
    SnapshotCorrupt(String),

    /// Credential or signature verification error
    #[error("auth error: {0}")]
    Auth(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Stable code carried in error frames and API error bodies
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::UnknownRequest(_) => "unknown_request",
            Self::UnknownDevice(_) => "unknown_device",
            Self::UnknownNode(_) => "unknown_node",
            Self::DuplicateRequest(_) => "duplicate_request",
            Self::NodeUnavailable(_) => "node_unavailable",
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::Auth(_) => "auth",
            _ => "internal",
        }
    }
}
