//! Wire frames exchanged with nodes
//!
//! Every WebSocket text message carries one JSON frame tagged by `type`.
//! Session frames flow on `/ws/node`, bootstrap frames on `/ws/enroll`.

use serde::{Deserialize, Serialize};

use crate::devices::DeviceDescriptor;
use crate::nodes::{NodeDescriptor, NodeId};
use crate::security::Credential;
use crate::state::StateTree;
use crate::{Error, Result};

/// Initial session frame declaring a node's capabilities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    /// Credential issued at enrollment
    pub credential: Credential,

    /// Node signature over the session challenge nonce (base64)
    pub proof: String,

    #[serde(default)]
    pub node: NodeDescriptor,

    #[serde(default)]
    pub devices: Vec<DeviceDescriptor>,

    #[serde(default)]
    pub state: StateTree,
}

/// Instruction delivered to a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandFrame {
    /// Node-local device id
    pub device: String,
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Every message kind on the session and bootstrap channels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Node declares actions, devices and initial state
    Hello(Hello),

    /// Node replaces its published state wholesale
    StatePush { state: StateTree },

    /// Node reports the outcome of a command
    CommandResult {
        #[serde(default)]
        device: Option<String>,
        cmd: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Keepalive from the node
    Ping,

    /// Hub asks the node to sign a nonce
    Challenge { nonce: String },

    /// Hub accepted the hello
    Welcome { node_id: NodeId },

    /// Hub delivers a command
    Command(CommandFrame),

    /// Keepalive reply
    Pong,

    /// Hub reports a problem before closing or ignoring a frame
    Error { code: String, message: String },

    /// Unenrolled node asks to join
    EnrollmentRequest {
        #[serde(default)]
        name: Option<String>,
        public_key: String,
    },

    /// Request registered, awaiting approval
    EnrollmentPending { request_id: String },

    /// Request approved
    EnrollmentAccept { credential: Credential },

    /// Request refused
    EnrollmentReject { reason: String },
}

impl Frame {
    /// Wire tag of this frame
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::StatePush { .. } => "state_push",
            Self::CommandResult { .. } => "command_result",
            Self::Ping => "ping",
            Self::Challenge { .. } => "challenge",
            Self::Welcome { .. } => "welcome",
            Self::Command(_) => "command",
            Self::Pong => "pong",
            Self::Error { .. } => "error",
            Self::EnrollmentRequest { .. } => "enrollment_request",
            Self::EnrollmentPending { .. } => "enrollment_pending",
            Self::EnrollmentAccept { .. } => "enrollment_accept",
            Self::EnrollmentReject { .. } => "enrollment_reject",
        }
    }

    /// Build an error frame
    #[must_use]
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Serialize a frame for the wire
///
/// # Errors
///
/// Returns error if serialization fails
pub fn encode(frame: &Frame) -> Result<String> {
    Ok(serde_json::to_string(frame)?)
}

/// Parse a frame from the wire
///
/// # Errors
///
/// Returns `Error::ProtocolViolation` if the text is not a known frame
pub fn decode(text: &str) -> Result<Frame> {
    serde_json::from_str(text).map_err(|e| Error::ProtocolViolation(format!("malformed frame: {e}")))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn decodes_state_push() {
        let frame = decode(r#"{"type":"state_push","state":{"1":{"on":true}}}"#).unwrap();
        let Frame::StatePush { state } = frame else {
            panic!("expected state_push");
        };
        assert_eq!(state.path("1.on"), Some(&StateTree::Bool(true)));
    }

    #[test]
    fn encodes_command_flat() {
        let frame = Frame::Command(CommandFrame {
            device: "1".to_string(),
            cmd: "dim".to_string(),
            args: vec!["50".to_string()],
        });
        let value: serde_json::Value = serde_json::from_str(&encode(&frame).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "command", "device": "1", "cmd": "dim", "args": ["50"]})
        );
    }

    #[test]
    fn decodes_hello_with_defaults() {
        let hub = crate::security::KeyIdentity::generate("hub");
        let node = crate::security::KeyIdentity::generate("lamp");
        let credential =
            Credential::issue(&hub, NodeId::parse("lamp").unwrap(), &node.public_key).unwrap();

        let text = json!({
            "type": "hello",
            "credential": credential,
            "proof": "sig",
            "devices": [{"id": "1", "type": "dimmer"}]
        })
        .to_string();

        let Frame::Hello(hello) = decode(&text).unwrap() else {
            panic!("expected hello");
        };
        assert_eq!(hello.devices.len(), 1);
        assert!(hello.node.actions.is_empty());
        assert!(hello.state.is_empty());
        assert_eq!(hello.credential, credential);
    }

    #[test]
    fn unit_frames() {
        assert_eq!(decode(r#"{"type":"ping"}"#).unwrap(), Frame::Ping);
        assert_eq!(encode(&Frame::Pong).unwrap(), r#"{"type":"pong"}"#);
    }

    #[test]
    fn malformed_is_protocol_violation() {
        for bad in ["not json", r#"{"type":"teleport"}"#, r#"{"state":{}}"#] {
            assert!(
                matches!(decode(bad), Err(Error::ProtocolViolation(_))),
                "accepted {bad}"
            );
        }
    }

    #[test]
    fn kind_matches_wire_tag() {
        let frame = Frame::EnrollmentReject {
            reason: "no".to_string(),
        };
        let value: serde_json::Value = serde_json::from_str(&encode(&frame).unwrap()).unwrap();
        assert_eq!(value["type"], frame.kind());
    }
}
