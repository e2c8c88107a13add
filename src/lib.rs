//! Hearth - coordination hub for home-automation nodes
//!
//! This library provides the core of the hub:
//! - Enrollment of new nodes and issuing of signed credentials
//! - Node and device registries with merged durable/live state
//! - Per-node WebSocket sessions (hello, state push, commands)
//! - Command routing and snapshot persistence
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              Operators / Automations                 │
//! │        REST (/api)   │   Bootstrap (/ws/enroll)      │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                       Hub                            │
//! │  Enrollment │ Nodes │ Devices │ Router │ Store      │
//! └────────────────────┬────────────────────────────────┘
//!                      │ sessions (/ws/node)
//! ┌────────────────────▼────────────────────────────────┐
//! │                      Nodes                           │
//! │   Lights  │  Media  │  Climate  │  Energy  │  ...   │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod devices;
pub mod enrollment;
pub mod error;
pub mod hub;
pub mod nodes;
pub mod protocol;
pub mod router;
pub mod security;
pub mod session;
pub mod state;
pub mod store;

pub use config::Config;
pub use devices::{Device, DeviceDescriptor, DeviceKey, DeviceRegistry};
pub use enrollment::{EnrollmentAuthority, EnrollmentHandle, EnrollmentOutcome, EnrollmentPolicy};
pub use error::{Error, Result};
pub use hub::{Hub, ShutdownSignal};
pub use nodes::{ConnectionStatus, Node, NodeDescriptor, NodeId, NodeRegistry};
pub use protocol::{CommandFrame, Frame, Hello};
pub use router::{Command, CommandRouter};
pub use security::{Challenge, Credential, KeyIdentity};
pub use state::StateTree;
