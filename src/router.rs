//! Command routing from operators and automations to owning nodes

use serde::{Deserialize, Serialize};

use crate::devices::{DeviceKey, DeviceRegistry};
use crate::nodes::{NodeId, NodeRegistry};
use crate::protocol::CommandFrame;
use crate::session::{SessionHandle, SessionTable};
use crate::{Error, Result};

/// Addressed instruction for one or more devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub devices: Vec<DeviceKey>,
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Command {
    /// Command for a single device
    #[must_use]
    pub fn single(device: DeviceKey, cmd: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            devices: vec![device],
            cmd: cmd.into(),
            args,
        }
    }
}

/// Resolves device keys to live sessions and enqueues commands
///
/// Delivery is fire-and-forget: success means the command was queued on
/// the node's session, not that the node acted on it. Failures are never
/// retried.
#[derive(Debug, Clone, Copy)]
pub struct CommandRouter<'a> {
    devices: &'a DeviceRegistry,
    nodes: &'a NodeRegistry,
    sessions: &'a SessionTable,
}

impl<'a> CommandRouter<'a> {
    #[must_use]
    pub const fn new(
        devices: &'a DeviceRegistry,
        nodes: &'a NodeRegistry,
        sessions: &'a SessionTable,
    ) -> Self {
        Self {
            devices,
            nodes,
            sessions,
        }
    }

    fn resolve(&self, key: &DeviceKey) -> Result<(NodeId, SessionHandle)> {
        let owner = self
            .devices
            .owner(key)
            .ok_or_else(|| Error::UnknownDevice(key.to_string()))?;
        let node = self
            .nodes
            .get(&owner)
            .ok_or_else(|| Error::UnknownDevice(key.to_string()))?;
        if !node.is_connected() {
            return Err(Error::NodeUnavailable(owner.to_string()));
        }
        let session = self
            .sessions
            .get(&owner)
            .ok_or_else(|| Error::NodeUnavailable(owner.to_string()))?;
        Ok((owner, session))
    }

    /// Route a command to every targeted device's node
    ///
    /// All targets are resolved before anything is enqueued, so an
    /// unresolvable target leaves every queue untouched. Returns the number
    /// of commands enqueued.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownDevice` if a device or its owning node is
    /// unknown, and `Error::NodeUnavailable` if an owning node has no live
    /// session
    pub fn route(&self, command: &Command) -> Result<usize> {
        let targets = command
            .devices
            .iter()
            .map(|key| self.resolve(key).map(|target| (key, target)))
            .collect::<Result<Vec<_>>>()?;

        for (key, (owner, session)) in &targets {
            session.queue().push(CommandFrame {
                device: key.id.clone(),
                cmd: command.cmd.clone(),
                args: command.args.clone(),
            })?;
            tracing::debug!(node_id = %owner, device = %key, cmd = %command.cmd, "command routed");
        }

        Ok(targets.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::DeviceDescriptor;
    use crate::nodes::NodeDescriptor;

    struct Fixture {
        devices: DeviceRegistry,
        nodes: NodeRegistry,
        sessions: SessionTable,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                devices: DeviceRegistry::new(),
                nodes: NodeRegistry::new(),
                sessions: SessionTable::new(),
            }
        }

        fn router(&self) -> CommandRouter<'_> {
            CommandRouter::new(&self.devices, &self.nodes, &self.sessions)
        }

        fn connect(&self, node: &str, device: &str) -> SessionHandle {
            let id = NodeId::parse(node).unwrap();
            self.nodes.upsert(&id, NodeDescriptor::default());
            self.devices.add(
                &id,
                DeviceDescriptor {
                    id: device.to_string(),
                    kind: "dimmer".to_string(),
                    ..DeviceDescriptor::default()
                },
            );
            self.sessions.open(&id, 8)
        }
    }

    fn key(s: &str) -> DeviceKey {
        DeviceKey::parse(s).unwrap()
    }

    #[test]
    fn routes_to_owning_session() {
        let fx = Fixture::new();
        let session = fx.connect("kitchen-light", "1");

        let sent = fx
            .router()
            .route(&Command::single(key("kitchen-light.1"), "dim", vec!["50".to_string()]))
            .unwrap();

        assert_eq!(sent, 1);
        let queued = session.queue().drain();
        assert_eq!(
            queued,
            vec![CommandFrame {
                device: "1".to_string(),
                cmd: "dim".to_string(),
                args: vec!["50".to_string()],
            }]
        );
    }

    #[test]
    fn unknown_device() {
        let fx = Fixture::new();
        let result = fx
            .router()
            .route(&Command::single(key("ghost.1"), "on", vec![]));
        assert!(matches!(result, Err(Error::UnknownDevice(_))));
    }

    #[test]
    fn device_of_removed_node_is_unknown() {
        let fx = Fixture::new();
        fx.connect("lamp", "1");
        fx.nodes.remove(&NodeId::parse("lamp").unwrap());

        let result = fx.router().route(&Command::single(key("lamp.1"), "on", vec![]));
        assert!(matches!(result, Err(Error::UnknownDevice(_))));
    }

    #[test]
    fn disconnected_node_is_unavailable() {
        let fx = Fixture::new();
        fx.connect("kitchen-light", "1");
        let id = NodeId::parse("kitchen-light").unwrap();
        fx.nodes.mark_disconnected(&id).unwrap();

        let result = fx
            .router()
            .route(&Command::single(key("kitchen-light.1"), "dim", vec!["50".to_string()]));
        assert!(matches!(result, Err(Error::NodeUnavailable(_))));
    }

    #[test]
    fn connected_without_session_is_unavailable() {
        let fx = Fixture::new();
        fx.connect("lamp", "1");
        fx.sessions.close(&NodeId::parse("lamp").unwrap());

        let result = fx.router().route(&Command::single(key("lamp.1"), "on", vec![]));
        assert!(matches!(result, Err(Error::NodeUnavailable(_))));
    }

    #[test]
    fn failed_target_enqueues_nothing() {
        let fx = Fixture::new();
        let session = fx.connect("lamp", "1");

        let command = Command {
            devices: vec![key("lamp.1"), key("ghost.1")],
            cmd: "on".to_string(),
            args: vec![],
        };
        assert!(fx.router().route(&command).is_err());
        assert!(session.queue().is_empty());
    }

    #[test]
    fn fans_out_across_nodes() {
        let fx = Fixture::new();
        let lamp = fx.connect("lamp", "1");
        let fan = fx.connect("fan", "a");

        let command = Command {
            devices: vec![key("lamp.1"), key("fan.a")],
            cmd: "off".to_string(),
            args: vec![],
        };
        assert_eq!(fx.router().route(&command).unwrap(), 2);
        assert_eq!(lamp.queue().len(), 1);
        assert_eq!(fan.queue().drain()[0].device, "a");
    }
}
