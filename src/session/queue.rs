//! Bounded outbound command queue for one node session

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::nodes::NodeId;
use crate::protocol::CommandFrame;
use crate::{Error, Result};

#[derive(Debug, Default)]
struct QueueState {
    frames: VecDeque<CommandFrame>,
    closed: bool,
}

/// Commands waiting to be written to a node
///
/// Pushing never blocks: a full queue drops its oldest command. A hardware
/// command delivered long after it was issued is worse than one never
/// delivered.
#[derive(Debug)]
pub struct CommandQueue {
    node: NodeId,
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl CommandQueue {
    #[must_use]
    pub fn new(node: NodeId, capacity: usize) -> Self {
        Self {
            node,
            capacity: capacity.max(1),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a command for delivery
    ///
    /// # Errors
    ///
    /// Returns `Error::NodeUnavailable` if the session has closed
    pub fn push(&self, frame: CommandFrame) -> Result<()> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(Error::NodeUnavailable(self.node.to_string()));
            }
            if state.frames.len() >= self.capacity {
                if let Some(dropped) = state.frames.pop_front() {
                    tracing::warn!(
                        node_id = %self.node,
                        device = %dropped.device,
                        cmd = %dropped.cmd,
                        "command queue full, dropping oldest command"
                    );
                }
            }
            state.frames.push_back(frame);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Take every queued command, oldest first
    pub fn drain(&self) -> Vec<CommandFrame> {
        self.lock().frames.drain(..).collect()
    }

    /// Wait until something is pushed or the queue is closed
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Stop accepting commands and wake the consumer
    ///
    /// Returns true for the call that actually closed the queue.
    pub fn close(&self) -> bool {
        let first = {
            let mut state = self.lock();
            let first = !state.closed;
            state.closed = true;
            state.frames.clear();
            first
        };
        self.notify.notify_one();
        first
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().frames.is_empty()
    }
}
