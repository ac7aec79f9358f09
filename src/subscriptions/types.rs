//! Subscription-facing types.

use crate::types::{AgentId, StateChange, WorkflowId};
use serde::{Deserialize, Serialize};

/// Why a subscriber's channel was closed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// The delivery buffer stayed full through all retries.
    BufferOverflow,
    /// The receiving side went away.
    Disconnected,
    /// Explicitly unsubscribed.
    Unsubscribed,
}

/// What a subscriber receives on its channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// A committed state change. Delivery is at-least-once; consumers
    /// needing exactly-once should deduplicate on `change.id`.
    Change { change: StateChange },
    /// The subscription was removed.
    Dropped { reason: DropReason },
}

/// Receiving end of a subscription.
pub struct DeliveryHandle {
    pub workflow_id: WorkflowId,
    pub agent_id: AgentId,
    pub receiver: crossbeam_channel::Receiver<Notification>,
}

impl DeliveryHandle {
    /// Receive the next notification (blocking).
    pub fn recv(&self) -> Result<Notification, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a notification (non-blocking).
    pub fn try_recv(&self) -> Result<Notification, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<Notification, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently buffered.
    pub fn drain(&self) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = self.receiver.try_recv() {
            out.push(n);
        }
        out
    }
}
