//! Subscriber registry and the notifier thread.
//!
//! The write path never blocks on a slow subscriber: commits push the
//! `StateChange` onto the notifier's input channel and return. The
//! notifier thread fans each change out to every subscriber of its
//! workflow, retrying full buffers a bounded number of times with
//! backoff before dropping the delivery with a warning.

use crate::types::{AgentId, StateChange, Timestamp, WorkflowId};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

use super::types::{DeliveryHandle, DropReason, Notification};

/// Tuning for the notifier thread.
#[derive(Clone, Debug)]
pub struct NotifierConfig {
    /// Capacity of the commit-to-notifier channel.
    pub queue_size: usize,
    /// Delivery attempts per subscriber before dropping the event.
    pub max_attempts: u32,
    /// Backoff between attempts, doubled each retry.
    pub initial_backoff: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            queue_size: 1024,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
        }
    }
}

struct Subscriber {
    sender: Sender<Notification>,
    subscribed_at: Timestamp,
}

/// Maps workflows to their subscribed agents.
pub struct SubscriptionRegistry {
    subscribers: RwLock<HashMap<WorkflowId, HashMap<AgentId, Subscriber>>>,
    subscriber_buffer: usize,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new(subscriber_buffer: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            subscriber_buffer: subscriber_buffer.max(1),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Subscribe an agent to a workflow's changes.
    ///
    /// Re-subscribing replaces the previous channel for that agent.
    pub fn subscribe(&self, workflow: &WorkflowId, agent: &AgentId) -> DeliveryHandle {
        let (sender, receiver) = bounded(self.subscriber_buffer);
        let mut subs = self.subscribers.write();
        subs.entry(workflow.clone()).or_default().insert(
            agent.clone(),
            Subscriber {
                sender,
                subscribed_at: Timestamp::now(),
            },
        );
        debug!(workflow = %workflow, agent = %agent, "subscribed");
        DeliveryHandle {
            workflow_id: workflow.clone(),
            agent_id: agent.clone(),
            receiver,
        }
    }

    /// Remove an agent's subscription.
    ///
    /// Future changes stop flowing; deliveries already buffered on the
    /// agent's channel are unaffected.
    pub fn unsubscribe(&self, workflow: &WorkflowId, agent: &AgentId) -> bool {
        let mut subs = self.subscribers.write();
        let Some(agents) = subs.get_mut(workflow) else {
            return false;
        };
        let removed = agents.remove(agent);
        if agents.is_empty() {
            subs.remove(workflow);
        }
        if let Some(sub) = removed {
            let _ = sub.sender.try_send(Notification::Dropped {
                reason: DropReason::Unsubscribed,
            });
            debug!(workflow = %workflow, agent = %agent, "unsubscribed");
            true
        } else {
            false
        }
    }

    /// Subscribed agents for a workflow.
    pub fn subscribers_of(&self, workflow: &WorkflowId) -> Vec<AgentId> {
        let subs = self.subscribers.read();
        let mut agents: Vec<_> = subs
            .get(workflow)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        agents.sort();
        agents
    }

    pub fn subscription_count(&self) -> usize {
        self.subscribers.read().values().map(|m| m.len()).sum()
    }

    /// Notifications successfully handed to subscriber channels.
    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Notifications abandoned after retries or on dead channels.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Count an event dropped before it ever reached the notifier queue.
    pub fn record_input_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Fan a change out to every subscriber of its workflow.
    ///
    /// Runs on the notifier thread. At-least-once: a retried send can
    /// duplicate an event; consumers deduplicate on the change id.
    fn deliver(&self, change: &StateChange, config: &NotifierConfig) {
        let targets: Vec<(AgentId, Sender<Notification>)> = {
            let subs = self.subscribers.read();
            match subs.get(&change.workflow_id) {
                Some(agents) => agents
                    .iter()
                    .map(|(id, s)| (id.clone(), s.sender.clone()))
                    .collect(),
                None => return,
            }
        };

        let mut dead = Vec::new();
        for (agent, sender) in targets {
            let mut backoff = config.initial_backoff;
            let mut attempt = 1u32;
            loop {
                match sender.try_send(Notification::Change {
                    change: change.clone(),
                }) {
                    Ok(()) => {
                        self.delivered.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        dead.push(agent.clone());
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                    Err(TrySendError::Full(_)) if attempt < config.max_attempts => {
                        std::thread::sleep(backoff);
                        backoff = backoff.saturating_mul(2);
                        attempt += 1;
                    }
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            workflow = %change.workflow_id,
                            agent = %agent,
                            change = %change.id,
                            attempts = attempt,
                            "dropping notification for slow subscriber"
                        );
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                }
            }
        }

        if !dead.is_empty() {
            let mut subs = self.subscribers.write();
            if let Some(agents) = subs.get_mut(&change.workflow_id) {
                for agent in dead {
                    agents.remove(&agent);
                    debug!(workflow = %change.workflow_id, agent = %agent, "removed dead subscriber");
                }
                if agents.is_empty() {
                    subs.remove(&change.workflow_id);
                }
            }
        }
    }
}

/// Background thread draining committed changes to subscribers.
pub struct Notifier {
    input: Sender<StateChange>,
    shutdown: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Notifier {
    /// Spawn the notifier thread over a registry.
    pub fn spawn(registry: Arc<SubscriptionRegistry>, config: NotifierConfig) -> Self {
        let (input, events): (Sender<StateChange>, Receiver<StateChange>) =
            bounded(config.queue_size.max(1));
        let (shutdown, shutdown_rx) = bounded(1);

        let handle = std::thread::Builder::new()
            .name("statevault-notifier".into())
            .spawn(move || loop {
                crossbeam_channel::select! {
                    recv(events) -> msg => match msg {
                        Ok(change) => registry.deliver(&change, &config),
                        Err(_) => break,
                    },
                    recv(shutdown_rx) -> _ => {
                        // Drain what is already queued before exiting.
                        while let Ok(change) = events.try_recv() {
                            registry.deliver(&change, &config);
                        }
                        break;
                    }
                }
            })
            .expect("failed to spawn notifier thread");

        Self {
            input,
            shutdown,
            handle: Some(handle),
        }
    }

    /// Queue a change for fan-out. Never blocks the write path: if the
    /// notifier queue is full the event is dropped with a warning.
    pub fn enqueue(&self, change: StateChange) -> bool {
        match self.input.try_send(change) {
            Ok(()) => true,
            Err(TrySendError::Full(change)) => {
                warn!(
                    workflow = %change.workflow_id,
                    change = %change.id,
                    "notifier queue full, dropping event"
                );
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        let _ = self.shutdown.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
