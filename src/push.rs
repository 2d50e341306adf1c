//! Real-time push feed
//!
//! Best-effort fanout of transfer mutations to live listeners (e.g. a
//! websocket layer). Unlike notifications this is not durable: the queue is
//! bounded and events are dropped when nobody drains it fast enough.

use crossbeam_queue::ArrayQueue;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::subscription::TRANSFER_UPDATE;
use crate::transfer::Transfer;

pub const DEFAULT_QUEUE_SIZE: usize = 4096;

/// Max events forwarded per relay tick
const RELAY_BATCH: usize = 1000;

/// One transfer mutation as seen by live listeners
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferEvent {
    /// Accounts referenced by the transfer
    pub accounts: BTreeSet<String>,
    pub event_type: &'static str,
    pub transfer: Transfer,
}

impl TransferEvent {
    pub fn update(transfer: &Transfer) -> Self {
        Self {
            accounts: transfer.accounts(),
            event_type: TRANSFER_UPDATE,
            transfer: transfer.clone(),
        }
    }
}

/// Bounded lock-free event queue
pub struct PushQueue {
    queue: ArrayQueue<TransferEvent>,
}

impl PushQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// Enqueue without blocking. Returns `false` if the event was dropped.
    pub fn publish(&self, event: TransferEvent) -> bool {
        match self.queue.push(event) {
            Ok(()) => true,
            Err(event) => {
                warn!(
                    transfer_id = %event.transfer.id,
                    capacity = self.queue.capacity(),
                    "Push queue full, dropping event"
                );
                false
            }
        }
    }

    pub fn pop(&self) -> Option<TransferEvent> {
        self.queue.pop()
    }

    pub fn drain(&self) -> Vec<TransferEvent> {
        std::iter::from_fn(|| self.queue.pop()).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Default for PushQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_SIZE)
    }
}

/// Drains a [`PushQueue`] into a broadcast channel that live listeners
/// subscribe to. Events published while nobody listens are discarded.
pub struct PushRelay {
    queue: Arc<PushQueue>,
    sender: broadcast::Sender<TransferEvent>,
    poll_interval: Duration,
}

impl PushRelay {
    pub fn new(queue: Arc<PushQueue>, poll_interval: Duration) -> Self {
        let (sender, _) = broadcast::channel(queue.queue.capacity());
        Self {
            queue,
            sender,
            poll_interval,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.sender.subscribe()
    }

    /// Forward up to one batch of queued events. Returns how many were taken.
    pub fn forward(&self) -> usize {
        let mut count = 0;
        while count < RELAY_BATCH {
            let Some(event) = self.queue.pop() else {
                break;
            };
            let _ = self.sender.send(event);
            count += 1;
        }
        count
    }

    /// Run until `shutdown` flips to `true`
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.poll_interval);
        info!("Push relay started");

        while !*shutdown.borrow() {
            tokio::select! {
                _ = tick.tick() => {
                    let count = self.forward();
                    if count > 0 {
                        debug!(count, listeners = self.sender.receiver_count(), "Push events forwarded");
                    }
                }
                _ = shutdown.changed() => {}
            }
        }

        info!("Push relay stopped");
    }
}
