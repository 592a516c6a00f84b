//! Subscription registry: address → subscription id → delivery slot.
//!
//! Each slot owns a forwarding task that moves records from an unbounded
//! inbox into the subscriber's bounded queue. The receive loop only ever
//! pushes into inboxes, so a full queue stalls that one forwarder and
//! nothing else.
//!
//! # Backpressure
//!
//! Per subscriber, records wait in the inbox while the bounded queue is
//! full (grow-unbounded staging, block-sender into the queue). Order is
//! preserved per subscriber.
//!
//! Dropping a slot drops the inbox sender; the forwarder drains what is
//! already staged and then drops the queue sender, so the consumer sees
//! end-of-stream.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::bridge::Message;

/// Delivery target for one subscription.
#[derive(Debug)]
pub(crate) struct DeliverySlot {
    inbox: mpsc::UnboundedSender<Arc<Message>>,
}

impl DeliverySlot {
    /// Spawn the forwarder for `queue` and return the slot feeding it.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn spawn(subscription_id: String, queue: mpsc::Sender<Arc<Message>>) -> Self {
        let (inbox, mut inbox_rx) = mpsc::unbounded_channel::<Arc<Message>>();

        tokio::spawn(async move {
            while let Some(message) = inbox_rx.recv().await {
                if queue.send(message).await.is_err() {
                    log::debug!("[Dispatcher] Consumer for {subscription_id} dropped its queue");
                    break;
                }
            }
        });

        Self { inbox }
    }

    /// Stage a record for delivery. Never blocks.
    ///
    /// Returns `false` if the consumer has gone away.
    fn deliver(&self, message: Arc<Message>) -> bool {
        self.inbox.send(message).is_ok()
    }
}

/// Outcome of removing a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Removal {
    /// No such (address, id) pair.
    NotFound,
    /// Removed; `remaining` subscriptions are left on the address.
    Removed {
        /// Subscriptions still registered for the address.
        remaining: usize,
    },
}

/// Address → subscription id → delivery slot.
///
/// An address key exists only while it has at least one subscription.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    addresses: HashMap<String, HashMap<String, DeliverySlot>>,
}

impl Registry {
    pub(crate) fn contains(&self, address: &str) -> bool {
        self.addresses.contains_key(address)
    }

    pub(crate) fn subscription_count(&self, address: &str) -> usize {
        self.addresses.get(address).map_or(0, HashMap::len)
    }

    pub(crate) fn insert(&mut self, address: &str, id: String, slot: DeliverySlot) {
        self.addresses
            .entry(address.to_string())
            .or_default()
            .insert(id, slot);
    }

    /// Remove one subscription, dropping its slot (which closes its queue).
    ///
    /// The address key goes away with its last subscription.
    pub(crate) fn remove(&mut self, address: &str, id: &str) -> Removal {
        let Some(subscriptions) = self.addresses.get_mut(address) else {
            return Removal::NotFound;
        };
        if subscriptions.remove(id).is_none() {
            return Removal::NotFound;
        }

        let remaining = subscriptions.len();
        if remaining == 0 {
            self.addresses.remove(address);
        }
        Removal::Removed { remaining }
    }

    /// Stage `message` for every subscription on its address.
    ///
    /// Returns the number of subscriptions that accepted it.
    pub(crate) fn deliver(&self, message: &Arc<Message>) -> usize {
        let Some(subscriptions) = self.addresses.get(&message.address) else {
            return 0;
        };
        subscriptions
            .values()
            .filter(|slot| slot.deliver(Arc::clone(message)))
            .count()
    }

    /// Remove every subscription, closing all queues.
    ///
    /// Returns the number of subscriptions closed.
    pub(crate) fn drain_all(&mut self) -> usize {
        self.addresses
            .drain()
            .map(|(_, subscriptions)| subscriptions.len())
            .sum()
    }
}
