//! Subscription manager for broadcasting store events.

use crossbeam_channel::{bounded, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use super::types::{DropReason, StoreEvent, SubscriptionConfig, SubscriptionHandle, SubscriptionId};

/// Internal subscription state.
struct Subscription {
    config: SubscriptionConfig,
    sender: Sender<StoreEvent>,
}

impl Subscription {
    /// False when the buffer is full or the receiver is gone.
    fn deliver(&self, event: StoreEvent) -> bool {
        self.sender.try_send(event).is_ok()
    }

    fn matches(&self, event: &StoreEvent) -> bool {
        let filter = &self.config.filter;
        match event {
            StoreEvent::ArrayChanged { array, .. } => {
                if !filter.include_arrays {
                    return false;
                }
                if let Some(ref arrays) = filter.arrays {
                    return arrays.contains(array);
                }
                true
            }
            StoreEvent::Dropped { .. } => true,
            event => {
                let wanted = match event {
                    StoreEvent::RecordChanged { .. } => filter.include_changes,
                    _ => filter.include_lifecycle,
                };
                if !wanted {
                    return false;
                }
                match (&filter.record_types, event.record()) {
                    (Some(types), Some(record)) => types.contains(&record.record_type),
                    _ => true,
                }
            }
        }
    }
}

/// Routes store events to subscribers.
pub struct SubscriptionManager {
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    next_id: AtomicU64,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create a new subscription. Events published from now on are delivered.
    pub fn subscribe(&self, config: SubscriptionConfig) -> SubscriptionHandle {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(config.buffer_size);

        self.subscriptions
            .write()
            .insert(id, Subscription { config, sender });

        SubscriptionHandle { id, receiver }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(subscription) = self.subscriptions.write().remove(&id) {
            subscription.deliver(StoreEvent::Dropped {
                reason: DropReason::Unsubscribed,
            });
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Deliver an event to every matching subscription. Drops subscribers
    /// that fail to receive.
    pub fn publish(&self, event: StoreEvent) {
        let overflowed: Vec<SubscriptionId> = self
            .subscriptions
            .read()
            .iter()
            .filter(|(_, subscription)| {
                subscription.matches(&event) && !subscription.deliver(event.clone())
            })
            .map(|(id, _)| *id)
            .collect();

        if overflowed.is_empty() {
            return;
        }
        let mut subscriptions = self.subscriptions.write();
        for id in overflowed {
            if let Some(subscription) = subscriptions.remove(&id) {
                debug!("Dropping slow subscriber {:?}", id);
                subscription.deliver(StoreEvent::Dropped {
                    reason: DropReason::BufferOverflow,
                });
            }
        }
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}
