//! Change notifications pushed to subscribers

use async_channel::{Receiver, Sender, TryRecvError, TrySendError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

use crate::models::{HealthStatus, ServiceId, Status};

/// What changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeKind {
    /// Service registered
    Added,
    /// Service removed
    Removed,
    /// Definition or dependencies replaced
    Updated,
    /// Lifecycle status changed
    StatusChanged {
        /// Previous status
        from: Status,
        /// New status
        to: Status,
    },
    /// Health changed
    HealthChanged {
        /// Previous health
        from: HealthStatus,
        /// New health
        to: HealthStatus,
    },
}

/// A registry change delivered to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceChangeEvent {
    /// Affected service
    pub service_id: ServiceId,
    /// Service name at the time of the change
    pub service_name: String,
    /// What changed
    pub kind: ChangeKind,
    /// When
    pub timestamp: DateTime<Utc>,
}

/// Identifier of a subscription
pub type SubscriptionId = u64;

/// Receiving side of a subscription
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    receiver: Receiver<ServiceChangeEvent>,
}

impl Subscription {
    /// Subscription id, used to unsubscribe
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next event; `None` once unsubscribed
    pub async fn recv(&self) -> Option<ServiceChangeEvent> {
        self.receiver.recv().await.ok()
    }

    /// Take an event if one is queued
    pub fn try_recv(&self) -> Option<ServiceChangeEvent> {
        self.receiver.try_recv().ok()
    }

    /// The underlying receiver, which is also a `Stream`
    pub fn receiver(&self) -> &Receiver<ServiceChangeEvent> {
        &self.receiver
    }
}

struct Subscriber {
    sender: Sender<ServiceChangeEvent>,
    // Second handle on the queue so a full buffer can drop its oldest entry
    drain: Receiver<ServiceChangeEvent>,
}

/// Bounded fan-out with drop-oldest semantics
///
/// Publishing never blocks: when a subscriber's buffer is full its oldest
/// queued event is discarded to make room.
pub struct EventBus {
    capacity: usize,
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<SubscriptionId, Subscriber>>,
}

impl EventBus {
    /// Create a bus whose subscribers buffer `capacity` events each
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Add a subscriber
    pub fn subscribe(&self) -> Subscription {
        let (sender, receiver) = async_channel::bounded(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                Subscriber {
                    sender,
                    drain: receiver.clone(),
                },
            );
        debug!("Subscriber {} added", id);
        Subscription { id, receiver }
    }

    /// Remove a subscriber; its receiver then yields `None`
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        match removed {
            Some(subscriber) => {
                subscriber.sender.close();
                debug!("Subscriber {} removed", id);
                true
            }
            None => false,
        }
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver an event to every subscriber
    pub fn publish(&self, event: ServiceChangeEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        subscribers.retain(|id, subscriber| {
            // Only the drain handle left: the subscription was dropped
            if subscriber.sender.receiver_count() <= 1 {
                debug!("Subscriber {} dropped, pruning", id);
                return false;
            }
            let mut pending = event.clone();
            loop {
                match subscriber.sender.try_send(pending) {
                    Ok(()) => return true,
                    Err(TrySendError::Full(back)) => {
                        pending = back;
                        match subscriber.drain.try_recv() {
                            Ok(_) | Err(TryRecvError::Empty) => continue,
                            Err(TryRecvError::Closed) => return false,
                        }
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!("Subscriber {} closed, dropping", id);
                        return false;
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn event(n: u8) -> ServiceChangeEvent {
        ServiceChangeEvent {
            service_id: Uuid::from_u128(n as u128),
            service_name: format!("svc-{n}"),
            kind: ChangeKind::Added,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_fan_out_to_all_subscribers() {
        let bus = EventBus::new(8);
        let a = bus.subscribe();
        let b = bus.subscribe();
        bus.publish(event(1));
        assert_eq!(a.try_recv().map(|e| e.service_name), Some("svc-1".into()));
        assert_eq!(b.try_recv().map(|e| e.service_name), Some("svc-1".into()));
    }

    #[test]
    fn test_full_buffer_drops_oldest() {
        let bus = EventBus::new(2);
        let sub = bus.subscribe();
        for n in 1..=4 {
            bus.publish(event(n));
        }
        assert_eq!(sub.try_recv().map(|e| e.service_name), Some("svc-3".into()));
        assert_eq!(sub.try_recv().map(|e| e.service_name), Some("svc-4".into()));
        assert!(sub.try_recv().is_none());
    }

    #[smol_potat::test]
    async fn test_unsubscribe_ends_stream() {
        let bus = EventBus::new(2);
        let sub = bus.subscribe();
        assert!(bus.unsubscribe(sub.id()));
        assert!(!bus.unsubscribe(sub.id()));
        assert!(sub.recv().await.is_none());
        bus.publish(event(1));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_dropped_subscription_is_pruned() {
        let bus = EventBus::new(2);
        let sub = bus.subscribe();
        drop(sub);
        for n in 0..10 {
            bus.publish(event(n));
        }
        assert_eq!(bus.subscriber_count(), 0);
    }
}
