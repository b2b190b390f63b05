//! In-memory signal bus for tests/dev and single-process deployments.

use std::sync::mpsc::{self, TrySendError};
use std::sync::Mutex;

use crate::bus::{EventBus, Subscription};

/// Buffered messages per subscriber before new ones are dropped for it.
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InMemoryBusError {
    /// Publish failed due to internal lock poisoning.
    #[error("subscriber list lock poisoned")]
    Poisoned,
    /// The message was delivered, except to this many subscribers whose
    /// buffers were full.
    #[error("{0} subscriber(s) lagging; message dropped for them")]
    Lagged(usize),
}

/// In-memory pub/sub bus.
///
/// - No IO / no async
/// - Bounded per-subscriber buffers: a consumer that stops reading loses
///   messages instead of growing memory or blocking publishers
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    subscribers: Mutex<Vec<mpsc::SyncSender<M>>>,
    capacity: usize,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|subs| subs.len()).unwrap_or(0)
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut subs = self.subscribers.lock().map_err(|_| InMemoryBusError::Poisoned)?;

        let mut lagging = 0;
        subs.retain(|tx| match tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                lagging += 1;
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });

        if lagging > 0 {
            return Err(InMemoryBusError::Lagged(lagging));
        }
        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::sync_channel(self.capacity);

        // A poisoned lock still yields a subscription; it just stays silent.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        Subscription::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_gets_a_copy() {
        let bus: InMemoryEventBus<u32> = InMemoryEventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.publish(7).unwrap();

        assert_eq!(a.drain(), vec![7]);
        assert_eq!(b.drain(), vec![7]);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus: InMemoryEventBus<u32> = InMemoryEventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());

        bus.publish(1).unwrap();
        bus.publish(2).unwrap();

        assert_eq!(kept.drain(), vec![1, 2]);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn full_subscriber_loses_messages_without_blocking() {
        let bus: InMemoryEventBus<u32> = InMemoryEventBus::with_capacity(2);
        let slow = bus.subscribe();

        bus.publish(1).unwrap();
        bus.publish(2).unwrap();
        assert_eq!(bus.publish(3), Err(InMemoryBusError::Lagged(1)));

        assert_eq!(slow.drain(), vec![1, 2]);
        bus.publish(4).unwrap();
        assert_eq!(slow.drain(), vec![4]);
    }
}
