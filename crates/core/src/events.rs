//! Event System
//!
//! Provides a pub/sub event bus so observers can follow long-running
//! operations (device tracking, emulator lifecycle) without polling them.

use parking_lot::RwLock;
use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::trace;

/// Subscriber handle for receiving events
#[derive(Clone)]
pub struct EventSubscription<E> {
    receiver: Receiver<E>,
}

impl<E> EventSubscription<E> {
    /// Receive the next event (blocking)
    pub fn recv(&self) -> Result<E, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking)
    pub fn try_recv(&self) -> Result<E, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Drain everything received so far
    pub fn drain(&self) -> Vec<E> {
        self.receiver.try_iter().collect()
    }
}

/// Event bus for publish/subscribe pattern
pub struct EventBus<E> {
    subscribers: RwLock<Vec<Sender<E>>>,
}

impl<E: Clone + std::fmt::Debug> EventBus<E> {
    /// Create a new event bus
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> EventSubscription<E> {
        let (sender, receiver) = unbounded();
        self.subscribers.write().push(sender);
        EventSubscription { receiver }
    }

    /// Emit an event to all subscribers, dropping ones that went away
    pub fn emit(&self, event: E) -> usize {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|sender| sender.send(event.clone()).is_ok());

        let delivered = subscribers.len();
        trace!("Event {:?} delivered to {} subscribers", event, delivered);
        delivered
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl<E: Clone + std::fmt::Debug> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_bus() {
        let bus = EventBus::new();
        let sub1 = bus.subscribe();
        let sub2 = bus.subscribe();

        assert_eq!(bus.subscriber_count(), 2);

        let delivered = bus.emit("booted");
        assert_eq!(delivered, 2);

        assert_eq!(sub1.try_recv().unwrap(), "booted");
        assert_eq!(sub2.try_recv().unwrap(), "booted");
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());

        assert_eq!(bus.emit(1u32), 1);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(kept.drain(), vec![1]);
    }
}
