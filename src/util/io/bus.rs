// src/util/io/bus.rs
//! Observer interface: fan-out of sync events to any number of subscribers
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::log_debug;
use crate::sync::SyncEvent;

pub type EventReceiver = mpsc::UnboundedReceiver<SyncEvent>;
pub type EventSender = mpsc::UnboundedSender<SyncEvent>;

#[derive(Debug, Clone, Default)]
pub struct EventBus {
    // Dropped receivers are pruned lazily on the next publish
    subscribers: Arc<Mutex<Vec<EventSender>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> EventReceiver {
        let (sender, receiver) = mpsc::unbounded_channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(sender);
        }
        receiver
    }

    pub fn publish(&self, event: SyncEvent) {
        log_debug!("event: {:?}", event);
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceCommand;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(SyncEvent::CommandSent(DeviceCommand::StartPump));

        assert!(matches!(first.recv().await, Some(SyncEvent::CommandSent(DeviceCommand::StartPump))));
        assert!(matches!(second.recv().await, Some(SyncEvent::CommandSent(DeviceCommand::StartPump))));
    }

    #[tokio::test]
    async fn test_dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let keep = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(SyncEvent::CommandSent(DeviceCommand::StopPump));
        assert_eq!(bus.subscriber_count(), 1);
        drop(keep);
    }
}
