//! Device health reporting.
//!
//! Health changes are published on a bounded broadcast queue. Publishing never
//! blocks; a subscriber that falls behind loses the oldest events and is
//! expected to resync from the full device list.

pub mod xid;

use std::sync::Mutex;
use std::sync::PoisonError;

use tokio::sync::broadcast;

use crate::device::DeviceHealth;

const HEALTH_QUEUE_CAPACITY: usize = 64;

/// A device changed health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthEvent {
    pub device_id: String,
    pub health: DeviceHealth,
}

#[derive(Debug)]
pub struct HealthNotifier {
    sender: Mutex<Option<broadcast::Sender<HealthEvent>>>,
}

impl Default for HealthNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthNotifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(HEALTH_QUEUE_CAPACITY);
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Publishes an event to current subscribers. Dropped when closed or when
    /// nobody listens.
    pub fn publish(&self, event: HealthEvent) {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(sender) => {
                if sender.send(event).is_err() {
                    tracing::debug!("no health subscribers, event dropped");
                }
            }
            None => tracing::warn!(
                "health reporting closed, dropping event for {}",
                event.device_id
            ),
        }
    }

    /// Subscribes to future events. After [`close`](Self::close) the receiver
    /// reports `Closed` immediately.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(sender) => sender.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// Closes the queue, ending every subscription once drained.
    pub fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;
    use tokio::sync::broadcast::error::RecvError;

    use super::*;

    fn unhealthy(id: &str) -> HealthEvent {
        HealthEvent {
            device_id: id.to_string(),
            health: DeviceHealth::Unhealthy,
        }
    }

    #[test(tokio::test)]
    async fn subscribers_receive_events() {
        let notifier = HealthNotifier::new();
        let mut rx = notifier.subscribe();

        notifier.publish(unhealthy("nvidia0"));

        assert_eq!(rx.recv().await.expect("should receive"), unhealthy("nvidia0"));
    }

    #[test(tokio::test)]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let notifier = HealthNotifier::new();
        let mut rx = notifier.subscribe();

        for i in 0..(HEALTH_QUEUE_CAPACITY + 10) {
            notifier.publish(unhealthy(&format!("nvidia{i}")));
        }

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(10))));
    }

    #[test(tokio::test)]
    async fn close_ends_subscriptions() {
        let notifier = HealthNotifier::new();
        let mut before = notifier.subscribe();
        notifier.close();
        let mut after = notifier.subscribe();

        notifier.publish(unhealthy("nvidia0"));

        assert!(matches!(before.recv().await, Err(RecvError::Closed)));
        assert!(matches!(after.recv().await, Err(RecvError::Closed)));
    }
}
