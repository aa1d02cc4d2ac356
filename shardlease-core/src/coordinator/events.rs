//! Coordinator events
//!
//! Broadcast of membership and ownership changes for observers.

use serde::Serialize;
use tokio::sync::broadcast;

use super::state::{RunnerAddress, ShardId};

/// Something the coordinator did or observed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum CoordinatorEvent {
    RunnerRegistered { address: RunnerAddress },
    RunnerUnregistered { address: RunnerAddress },
    ShardsAssigned { address: RunnerAddress, shards: Vec<ShardId> },
    ShardsUnassigned { address: RunnerAddress, shards: Vec<ShardId> },
}

/// Fan-out of coordinator events
pub struct EventBus {
    sender: broadcast::Sender<CoordinatorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish; dropped silently with no subscribers
    pub fn publish(&self, event: CoordinatorEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(CoordinatorEvent::RunnerRegistered {
            address: RunnerAddress::new("a", 1),
        });

        let mut rx = bus.subscribe();
        let event = CoordinatorEvent::ShardsAssigned {
            address: RunnerAddress::new("a", 1),
            shards: vec![1, 2],
        };
        bus.publish(event.clone());
        assert_eq!(rx.recv().await.unwrap(), event);
    }
}
