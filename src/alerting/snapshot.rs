/// Latest derived-analytics snapshot, shared between producers and the alert engine
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::events::{Broadcaster, Channel, StreamMessage};
use crate::types::AnalyticsSnapshot;

pub struct SnapshotCache {
    latest: RwLock<Option<AnalyticsSnapshot>>,
    bus: Arc<Broadcaster>,
}

impl SnapshotCache {
    pub fn new(bus: Arc<Broadcaster>) -> Self {
        SnapshotCache {
            latest: RwLock::new(None),
            bus,
        }
    }

    /// Replace the latest snapshot and publish it on the analytics channel
    pub async fn update(&self, snapshot: AnalyticsSnapshot) {
        {
            let mut latest = self.latest.write().await;
            *latest = Some(snapshot.clone());
        }
        self.bus
            .publish(Channel::Analytics, StreamMessage::Analytics(snapshot))
            .await;
    }

    pub async fn latest(&self) -> Option<AnalyticsSnapshot> {
        self.latest.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_update_replaces_and_publishes() {
        let bus = Arc::new(Broadcaster::new(8, 3));
        let cache = SnapshotCache::new(Arc::clone(&bus));
        let mut sub = bus.subscribe(Channel::Analytics).await;

        assert!(cache.latest().await.is_none());

        cache.update(AnalyticsSnapshot::new().with("zscore", 1.0)).await;
        cache.update(AnalyticsSnapshot::new().with("zscore", 2.0)).await;

        let latest = cache.latest().await.unwrap();
        assert_eq!(latest.get_f64("zscore").unwrap(), Some(2.0));

        assert!(matches!(sub.recv().await, Some(StreamMessage::Analytics(_))));
        assert!(matches!(sub.recv().await, Some(StreamMessage::Analytics(_))));
    }
}
