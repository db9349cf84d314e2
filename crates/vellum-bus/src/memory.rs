//! In-process bus implementation over per-channel broadcast channels.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::bus::{BusSubscription, MessageBus};
use crate::error::BusResult;

/// Default per-channel buffer depth.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Process-local [`MessageBus`] backed by `tokio::sync::broadcast`.
///
/// Every hub sharing one `InProcessBus` instance sees every other hub's
/// publishes, which is exactly the replica topology, so this is both the
/// single-process production backend and the cross-replica test vehicle.
#[derive(Debug)]
pub struct InProcessBus {
    channels: DashMap<String, broadcast::Sender<Bytes>>,
    capacity: usize,
}

impl InProcessBus {
    /// Create a bus with the default per-channel capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a bus with an explicit per-channel capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity,
        }
    }

    /// Number of live channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InProcessBus {
    async fn subscribe(&self, channel: &str) -> BusResult<BusSubscription> {
        let receiver = self
            .channels
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        debug!(channel, "bus subscription established");
        Ok(BusSubscription::new(channel, receiver))
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> BusResult<()> {
        match self.channels.get(channel) {
            Some(sender) => {
                // A send error just means no live subscribers.
                let delivered = sender.send(payload).unwrap_or(0);
                trace!(channel, delivered, "bus publish");
            },
            None => {
                trace!(channel, "bus publish on channel with no subscribers");
            },
        }
        Ok(())
    }

    async fn close(&self, channel: &str) -> BusResult<()> {
        if self.channels.remove(channel).is_some() {
            debug!(channel, "bus channel closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = InProcessBus::new();
        let mut sub_a = bus.subscribe("room:p/doc").await.unwrap();
        let mut sub_b = bus.subscribe("room:p/doc").await.unwrap();

        bus.publish("room:p/doc", Bytes::from_static(b"hello"))
            .await
            .unwrap();

        assert_eq!(sub_a.recv().await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(sub_b.recv().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let bus = InProcessBus::new();
        let mut sub_a = bus.subscribe("room:p/a").await.unwrap();
        let _sub_b = bus.subscribe("room:p/b").await.unwrap();

        bus.publish("room:p/b", Bytes::from_static(b"other"))
            .await
            .unwrap();
        bus.publish("room:p/a", Bytes::from_static(b"mine"))
            .await
            .unwrap();

        assert_eq!(sub_a.recv().await.unwrap(), Bytes::from_static(b"mine"));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped() {
        let bus = InProcessBus::new();
        // Must not error or panic.
        bus.publish("room:p/ghost", Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert_eq!(bus.channel_count(), 0);
    }

    #[tokio::test]
    async fn close_ends_subscriptions() {
        let bus = InProcessBus::new();
        let mut sub = bus.subscribe("room:p/doc").await.unwrap();

        bus.close("room:p/doc").await.unwrap();

        assert!(sub.recv().await.is_none());
        assert_eq!(bus.channel_count(), 0);
    }

    #[tokio::test]
    async fn subscription_survives_publisher_lag() {
        let bus = InProcessBus::with_capacity(4);
        let mut sub = bus.subscribe("room:p/doc").await.unwrap();

        // Overrun the buffer; early payloads are dropped, late ones arrive.
        for i in 0u8..16 {
            bus.publish("room:p/doc", Bytes::from(vec![i])).await.unwrap();
        }

        let payload = sub.recv().await.unwrap();
        assert!(!payload.is_empty());
    }
}
