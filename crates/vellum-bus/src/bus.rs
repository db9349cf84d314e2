//! The [`MessageBus`] trait and per-channel subscription handle.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::warn;

use crate::error::BusResult;

/// Publish/subscribe access to the shared channel bus.
///
/// Implementations must preserve per-channel ordering and may drop
/// messages under load (at-most-once). Reconnection to a remote backend
/// is the implementation's concern and must be transparent to callers.
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    /// Subscribe to a channel, receiving every payload published after
    /// this call returns.
    async fn subscribe(&self, channel: &str) -> BusResult<BusSubscription>;

    /// Publish a payload to a channel. Channels with no subscribers
    /// swallow the payload.
    async fn publish(&self, channel: &str, payload: Bytes) -> BusResult<()>;

    /// Tear down a channel: existing subscriptions observe end-of-stream.
    async fn close(&self, channel: &str) -> BusResult<()>;
}

/// A live subscription to one bus channel.
///
/// Wraps a broadcast receiver; external broker adapters bridge their
/// native stream into one of these.
pub struct BusSubscription {
    channel: String,
    receiver: broadcast::Receiver<Bytes>,
}

impl BusSubscription {
    /// Wrap a broadcast receiver for `channel`.
    #[must_use]
    pub fn new(channel: impl Into<String>, receiver: broadcast::Receiver<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            receiver,
        }
    }

    /// The channel this subscription listens on.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Receive the next payload.
    ///
    /// Returns `None` once the channel is closed. A slow receiver that
    /// lags skips the dropped payloads and keeps receiving; bus delivery
    /// is best-effort.
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            match self.receiver.recv().await {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!(channel = %self.channel, skipped = count, "bus subscriber lagged, payloads dropped");
                },
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
