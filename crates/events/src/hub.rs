//! Named-channel fan-out hub.
//!
//! Each channel is a bounded `tokio::sync::broadcast` channel created on
//! first subscription. Publishing never blocks: with no subscribers the
//! message is dropped, and a subscriber that falls more than the channel
//! capacity behind observes [`HubRecvError::Lagged`] instead of growing an
//! unbounded buffer.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tokio::sync::broadcast::{self, error::RecvError};

/// Default per-channel buffer capacity.
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HubRecvError {
    /// The subscriber fell behind and `n` messages were discarded for it.
    #[error("subscriber lagged, {0} messages skipped")]
    Lagged(u64),
    /// The hub was dropped; no further messages will arrive.
    #[error("hub closed")]
    Closed,
}

/// In-process publish/subscribe hub with named channels.
///
/// Shared via `Arc<BroadcastHub<M>>`. Delivery is in publish order per
/// channel and per subscriber; nothing is ordered across channels and
/// nothing is replayed to late subscribers.
pub struct BroadcastHub<M> {
    channels: RwLock<HashMap<String, broadcast::Sender<M>>>,
    capacity: usize,
}

impl<M: Clone + Send + 'static> BroadcastHub<M> {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Deliver `message` to every current subscriber of `channel`.
    pub fn publish(&self, channel: &str, message: M) {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = channels.get(channel) {
            // A send error only means every subscriber has gone away.
            let _ = sender.send(message);
        }
    }

    /// Attach a new subscriber to `channel`. Dropping the returned handle
    /// detaches it.
    pub fn subscribe(&self, channel: &str) -> Subscription<M> {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        let sender = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Subscription {
            receiver: sender.subscribe(),
        }
    }

    /// Number of live subscribers on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

impl<M: Clone + Send + 'static> Default for BroadcastHub<M> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// One subscriber's view of a channel.
pub struct Subscription<M> {
    receiver: broadcast::Receiver<M>,
}

impl<M: Clone + Send + 'static> Subscription<M> {
    /// Wait for the next message.
    pub async fn recv(&mut self) -> Result<M, HubRecvError> {
        self.receiver.recv().await.map_err(|e| match e {
            RecvError::Lagged(n) => HubRecvError::Lagged(n),
            RecvError::Closed => HubRecvError::Closed,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
