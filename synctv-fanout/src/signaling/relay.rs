//! Signaling relay contract and the in-process implementation

use super::SignalingMessage;
use crate::error::{Error, Result};
use crate::types::StreamId;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Handle identifying one subscription on the relay
pub type SubscriptionId = String;

/// Live subscription to a stream's channel
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub messages: mpsc::UnboundedReceiver<SignalingMessage>,
}

/// Ordered, at-least-once publish/subscribe bus keyed by stream id.
///
/// A successful `subscribe` is the subscription acknowledgment.
#[async_trait]
pub trait SignalingRelay: Send + Sync {
    async fn subscribe(&self, stream_id: &StreamId) -> Result<Subscription>;

    async fn publish(&self, stream_id: &StreamId, message: SignalingMessage) -> Result<()>;

    async fn unsubscribe(&self, subscription: &SubscriptionId) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Subscriber {
    id: SubscriptionId,
    sender: mpsc::UnboundedSender<SignalingMessage>,
}

/// In-memory relay routing messages between participants in one process
#[derive(Clone, Default)]
pub struct LocalRelay {
    /// Map of stream_id -> list of subscribers
    streams: Arc<DashMap<StreamId, Vec<Subscriber>>>,

    /// Map of subscription_id -> stream_id for cleanup
    subscriptions: Arc<DashMap<SubscriptionId, StreamId>>,
}

impl LocalRelay {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn subscriber_count(&self, stream_id: &StreamId) -> usize {
        self.streams.get(stream_id).map_or(0, |subs| subs.len())
    }

    fn remove(&self, subscription: &str) -> bool {
        let Some((_, stream_id)) = self.subscriptions.remove(subscription) else {
            return false;
        };

        if let Some(mut subscribers) = self.streams.get_mut(&stream_id) {
            subscribers.retain(|sub| sub.id != subscription);

            if subscribers.is_empty() {
                drop(subscribers); // Drop the RefMut before removing
                self.streams.remove(&stream_id);
                debug!(stream_id = %stream_id, "Stream has no more subscribers, removed");
            }
        }
        true
    }
}

#[async_trait]
impl SignalingRelay for LocalRelay {
    async fn subscribe(&self, stream_id: &StreamId) -> Result<Subscription> {
        let (sender, messages) = mpsc::unbounded_channel();
        let id: SubscriptionId = nanoid::nanoid!(16);

        self.streams
            .entry(stream_id.clone())
            .or_default()
            .push(Subscriber {
                id: id.clone(),
                sender,
            });
        self.subscriptions.insert(id.clone(), stream_id.clone());

        info!(stream_id = %stream_id, subscription_id = %id, "Subscribed to stream channel");

        Ok(Subscription { id, messages })
    }

    async fn publish(&self, stream_id: &StreamId, message: SignalingMessage) -> Result<()> {
        if &message.stream_id != stream_id {
            return Err(Error::Signaling(format!(
                "message for stream {} published on channel {stream_id}",
                message.stream_id
            )));
        }

        let mut closed = Vec::new();
        if let Some(subscribers) = self.streams.get(stream_id) {
            for subscriber in subscribers.iter() {
                if subscriber.sender.send(message.clone()).is_err() {
                    closed.push(subscriber.id.clone());
                }
            }
        }

        for id in closed {
            warn!(stream_id = %stream_id, subscription_id = %id, "Dropping closed subscriber");
            self.remove(&id);
        }

        debug!(
            stream_id = %stream_id,
            sender_id = %message.sender_id,
            message_type = message.message_type(),
            "Message published"
        );
        Ok(())
    }

    async fn unsubscribe(&self, subscription: &SubscriptionId) -> Result<()> {
        if self.remove(subscription) {
            info!(subscription_id = %subscription, "Unsubscribed from stream channel");
        } else {
            warn!(subscription_id = %subscription, "Attempted to unsubscribe unknown subscription");
        }
        Ok(())
    }
}
