use async_broadcast::{InactiveReceiver, Receiver, RecvError, Sender, TrySendError};
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use super::{BusMessage, EventBus, Metadata};
use crate::core::errors::{Result, SchedulerError};

type Channel = (Sender<BusMessage>, InactiveReceiver<BusMessage>);

/// In-process bus with one bounded broadcast channel per topic.
///
/// Publishing to a topic nobody listens on fails instead of silently
/// dropping the message.
pub struct BroadcastEventBus {
    channels: DashMap<String, Channel>,
    capacity: usize,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn with_channel<R>(&self, topic: &str, f: impl FnOnce(&Channel) -> R) -> R {
        let entry = self.channels.entry(topic.to_string()).or_insert_with(|| {
            let (tx, rx) = async_broadcast::broadcast(self.capacity);
            info!(topic = %topic, capacity = self.capacity, "Created bus topic");
            (tx, rx.deactivate())
        });
        f(&entry)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.channels
            .get(topic)
            .map(|entry| entry.0.receiver_count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventBus for BroadcastEventBus {
    async fn publish(&self, topic: &str, metadata: Metadata, payload: Vec<u8>) -> Result<String> {
        let message = BusMessage::new(topic, metadata, payload);
        let id = message.id.clone();
        let sender = self.with_channel(topic, |channel| channel.0.clone());

        match sender.try_broadcast(message) {
            Ok(_) => {
                debug!(topic = %topic, message_id = %id, "Published message");
                Ok(id)
            }
            Err(TrySendError::Full(_)) => {
                warn!(topic = %topic, "Topic is full");
                Err(SchedulerError::publish_failure(topic, "channel full"))
            }
            Err(TrySendError::Inactive(_)) => {
                Err(SchedulerError::publish_failure(topic, "no active subscriber"))
            }
            Err(TrySendError::Closed(_)) => {
                Err(SchedulerError::publish_failure(topic, "channel closed"))
            }
        }
    }

    fn subscribe(&self, topic: &str) -> EventReceiver {
        let receiver = self.with_channel(topic, |channel| channel.1.activate_cloned());
        EventReceiver {
            topic: topic.to_string(),
            inner: receiver,
        }
    }
}

/// Receiving end of a topic subscription
pub struct EventReceiver {
    topic: String,
    inner: Receiver<BusMessage>,
}

impl EventReceiver {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next message, or `None` once the topic is closed
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.inner.recv().await {
                Ok(message) => return Some(message),
                Err(RecvError::Overflowed(skipped)) => {
                    warn!(topic = %self.topic, skipped, "Receiver lagged, messages skipped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next message if one is already queued
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        self.inner.try_recv().ok()
    }
}
