//! Event bus used to hand work to the rest of the orchestration engine
//!
//! Messages are opaque byte payloads with string metadata. Payloads of the
//! events defined in `events` are JSON.

pub mod broadcast_bus;
pub mod events;

pub use broadcast_bus::{BroadcastEventBus, EventReceiver};
pub use events::{NodeErrorEvent, NodeResumeEvent, NodeStartEvent, TriggerMode, TriggerNodeEvent};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::errors::Result;

pub const TRIGGER_NODE_TOPIC: &str = "orchestration.trigger_node";
pub const START_NODE_TOPIC: &str = "orchestration.start_node";
pub const RESUME_NODE_TOPIC: &str = "orchestration.resume_node";
pub const SDK_RESPONSE_TOPIC: &str = "orchestration.sdk_response";

// Metadata keys
pub const EVENT_TYPE_KEY: &str = "event_type";
pub const PLAN_EXECUTION_ID_KEY: &str = "plan_execution_id";
pub const PARENT_RUNTIME_ID_KEY: &str = "parent_runtime_id";
pub const PUBLISHER_KEY: &str = "publisher";
pub const ATTEMPT_KEY: &str = "attempt";

pub type Metadata = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub id: String,
    pub topic: String,
    pub metadata: Metadata,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, metadata: Metadata, payload: Vec<u8>) -> Self {
        Self {
            id: cuid2::create_id(),
            topic: topic.into(),
            metadata,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn event_type(&self) -> Option<&str> {
        self.metadata.get(EVENT_TYPE_KEY).map(String::as_str)
    }

    /// Delivery attempt recorded in metadata, 1 when absent
    pub fn attempt(&self) -> u32 {
        self.metadata
            .get(ATTEMPT_KEY)
            .and_then(|a| a.parse().ok())
            .unwrap_or(1)
    }

    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a payload; returns the id of the published message
    async fn publish(&self, topic: &str, metadata: Metadata, payload: Vec<u8>) -> Result<String>;

    /// Start receiving messages published to `topic` from now on
    fn subscribe(&self, topic: &str) -> EventReceiver;
}

/// Serialize `event` as JSON and publish it
pub async fn publish_json<T: Serialize + Sync>(
    bus: &dyn EventBus,
    topic: &str,
    metadata: Metadata,
    event: &T,
) -> Result<String> {
    let payload = serde_json::to_vec(event)?;
    bus.publish(topic, metadata, payload).await
}
