//! Child execution scheduling
//!
//! * `resume` advances a parent's cursor one child per completion, under a
//!   per-parent lock.
//! * `spawn_child` handles a single dynamically requested child.
//! * `spawn_children` starts a bounded fan-out.
//! * `reconcile` republishes spawn triggers that never made it to the bus.

pub mod reconcile;
pub mod resume;
pub mod spawn_child;
pub mod spawn_children;

pub use reconcile::{ReconciliationSweep, SweepStats};
pub use resume::{Advance, MaxConcurrentChildScheduler};
pub use spawn_child::{ChildChainSpec, ChildSpec, SpawnChildProcessor, SpawnChildRequest, SpawnTarget};
pub use spawn_children::{SpawnChildrenProcessor, SpawnChildrenRequest};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::core::errors::Result;
use crate::pubsub::events::TRIGGER_NODE_EVENT;
use crate::pubsub::{
    publish_json, EventBus, TriggerNodeEvent, EVENT_TYPE_KEY, PARENT_RUNTIME_ID_KEY,
    PLAN_EXECUTION_ID_KEY, PUBLISHER_KEY, TRIGGER_NODE_TOPIC,
};

/// Carried by every cursor-advance callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub parent_node_id: String,
    pub max_concurrency: u32,
}

impl SchedulerState {
    pub fn new(parent_node_id: impl Into<String>, max_concurrency: u32) -> Self {
        Self {
            parent_node_id: parent_node_id.into(),
            max_concurrency,
        }
    }
}

/// Runtime id of a spawned child, stable across redeliveries of the request
pub fn derive_child_runtime_id(parent_runtime_id: &str, request_key: &str) -> String {
    let name = format!("childflow:{}/{}", parent_runtime_id, request_key);
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
}

/// Idempotency key of the callback resuming a parent after one spawned child
pub(crate) fn spawn_resume_key(child_runtime_id: &str) -> String {
    format!("engine-resume/child/{}", child_runtime_id)
}

/// Idempotency key of the callback resuming a parent after a whole fan-out
pub(crate) fn fan_out_resume_key(parent_runtime_id: &str, request_id: &str) -> String {
    format!("engine-resume/fan-out/{}/{}", parent_runtime_id, request_id)
}

pub(crate) fn max_concurrent_key(parent_node_id: &str, child_node_id: &str) -> String {
    format!("max-concurrent/{}/{}", parent_node_id, child_node_id)
}

/// Publish a trigger event with the metadata consumers route on
pub(crate) async fn publish_trigger(
    bus: &dyn EventBus,
    publisher: &str,
    event: &TriggerNodeEvent,
) -> Result<String> {
    let mut metadata = HashMap::new();
    metadata.insert(EVENT_TYPE_KEY.to_string(), TRIGGER_NODE_EVENT.to_string());
    metadata.insert(PUBLISHER_KEY.to_string(), publisher.to_string());
    metadata.insert(
        PLAN_EXECUTION_ID_KEY.to_string(),
        event.parent_context.plan_execution_id.clone(),
    );
    metadata.insert(
        PARENT_RUNTIME_ID_KEY.to_string(),
        event.parent_context.current_runtime_id().to_string(),
    );
    publish_json(bus, TRIGGER_NODE_TOPIC, metadata, event).await
}
