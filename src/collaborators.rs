//! Seams to the parts of the orchestration engine that live elsewhere:
//! starting a node execution and resuming a parent.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

use crate::context::ExecutionContext;
use crate::core::errors::{Result, SchedulerError};
use crate::pubsub::events::{NODE_ERROR_EVENT, RESUME_NODE_EVENT, START_NODE_EVENT};
use crate::pubsub::{
    publish_json, EventBus, Metadata, NodeErrorEvent, NodeResumeEvent, NodeStartEvent,
    EVENT_TYPE_KEY, PLAN_EXECUTION_ID_KEY, PUBLISHER_KEY, RESUME_NODE_TOPIC, START_NODE_TOPIC,
};
use crate::storage::ResponseMap;

/// Starts a node execution that was created earlier. Must be idempotent.
#[async_trait]
pub trait ExecutionStarter: Send + Sync {
    async fn start(&self, node_id: &str) -> anyhow::Result<()>;
}

/// Hands control back to a parent node
#[async_trait]
pub trait ParentResumer: Send + Sync {
    /// Resume the parent described by `context` with its children's responses
    async fn resume(&self, context: &ExecutionContext, responses: ResponseMap) -> Result<()>;

    /// Report a failure that leaves the parent unable to make progress
    async fn handle_error(&self, parent_node_id: &str, error: &SchedulerError) -> Result<()>;
}

fn base_metadata(publisher: &str, event_type: &str) -> Metadata {
    let mut metadata = HashMap::new();
    metadata.insert(EVENT_TYPE_KEY.to_string(), event_type.to_string());
    metadata.insert(PUBLISHER_KEY.to_string(), publisher.to_string());
    metadata
}

/// Starts nodes by publishing `NodeStartEvent`s
pub struct BusExecutionStarter {
    bus: Arc<dyn EventBus>,
    publisher: String,
}

impl BusExecutionStarter {
    pub fn new(bus: Arc<dyn EventBus>, publisher: impl Into<String>) -> Self {
        Self {
            bus,
            publisher: publisher.into(),
        }
    }
}

#[async_trait]
impl ExecutionStarter for BusExecutionStarter {
    async fn start(&self, node_id: &str) -> anyhow::Result<()> {
        let event = NodeStartEvent {
            node_id: node_id.to_string(),
        };
        let metadata = base_metadata(&self.publisher, START_NODE_EVENT);
        publish_json(self.bus.as_ref(), START_NODE_TOPIC, metadata, &event).await?;
        debug!(node_id = %node_id, "Published node start");
        Ok(())
    }
}

/// Resumes parents by publishing `NodeResumeEvent`s
pub struct BusParentResumer {
    bus: Arc<dyn EventBus>,
    publisher: String,
}

impl BusParentResumer {
    pub fn new(bus: Arc<dyn EventBus>, publisher: impl Into<String>) -> Self {
        Self {
            bus,
            publisher: publisher.into(),
        }
    }
}

#[async_trait]
impl ParentResumer for BusParentResumer {
    async fn resume(&self, context: &ExecutionContext, responses: ResponseMap) -> Result<()> {
        let mut metadata = base_metadata(&self.publisher, RESUME_NODE_EVENT);
        metadata.insert(
            PLAN_EXECUTION_ID_KEY.to_string(),
            context.plan_execution_id.clone(),
        );
        let event = NodeResumeEvent {
            context: context.clone(),
            responses,
        };
        publish_json(self.bus.as_ref(), RESUME_NODE_TOPIC, metadata, &event).await?;
        debug!(node_id = %context.current_runtime_id(), "Published parent resume");
        Ok(())
    }

    async fn handle_error(&self, parent_node_id: &str, error: &SchedulerError) -> Result<()> {
        error!(
            parent = %parent_node_id,
            category = error.category(),
            error = %error,
            "Parent cannot make progress"
        );
        let event = NodeErrorEvent {
            node_id: parent_node_id.to_string(),
            category: error.category().to_string(),
            message: error.to_string(),
        };
        let metadata = base_metadata(&self.publisher, NODE_ERROR_EVENT);
        publish_json(self.bus.as_ref(), RESUME_NODE_TOPIC, metadata, &event).await?;
        Ok(())
    }
}
