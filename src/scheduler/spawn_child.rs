use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

use super::{derive_child_runtime_id, publish_trigger, spawn_resume_key};
use crate::context::ExecutionContext;
use crate::core::errors::{Result, SchedulerError};
use crate::pubsub::{EventBus, TriggerMode, TriggerNodeEvent};
use crate::storage::{ChildKind, ChildRelation, ExecutableResponseStore, RelationStatus};
use crate::waiter::{CallbackSpec, WaitNotifyEngine};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildSpec {
    pub child_node_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildChainSpec {
    pub next_child_id: String,
}

/// Request from a running node to spawn one child.
///
/// Exactly one of `child` and `child_chain` must be set. `request_id` is
/// the idempotency key: redelivering the same request never creates a
/// second child.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnChildRequest {
    pub request_id: String,
    #[serde(default)]
    pub child: Option<ChildSpec>,
    #[serde(default)]
    pub child_chain: Option<ChildChainSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnTarget {
    Child { template_id: String },
    ChildChain { template_id: String },
}

impl SpawnTarget {
    pub fn template_id(&self) -> &str {
        match self {
            SpawnTarget::Child { template_id } | SpawnTarget::ChildChain { template_id } => {
                template_id
            }
        }
    }

    pub fn kind(&self) -> ChildKind {
        match self {
            SpawnTarget::Child { .. } => ChildKind::Child,
            SpawnTarget::ChildChain { .. } => ChildKind::ChildChain,
        }
    }
}

impl SpawnChildRequest {
    pub fn child(request_id: impl Into<String>, child_node_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            child: Some(ChildSpec {
                child_node_id: child_node_id.into(),
            }),
            child_chain: None,
        }
    }

    pub fn child_chain(request_id: impl Into<String>, next_child_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            child: None,
            child_chain: Some(ChildChainSpec {
                next_child_id: next_child_id.into(),
            }),
        }
    }

    /// Decode the populated variant
    pub fn target(&self) -> Result<SpawnTarget> {
        if self.request_id.trim().is_empty() {
            return Err(SchedulerError::InvalidSpawnRequest(
                "request_id is empty".to_string(),
            ));
        }
        let target = match (&self.child, &self.child_chain) {
            (Some(child), None) => SpawnTarget::Child {
                template_id: child.child_node_id.clone(),
            },
            (None, Some(chain)) => SpawnTarget::ChildChain {
                template_id: chain.next_child_id.clone(),
            },
            (None, None) => {
                return Err(SchedulerError::InvalidSpawnRequest(
                    "neither child nor child_chain is set".to_string(),
                ))
            }
            (Some(_), Some(_)) => {
                return Err(SchedulerError::InvalidSpawnRequest(
                    "both child and child_chain are set".to_string(),
                ))
            }
        };
        if target.template_id().trim().is_empty() {
            return Err(SchedulerError::InvalidSpawnRequest(
                "child template id is empty".to_string(),
            ));
        }
        Ok(target)
    }
}

/// Turns a spawn request into a recorded relation plus a trigger event
pub struct SpawnChildProcessor {
    responses: Arc<dyn ExecutableResponseStore>,
    bus: Arc<dyn EventBus>,
    engine: Arc<WaitNotifyEngine>,
    publisher: String,
}

impl SpawnChildProcessor {
    pub fn new(
        responses: Arc<dyn ExecutableResponseStore>,
        bus: Arc<dyn EventBus>,
        engine: Arc<WaitNotifyEngine>,
        publisher: impl Into<String>,
    ) -> Self {
        Self {
            responses,
            bus,
            engine,
            publisher: publisher.into(),
        }
    }

    /// Spawn the requested child; returns its runtime id
    pub async fn handle_spawn_request(
        &self,
        parent_context: &ExecutionContext,
        request: &SpawnChildRequest,
    ) -> Result<String> {
        self.spawn(parent_context, request)
            .instrument(parent_context.span())
            .await
    }

    async fn spawn(
        &self,
        parent_context: &ExecutionContext,
        request: &SpawnChildRequest,
    ) -> Result<String> {
        let target = request.target()?;
        let parent_runtime_id = parent_context.current_runtime_id();
        if parent_runtime_id.is_empty() {
            return Err(SchedulerError::InvalidSpawnRequest(
                "parent context has no runtime id".to_string(),
            ));
        }
        let runtime_id = derive_child_runtime_id(parent_runtime_id, &request.request_id);

        let relation = self
            .responses
            .record_pending_child(
                parent_context,
                ChildRelation::pending(&runtime_id, target.template_id(), target.kind()),
            )
            .await?;

        if relation.status == RelationStatus::Pending {
            let event = TriggerNodeEvent {
                parent_context: parent_context.clone(),
                template_id: target.template_id().to_string(),
                runtime_id: runtime_id.clone(),
                kind: target.kind(),
                mode: TriggerMode::CreateAndStart,
            };
            if let Err(e) = publish_trigger(self.bus.as_ref(), &self.publisher, &event).await {
                if let Err(cleanup) = self.responses.remove_child(parent_runtime_id, &runtime_id).await {
                    warn!(
                        child = %runtime_id,
                        error = %cleanup,
                        "Could not remove pending relation, leaving it for reconciliation"
                    );
                }
                return Err(e);
            }
            self.responses
                .mark_published(parent_runtime_id, &runtime_id)
                .await?;
        } else {
            debug!(child = %runtime_id, "Spawn already published, skipping trigger");
        }

        self.engine
            .arm_once(
                &spawn_resume_key(&runtime_id),
                CallbackSpec::EngineResume {
                    context: parent_context.clone(),
                },
                std::slice::from_ref(&runtime_id),
            )
            .await?;

        info!(
            child = %runtime_id,
            template = %target.template_id(),
            kind = ?target.kind(),
            "Spawned child"
        );
        Ok(runtime_id)
    }
}
