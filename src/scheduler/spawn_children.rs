use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, Instrument};

use super::{
    derive_child_runtime_id, fan_out_resume_key, max_concurrent_key, publish_trigger,
    SchedulerState,
};
use crate::collaborators::ParentResumer;
use crate::context::ExecutionContext;
use crate::core::config::SchedulerConfig;
use crate::core::errors::{Result, SchedulerError};
use crate::pubsub::{EventBus, TriggerMode, TriggerNodeEvent};
use crate::storage::{
    ChildCursorRecord, ChildKind, ChildRelation, CursorStore, ExecutableResponseStore, RelationStatus,
    ResponseMap,
};
use crate::waiter::{CallbackSpec, WaitNotifyEngine};

/// Fan out to an ordered list of child templates, at most
/// `max_concurrency` at a time (0 = no preference)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnChildrenRequest {
    pub request_id: String,
    pub children: Vec<String>,
    #[serde(default)]
    pub max_concurrency: u32,
}

pub struct SpawnChildrenProcessor {
    cursors: Arc<dyn CursorStore>,
    responses: Arc<dyn ExecutableResponseStore>,
    bus: Arc<dyn EventBus>,
    engine: Arc<WaitNotifyEngine>,
    resumer: Arc<dyn ParentResumer>,
    config: SchedulerConfig,
}

impl SpawnChildrenProcessor {
    pub fn new(
        cursors: Arc<dyn CursorStore>,
        responses: Arc<dyn ExecutableResponseStore>,
        bus: Arc<dyn EventBus>,
        engine: Arc<WaitNotifyEngine>,
        resumer: Arc<dyn ParentResumer>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            cursors,
            responses,
            bus,
            engine,
            resumer,
            config,
        }
    }

    /// Create the children and start the first batch; returns the runtime
    /// ids of all children in order
    pub async fn handle_spawn_children(
        &self,
        parent_context: &ExecutionContext,
        request: &SpawnChildrenRequest,
    ) -> Result<Vec<String>> {
        self.fan_out(parent_context, request)
            .instrument(parent_context.span())
            .await
    }

    async fn fan_out(
        &self,
        parent_context: &ExecutionContext,
        request: &SpawnChildrenRequest,
    ) -> Result<Vec<String>> {
        let parent_id = parent_context.current_runtime_id();
        if parent_id.is_empty() {
            return Err(SchedulerError::InvalidSpawnRequest(
                "parent context has no runtime id".to_string(),
            ));
        }
        if request.request_id.trim().is_empty() {
            return Err(SchedulerError::InvalidSpawnRequest(
                "request_id is empty".to_string(),
            ));
        }
        if request.children.iter().any(|t| t.trim().is_empty()) {
            return Err(SchedulerError::InvalidSpawnRequest(
                "child template id is empty".to_string(),
            ));
        }

        if request.children.is_empty() {
            info!("No children to spawn, resuming parent");
            self.resumer
                .resume(parent_context, ResponseMap::new())
                .await?;
            return Ok(Vec::new());
        }

        let runtime_ids: Vec<String> = (0..request.children.len())
            .map(|i| derive_child_runtime_id(parent_id, &format!("{}#{}", request.request_id, i)))
            .collect();
        let cap = self
            .config
            .effective_concurrency(runtime_ids.len(), request.max_concurrency);

        // The record must exist before any child can complete
        let record = ChildCursorRecord::new(parent_id, runtime_ids.clone(), cap, cap as u32);
        let stored = self.cursors.create(&record).await?;
        if stored.child_node_ids != runtime_ids {
            return Err(SchedulerError::InvalidSpawnRequest(format!(
                "parent {} already fans out to a different set of children",
                parent_id
            )));
        }

        for (index, (template_id, runtime_id)) in
            request.children.iter().zip(&runtime_ids).enumerate()
        {
            let relation = self
                .responses
                .record_pending_child(
                    parent_context,
                    ChildRelation::pending(runtime_id, template_id, ChildKind::Child),
                )
                .await?;

            if relation.status == RelationStatus::Pending {
                let mode = if index < cap {
                    TriggerMode::CreateAndStart
                } else {
                    TriggerMode::Create
                };
                let event = TriggerNodeEvent {
                    parent_context: parent_context.clone(),
                    template_id: template_id.clone(),
                    runtime_id: runtime_id.clone(),
                    kind: ChildKind::Child,
                    mode,
                };
                publish_trigger(self.bus.as_ref(), &self.config.publisher_name, &event).await?;
                self.responses.mark_published(parent_id, runtime_id).await?;
            } else {
                debug!(child = %runtime_id, "Trigger already published");
            }

            if runtime_ids.len() > cap && index < cap {
                self.engine
                    .arm_once(
                        &max_concurrent_key(parent_id, runtime_id),
                        CallbackSpec::MaxConcurrentChild(SchedulerState::new(parent_id, cap as u32)),
                        std::slice::from_ref(runtime_id),
                    )
                    .await?;
            }
        }

        self.engine
            .arm_once(
                &fan_out_resume_key(parent_id, &request.request_id),
                CallbackSpec::EngineResume {
                    context: parent_context.clone(),
                },
                &runtime_ids,
            )
            .await?;

        info!(
            children = runtime_ids.len(),
            max_concurrency = cap,
            "Spawned children"
        );
        Ok(runtime_ids)
    }
}
