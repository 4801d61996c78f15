use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::collaborators::ParentResumer;
use crate::context::ExecutionContext;
use crate::core::errors::{Result, SchedulerError};
use crate::scheduler::{MaxConcurrentChildScheduler, SchedulerState};
use crate::storage::ResponseMap;

/// Persisted description of what to run when a wait completes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallbackSpec {
    /// A child of a bounded fan-out finished; start the next one
    MaxConcurrentChild(SchedulerState),
    /// Every watched child finished; resume the parent
    EngineResume { context: ExecutionContext },
}

impl CallbackSpec {
    pub fn name(&self) -> &'static str {
        match self {
            CallbackSpec::MaxConcurrentChild(_) => "max_concurrent_child",
            CallbackSpec::EngineResume { .. } => "engine_resume",
        }
    }
}

/// Runs a fired callback
#[async_trait]
pub trait CallbackDispatcher: Send + Sync {
    async fn dispatch(&self, callback: &CallbackSpec, responses: ResponseMap) -> Result<()>;

    /// Called once when the engine gives up on a callback after its final
    /// failed attempt
    async fn on_dropped(&self, _callback: &CallbackSpec, _error: &SchedulerError) {}
}

/// Dispatches each `CallbackSpec` variant to the component that owns it
pub struct CallbackRegistry {
    scheduler: Arc<MaxConcurrentChildScheduler>,
    resumer: Arc<dyn ParentResumer>,
}

impl CallbackRegistry {
    pub fn new(scheduler: Arc<MaxConcurrentChildScheduler>, resumer: Arc<dyn ParentResumer>) -> Self {
        Self { scheduler, resumer }
    }
}

#[async_trait]
impl CallbackDispatcher for CallbackRegistry {
    async fn dispatch(&self, callback: &CallbackSpec, responses: ResponseMap) -> Result<()> {
        match callback {
            CallbackSpec::MaxConcurrentChild(state) => {
                let advance = self.scheduler.on_child_completed(state, responses).await?;
                info!(parent = %state.parent_node_id, ?advance, "Child completion handled");
                Ok(())
            }
            CallbackSpec::EngineResume { context } => {
                self.resumer.resume(context, responses).await
            }
        }
    }

    /// A dropped child callback would leave the parent waiting forever, so
    /// the parent is failed and its fan-out stopped
    async fn on_dropped(&self, callback: &CallbackSpec, error: &SchedulerError) {
        let parent = match callback {
            CallbackSpec::MaxConcurrentChild(state) => state.parent_node_id.as_str(),
            CallbackSpec::EngineResume { context } => context.current_runtime_id(),
        };

        if let Err(report) = self.resumer.handle_error(parent, error).await {
            error!(parent = %parent, error = %report, "Failed to report dropped callback");
        }

        if let CallbackSpec::MaxConcurrentChild(_) = callback {
            if matches!(error, SchedulerError::MissingCursorState { .. }) {
                return;
            }
            if let Err(e) = self.scheduler.abort(parent).await {
                warn!(parent = %parent, error = %e, "Failed to stop fan-out after dropped callback");
            }
        }
    }
}
