//! Execution context carried alongside every node: which plan execution it
//! belongs to and the path of node levels leading to it.

use serde::{Deserialize, Serialize};
use tracing::Span;

/// One node on the path from the plan root to the current node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    /// Template (plan node) id
    pub setup_id: String,
    /// Id of this particular execution of the template
    pub runtime_id: String,
    /// Human readable identifier from the plan
    pub identifier: String,
}

impl Level {
    pub fn new(
        setup_id: impl Into<String>,
        runtime_id: impl Into<String>,
        identifier: impl Into<String>,
    ) -> Self {
        Self {
            setup_id: setup_id.into(),
            runtime_id: runtime_id.into(),
            identifier: identifier.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub account_id: String,
    pub org_id: String,
    pub project_id: String,
    pub pipeline_id: String,
    pub plan_execution_id: String,
    pub levels: Vec<Level>,
}

impl ExecutionContext {
    pub fn new(plan_execution_id: impl Into<String>) -> Self {
        Self {
            plan_execution_id: plan_execution_id.into(),
            ..Default::default()
        }
    }

    pub fn with_scope(
        mut self,
        account_id: impl Into<String>,
        org_id: impl Into<String>,
        project_id: impl Into<String>,
        pipeline_id: impl Into<String>,
    ) -> Self {
        self.account_id = account_id.into();
        self.org_id = org_id.into();
        self.project_id = project_id.into();
        self.pipeline_id = pipeline_id.into();
        self
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.levels.push(level);
        self
    }

    /// Context for a node nested one level below this one
    pub fn child(&self, level: Level) -> Self {
        self.clone().with_level(level)
    }

    pub fn current_level(&self) -> Option<&Level> {
        self.levels.last()
    }

    /// Runtime id of the innermost node, empty for a bare plan context
    pub fn current_runtime_id(&self) -> &str {
        self.current_level()
            .map(|level| level.runtime_id.as_str())
            .unwrap_or("")
    }

    pub fn current_setup_id(&self) -> &str {
        self.current_level()
            .map(|level| level.setup_id.as_str())
            .unwrap_or("")
    }

    /// Span carrying the plan execution and node ids of this context
    pub fn span(&self) -> Span {
        tracing::info_span!(
            "node",
            plan_execution_id = %self.plan_execution_id,
            node_id = %self.current_runtime_id(),
            setup_id = %self.current_setup_id(),
        )
    }
}
