use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;
use crate::storage::{ChildKind, ResponseMap};

// Event type values carried in the `event_type` metadata key
pub const TRIGGER_NODE_EVENT: &str = "TRIGGER_NODE";
pub const START_NODE_EVENT: &str = "START_NODE";
pub const RESUME_NODE_EVENT: &str = "RESUME_NODE";
pub const NODE_ERROR_EVENT: &str = "NODE_ERROR";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerMode {
    /// Create the node execution and start it right away
    CreateAndStart,
    /// Create the node execution only; a scheduler starts it later
    Create,
}

/// Ask the engine to create (and maybe start) a child node execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerNodeEvent {
    pub parent_context: ExecutionContext,
    pub template_id: String,
    pub runtime_id: String,
    pub kind: ChildKind,
    pub mode: TriggerMode,
}

/// Start a node execution that was created earlier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStartEvent {
    pub node_id: String,
}

/// Resume a parent node once all of its children reported back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResumeEvent {
    pub context: ExecutionContext,
    pub responses: ResponseMap,
}

/// Report a scheduler failure the parent cannot recover from on its own
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeErrorEvent {
    pub node_id: String,
    pub category: String,
    pub message: String,
}
