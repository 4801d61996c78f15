// Core infrastructure: config, errors, logging
pub mod core;

pub mod context;
pub mod storage; // cursor records and spawned-child relations
pub mod lock; // per-parent leases
pub mod pubsub; // event bus and orchestration events
pub mod waiter; // durable wait/notify engine
pub mod scheduler; // spawn processors, resume callback, reconciliation
pub mod collaborators;
pub mod router;
pub mod runtime;

// Re-exports for convenience
pub use crate::core::{init_logging, Result, RetryStrategy, SchedulerConfig, SchedulerError};
pub use collaborators::{BusExecutionStarter, BusParentResumer, ExecutionStarter, ParentResumer};
pub use context::{ExecutionContext, Level};
pub use pubsub::{BroadcastEventBus, BusMessage, EventBus, TriggerMode, TriggerNodeEvent};
pub use router::{
    AbortChildrenEvent, ChildCompletedEvent, SdkResponseEventType, SdkResponseRouter,
    SpawnChildEvent, SpawnChildrenEvent,
};
pub use runtime::{OrchestrationRuntime, OrchestrationRuntimeBuilder};
pub use scheduler::{
    derive_child_runtime_id, Advance, MaxConcurrentChildScheduler, SchedulerState,
    SpawnChildProcessor, SpawnChildRequest, SpawnChildrenProcessor, SpawnChildrenRequest,
};
pub use storage::{ChildCursorRecord, CursorStore, ExecutableResponseStore, ResponseMap};
pub use waiter::{CallbackSpec, WaitNotifyEngine};
