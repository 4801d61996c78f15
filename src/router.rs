//! Routing of SDK response events to the processors that handle them
//!
//! Producers publish on `orchestration.sdk_response` with the event type in
//! the `event_type` metadata key. The router owns a table from event type to
//! handler; the listener feeds it from the bus and republishes retryable
//! failures.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::context::ExecutionContext;
use crate::core::config::RetryStrategy;
use crate::core::errors::{Result, SchedulerError};
use crate::pubsub::{
    publish_json, BusMessage, EventBus, EventReceiver, ATTEMPT_KEY, EVENT_TYPE_KEY,
    PLAN_EXECUTION_ID_KEY, PUBLISHER_KEY, SDK_RESPONSE_TOPIC,
};
use crate::scheduler::{
    MaxConcurrentChildScheduler, SpawnChildProcessor, SpawnChildRequest, SpawnChildrenProcessor,
    SpawnChildrenRequest,
};
use crate::waiter::WaitNotifyEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SdkResponseEventType {
    SpawnChild,
    SpawnChildren,
    ChildCompleted,
    AbortChildren,
}

impl SdkResponseEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdkResponseEventType::SpawnChild => "SPAWN_CHILD",
            SdkResponseEventType::SpawnChildren => "SPAWN_CHILDREN",
            SdkResponseEventType::ChildCompleted => "CHILD_COMPLETED",
            SdkResponseEventType::AbortChildren => "ABORT_CHILDREN",
        }
    }
}

impl fmt::Display for SdkResponseEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SdkResponseEventType {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "SPAWN_CHILD" => Ok(SdkResponseEventType::SpawnChild),
            "SPAWN_CHILDREN" => Ok(SdkResponseEventType::SpawnChildren),
            "CHILD_COMPLETED" => Ok(SdkResponseEventType::ChildCompleted),
            "ABORT_CHILDREN" => Ok(SdkResponseEventType::AbortChildren),
            other => Err(SchedulerError::InvalidEvent(format!(
                "unknown event type '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnChildEvent {
    pub parent_context: ExecutionContext,
    pub request: SpawnChildRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnChildrenEvent {
    pub parent_context: ExecutionContext,
    pub request: SpawnChildrenRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildCompletedEvent {
    pub node_id: String,
    #[serde(default)]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbortChildrenEvent {
    pub parent_node_id: String,
}

fn decode_body<T: DeserializeOwned>(message: &BusMessage) -> Result<T> {
    message
        .decode()
        .map_err(|e| SchedulerError::InvalidEvent(format!("unreadable body of {}: {}", message.id, e)))
}

#[async_trait]
pub trait SdkResponseHandler: Send + Sync {
    async fn handle(&self, message: &BusMessage) -> Result<()>;
}

pub struct SpawnChildHandler(pub Arc<SpawnChildProcessor>);

#[async_trait]
impl SdkResponseHandler for SpawnChildHandler {
    async fn handle(&self, message: &BusMessage) -> Result<()> {
        let event: SpawnChildEvent = decode_body(message)?;
        self.0
            .handle_spawn_request(&event.parent_context, &event.request)
            .await?;
        Ok(())
    }
}

pub struct SpawnChildrenHandler(pub Arc<SpawnChildrenProcessor>);

#[async_trait]
impl SdkResponseHandler for SpawnChildrenHandler {
    async fn handle(&self, message: &BusMessage) -> Result<()> {
        let event: SpawnChildrenEvent = decode_body(message)?;
        self.0
            .handle_spawn_children(&event.parent_context, &event.request)
            .await?;
        Ok(())
    }
}

pub struct ChildCompletedHandler(pub Arc<WaitNotifyEngine>);

#[async_trait]
impl SdkResponseHandler for ChildCompletedHandler {
    async fn handle(&self, message: &BusMessage) -> Result<()> {
        let event: ChildCompletedEvent = decode_body(message)?;
        self.0.notify(&event.node_id, event.payload).await?;
        Ok(())
    }
}

pub struct AbortChildrenHandler(pub Arc<MaxConcurrentChildScheduler>);

#[async_trait]
impl SdkResponseHandler for AbortChildrenHandler {
    async fn handle(&self, message: &BusMessage) -> Result<()> {
        let event: AbortChildrenEvent = decode_body(message)?;
        self.0.abort(&event.parent_node_id).await?;
        Ok(())
    }
}

/// Event type to handler table, fixed once the router is built
#[derive(Default)]
pub struct SdkResponseRouter {
    handlers: HashMap<SdkResponseEventType, Arc<dyn SdkResponseHandler>>,
}

impl SdkResponseRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(
        mut self,
        event_type: SdkResponseEventType,
        handler: Arc<dyn SdkResponseHandler>,
    ) -> Self {
        self.handlers.insert(event_type, handler);
        self
    }

    /// Router with a handler for every event type
    pub fn standard(
        spawn_child: Arc<SpawnChildProcessor>,
        spawn_children: Arc<SpawnChildrenProcessor>,
        engine: Arc<WaitNotifyEngine>,
        scheduler: Arc<MaxConcurrentChildScheduler>,
    ) -> Self {
        Self::new()
            .with_handler(
                SdkResponseEventType::SpawnChild,
                Arc::new(SpawnChildHandler(spawn_child)),
            )
            .with_handler(
                SdkResponseEventType::SpawnChildren,
                Arc::new(SpawnChildrenHandler(spawn_children)),
            )
            .with_handler(
                SdkResponseEventType::ChildCompleted,
                Arc::new(ChildCompletedHandler(engine)),
            )
            .with_handler(
                SdkResponseEventType::AbortChildren,
                Arc::new(AbortChildrenHandler(scheduler)),
            )
    }

    pub async fn route(&self, message: &BusMessage) -> Result<()> {
        let raw = message
            .event_type()
            .ok_or_else(|| SchedulerError::InvalidEvent(format!("message {} has no event type", message.id)))?;
        let event_type: SdkResponseEventType = raw.parse()?;
        let handler = self.handlers.get(&event_type).ok_or_else(|| {
            SchedulerError::InvalidEvent(format!("no handler registered for {}", event_type))
        })?;
        debug!(message_id = %message.id, event_type = %event_type, "Routing event");
        handler.handle(message).await
    }
}

/// Publish an SDK response event for the router to pick up
pub async fn publish_sdk_response<T: Serialize + Sync>(
    bus: &dyn EventBus,
    publisher: &str,
    event_type: SdkResponseEventType,
    plan_execution_id: &str,
    event: &T,
) -> Result<String> {
    let mut metadata = HashMap::new();
    metadata.insert(EVENT_TYPE_KEY.to_string(), event_type.as_str().to_string());
    metadata.insert(PUBLISHER_KEY.to_string(), publisher.to_string());
    metadata.insert(
        PLAN_EXECUTION_ID_KEY.to_string(),
        plan_execution_id.to_string(),
    );
    publish_json(bus, SDK_RESPONSE_TOPIC, metadata, event).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Handled,
    Republished,
    Dropped,
}

/// Consumes the SDK response topic and feeds the router
pub struct SdkResponseListener {
    router: Arc<SdkResponseRouter>,
    bus: Arc<dyn EventBus>,
    max_attempts: u32,
    retry_strategy: RetryStrategy,
}

impl SdkResponseListener {
    pub fn new(
        router: Arc<SdkResponseRouter>,
        bus: Arc<dyn EventBus>,
        max_attempts: u32,
        retry_strategy: RetryStrategy,
    ) -> Self {
        Self {
            router,
            bus,
            max_attempts: max_attempts.max(1),
            retry_strategy,
        }
    }

    /// Route one message, republishing it on a retryable failure.
    ///
    /// The backoff before republishing is cut short once `shutdown` flips,
    /// so a pending retry is handed back to the bus instead of lost.
    pub async fn process(&self, message: BusMessage, shutdown: &watch::Receiver<bool>) -> Disposition {
        let attempt = message.attempt();
        let error = match self.router.route(&message).await {
            Ok(()) => return Disposition::Handled,
            Err(e) => e,
        };

        if !error.is_retryable() || attempt >= self.max_attempts {
            error!(
                message_id = %message.id,
                event_type = message.event_type().unwrap_or("?"),
                attempt,
                category = error.category(),
                error = %error,
                "Dropping event"
            );
            return Disposition::Dropped;
        }

        warn!(
            message_id = %message.id,
            attempt,
            error = %error,
            "Event failed, republishing"
        );
        let mut shutdown = shutdown.clone();
        if !*shutdown.borrow() {
            tokio::select! {
                _ = tokio::time::sleep(self.retry_strategy.delay_for(attempt)) => {}
                _ = shutdown.changed() => {
                    debug!(message_id = %message.id, "Shutting down, republishing without backoff");
                }
            }
        }

        let mut metadata = message.metadata.clone();
        metadata.insert(ATTEMPT_KEY.to_string(), (attempt + 1).to_string());
        match self.bus.publish(&message.topic, metadata, message.payload).await {
            Ok(_) => Disposition::Republished,
            Err(e) => {
                error!(message_id = %message.id, error = %e, "Republish failed, event lost");
                Disposition::Dropped
            }
        }
    }

    /// Process messages from `receiver` until shutdown, then wait for the
    /// messages still in flight
    pub async fn run(self: Arc<Self>, mut receiver: EventReceiver, mut shutdown: watch::Receiver<bool>) {
        info!(topic = receiver.topic(), "SDK response listener started");
        let mut in_flight = JoinSet::new();
        loop {
            tokio::select! {
                message = receiver.recv() => {
                    let Some(message) = message else { break };
                    let listener = self.clone();
                    let shutdown = shutdown.clone();
                    in_flight.spawn(async move {
                        listener.process(message, &shutdown).await
                    });
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "Event task ended abnormally");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let pending = in_flight.len();
        if pending > 0 {
            info!(pending, "Waiting for in-flight events");
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Event task ended abnormally");
            }
        }
        info!("SDK response listener stopped");
    }
}
