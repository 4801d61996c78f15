//! Spawn processors: single child, child chain and bounded fan-out
//!
//! A fault-injecting bus and store wrap the real implementations so the
//! publish and compensation failure paths can be exercised.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use childflow::collaborators::ParentResumer;
use childflow::context::{ExecutionContext, Level};
use childflow::pubsub::{
    BroadcastEventBus, EventBus, EventReceiver, Metadata, TriggerMode, TriggerNodeEvent,
    TRIGGER_NODE_TOPIC,
};
use childflow::scheduler::{
    derive_child_runtime_id, ReconciliationSweep, SpawnChildProcessor, SpawnChildRequest,
    SpawnChildrenProcessor, SpawnChildrenRequest,
};
use childflow::storage::{
    ChildKind, ChildRelation, CursorStore, ExecutableResponseStore, PendingChild, RelationStatus,
    ResponseMap, SledStorage,
};
use childflow::waiter::{CallbackSpec, WaitNotifyEngine};
use childflow::{RetryStrategy, SchedulerConfig, SchedulerError};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Broadcast bus that can be told to reject trigger publishes
struct FaultyBus {
    inner: BroadcastEventBus,
    fail_triggers: AtomicBool,
}

impl FaultyBus {
    fn new() -> Self {
        Self {
            inner: BroadcastEventBus::new(64),
            fail_triggers: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl EventBus for FaultyBus {
    async fn publish(&self, topic: &str, metadata: Metadata, payload: Vec<u8>) -> childflow::Result<String> {
        if topic == TRIGGER_NODE_TOPIC && self.fail_triggers.load(Ordering::SeqCst) {
            return Err(SchedulerError::publish_failure(topic, "injected fault"));
        }
        self.inner.publish(topic, metadata, payload).await
    }

    fn subscribe(&self, topic: &str) -> EventReceiver {
        self.inner.subscribe(topic)
    }
}

/// Response store whose compensation step always fails
struct StuckStore {
    inner: Arc<SledStorage>,
}

#[async_trait]
impl ExecutableResponseStore for StuckStore {
    async fn record_pending_child(
        &self,
        parent_context: &ExecutionContext,
        relation: ChildRelation,
    ) -> childflow::Result<ChildRelation> {
        self.inner.record_pending_child(parent_context, relation).await
    }

    async fn mark_published(&self, parent_runtime_id: &str, runtime_id: &str) -> childflow::Result<bool> {
        self.inner.mark_published(parent_runtime_id, runtime_id).await
    }

    async fn remove_child(&self, _parent_runtime_id: &str, _runtime_id: &str) -> childflow::Result<bool> {
        Err(SchedulerError::storage("store unavailable"))
    }

    async fn children(&self, parent_runtime_id: &str) -> childflow::Result<Vec<ChildRelation>> {
        self.inner.children(parent_runtime_id).await
    }

    async fn pending_older_than(&self, cutoff: DateTime<Utc>) -> childflow::Result<Vec<PendingChild>> {
        self.inner.pending_older_than(cutoff).await
    }
}

#[derive(Default)]
struct RecordingResumer {
    resumed: Mutex<Vec<(String, ResponseMap)>>,
}

#[async_trait]
impl ParentResumer for RecordingResumer {
    async fn resume(&self, context: &ExecutionContext, responses: ResponseMap) -> childflow::Result<()> {
        self.resumed
            .lock()
            .unwrap()
            .push((context.current_runtime_id().to_string(), responses));
        Ok(())
    }

    async fn handle_error(&self, _parent_node_id: &str, _error: &SchedulerError) -> childflow::Result<()> {
        Ok(())
    }
}

struct Harness {
    storage: Arc<SledStorage>,
    bus: Arc<FaultyBus>,
    engine: Arc<WaitNotifyEngine>,
    resumer: Arc<RecordingResumer>,
    spawn_child: SpawnChildProcessor,
    spawn_children: SpawnChildrenProcessor,
}

fn harness() -> Harness {
    let db = sled::Config::new().temporary(true).open().unwrap();
    let storage = Arc::new(SledStorage::new(&db).unwrap());
    let bus = Arc::new(FaultyBus::new());
    let engine = Arc::new(WaitNotifyEngine::new(&db, 3, RetryStrategy::Immediate).unwrap());
    let resumer = Arc::new(RecordingResumer::default());
    let spawn_child = SpawnChildProcessor::new(storage.clone(), bus.clone(), engine.clone(), "test");
    let spawn_children = SpawnChildrenProcessor::new(
        storage.clone(),
        storage.clone(),
        bus.clone(),
        engine.clone(),
        resumer.clone(),
        SchedulerConfig::development(),
    );
    Harness {
        storage,
        bus,
        engine,
        resumer,
        spawn_child,
        spawn_children,
    }
}

fn parent() -> ExecutionContext {
    ExecutionContext::new("plan-1")
        .with_scope("acc", "org", "proj", "pipe")
        .with_level(Level::new("stage-tpl", "parent-rt", "stage"))
}

fn drain(rx: &mut EventReceiver) -> Vec<TriggerNodeEvent> {
    let mut events = Vec::new();
    while let Some(message) = rx.try_recv() {
        events.push(message.decode().unwrap());
    }
    events
}

#[tokio::test]
async fn test_spawn_child_publishes_one_trigger() {
    let h = harness();
    let mut rx = h.bus.subscribe(TRIGGER_NODE_TOPIC);

    let runtime_id = h
        .spawn_child
        .handle_spawn_request(&parent(), &SpawnChildRequest::child("req-1", "step-tpl"))
        .await
        .unwrap();
    assert!(!runtime_id.is_empty());

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].runtime_id, runtime_id);
    assert_eq!(events[0].template_id, "step-tpl");
    assert_eq!(events[0].kind, ChildKind::Child);
    assert_eq!(events[0].mode, TriggerMode::CreateAndStart);
    assert_eq!(events[0].parent_context, parent());

    let children = h.storage.children("parent-rt").await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].status, RelationStatus::Published);

    let armed = h.engine.instances_on(&runtime_id).unwrap();
    assert_eq!(armed.len(), 1);
    assert_eq!(armed[0].callback, CallbackSpec::EngineResume { context: parent() });
}

#[tokio::test]
async fn test_spawn_child_chain_uses_next_child_id() {
    let h = harness();
    let mut rx = h.bus.subscribe(TRIGGER_NODE_TOPIC);

    h.spawn_child
        .handle_spawn_request(&parent(), &SpawnChildRequest::child_chain("req-2", "link-2"))
        .await
        .unwrap();

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].template_id, "link-2");
    assert_eq!(events[0].kind, ChildKind::ChildChain);
}

#[tokio::test]
async fn test_invalid_spawn_requests_publish_nothing() {
    let h = harness();
    let mut rx = h.bus.subscribe(TRIGGER_NODE_TOPIC);

    let neither = SpawnChildRequest {
        request_id: "req-3".to_string(),
        ..Default::default()
    };
    let mut both = SpawnChildRequest::child("req-4", "a");
    both.child_chain = SpawnChildRequest::child_chain("req-4", "b").child_chain;
    let blank = SpawnChildRequest::child("req-5", "  ");

    for request in [neither, both, blank] {
        let err = h
            .spawn_child
            .handle_spawn_request(&parent(), &request)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSpawnRequest(_)));
        assert!(!err.is_retryable());
    }

    assert!(drain(&mut rx).is_empty());
    assert!(h.storage.children("parent-rt").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_redelivered_request_spawns_once() {
    let h = harness();
    let mut rx = h.bus.subscribe(TRIGGER_NODE_TOPIC);
    let request = SpawnChildRequest::child("req-6", "step-tpl");

    let first = h.spawn_child.handle_spawn_request(&parent(), &request).await.unwrap();
    let second = h.spawn_child.handle_spawn_request(&parent(), &request).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first, derive_child_runtime_id("parent-rt", "req-6"));
    assert_eq!(drain(&mut rx).len(), 1);
    assert_eq!(h.storage.children("parent-rt").await.unwrap().len(), 1);
    assert_eq!(h.engine.instances_on(&first).unwrap().len(), 1);
}

#[tokio::test]
async fn test_publish_failure_leaves_no_relation() {
    let h = harness();
    let mut rx = h.bus.subscribe(TRIGGER_NODE_TOPIC);
    h.bus.fail_triggers.store(true, Ordering::SeqCst);

    let request = SpawnChildRequest::child("req-7", "step-tpl");
    let err = h
        .spawn_child
        .handle_spawn_request(&parent(), &request)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::PublishFailure { .. }));
    assert!(err.is_retryable());
    assert!(h.storage.children("parent-rt").await.unwrap().is_empty());
    assert!(drain(&mut rx).is_empty());

    // a retry of the same request lands exactly one child
    h.bus.fail_triggers.store(false, Ordering::SeqCst);
    let runtime_id = h.spawn_child.handle_spawn_request(&parent(), &request).await.unwrap();
    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].runtime_id, runtime_id);
    assert_eq!(h.storage.children("parent-rt").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_failed_compensation_is_repaired_by_reconciliation() {
    let h = harness();
    let mut rx = h.bus.subscribe(TRIGGER_NODE_TOPIC);
    let stuck = Arc::new(StuckStore {
        inner: h.storage.clone(),
    });
    let processor = SpawnChildProcessor::new(stuck, h.bus.clone(), h.engine.clone(), "test");

    h.bus.fail_triggers.store(true, Ordering::SeqCst);
    let err = processor
        .handle_spawn_request(&parent(), &SpawnChildRequest::child("req-8", "step-tpl"))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::PublishFailure { .. }));

    let children = h.storage.children("parent-rt").await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].status, RelationStatus::Pending);

    h.bus.fail_triggers.store(false, Ordering::SeqCst);
    let sweep = ReconciliationSweep::new(
        h.storage.clone(),
        h.storage.clone(),
        h.bus.clone(),
        h.engine.clone(),
        "test",
    );
    let stats = sweep.run_once(Duration::ZERO).await.unwrap();
    assert_eq!(stats.republished, 1);

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].runtime_id, children[0].runtime_id);
    assert_eq!(
        h.storage.children("parent-rt").await.unwrap()[0].status,
        RelationStatus::Published
    );
}

#[tokio::test]
async fn test_fan_out_starts_cap_children() {
    let h = harness();
    let mut rx = h.bus.subscribe(TRIGGER_NODE_TOPIC);
    let request = SpawnChildrenRequest {
        request_id: "fan-1".to_string(),
        children: vec!["t0", "t1", "t2", "t3", "t4"]
            .into_iter()
            .map(String::from)
            .collect(),
        max_concurrency: 2,
    };

    let ids = h
        .spawn_children
        .handle_spawn_children(&parent(), &request)
        .await
        .unwrap();
    assert_eq!(ids.len(), 5);
    assert_eq!(ids[0], derive_child_runtime_id("parent-rt", "fan-1#0"));

    let modes: Vec<TriggerMode> = drain(&mut rx).into_iter().map(|e| e.mode).collect();
    assert_eq!(
        modes,
        vec![
            TriggerMode::CreateAndStart,
            TriggerMode::CreateAndStart,
            TriggerMode::Create,
            TriggerMode::Create,
            TriggerMode::Create,
        ]
    );

    let record = h.storage.load("parent-rt").await.unwrap().unwrap();
    assert_eq!(record.cursor, 2);
    assert_eq!(record.child_node_ids, ids);

    // in-flight children carry a cursor callback plus the shared resume
    assert_eq!(h.engine.instances_on(&ids[0]).unwrap().len(), 2);
    assert_eq!(h.engine.instances_on(&ids[1]).unwrap().len(), 2);
    assert_eq!(h.engine.instances_on(&ids[2]).unwrap().len(), 1);

    // redelivery reuses everything
    let again = h
        .spawn_children
        .handle_spawn_children(&parent(), &request)
        .await
        .unwrap();
    assert_eq!(again, ids);
    assert!(drain(&mut rx).is_empty());
    assert_eq!(h.engine.instances_on(&ids[0]).unwrap().len(), 2);
    assert_eq!(h.storage.children("parent-rt").await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_fan_out_within_cap_arms_no_cursor_callbacks() {
    let h = harness();
    let mut rx = h.bus.subscribe(TRIGGER_NODE_TOPIC);
    let request = SpawnChildrenRequest {
        request_id: "fan-2".to_string(),
        children: vec!["t0".to_string(), "t1".to_string()],
        max_concurrency: 0,
    };

    let ids = h
        .spawn_children
        .handle_spawn_children(&parent(), &request)
        .await
        .unwrap();

    assert!(drain(&mut rx)
        .iter()
        .all(|e| e.mode == TriggerMode::CreateAndStart));
    for id in &ids {
        let armed = h.engine.instances_on(id).unwrap();
        assert_eq!(armed.len(), 1);
        assert!(matches!(armed[0].callback, CallbackSpec::EngineResume { .. }));
    }
    assert!(h.storage.load("parent-rt").await.unwrap().unwrap().is_exhausted());
}

#[tokio::test]
async fn test_empty_fan_out_resumes_parent() {
    let h = harness();
    let request = SpawnChildrenRequest {
        request_id: "fan-3".to_string(),
        children: Vec::new(),
        max_concurrency: 3,
    };

    let ids = h
        .spawn_children
        .handle_spawn_children(&parent(), &request)
        .await
        .unwrap();
    assert!(ids.is_empty());
    assert_eq!(
        *h.resumer.resumed.lock().unwrap(),
        vec![("parent-rt".to_string(), ResponseMap::new())]
    );
    assert!(h.storage.load("parent-rt").await.unwrap().is_none());
}

#[tokio::test]
async fn test_second_fan_out_for_same_parent_is_rejected() {
    let h = harness();
    let _rx = h.bus.subscribe(TRIGGER_NODE_TOPIC);
    let first = SpawnChildrenRequest {
        request_id: "fan-4".to_string(),
        children: vec!["t0".to_string()],
        max_concurrency: 1,
    };
    let second = SpawnChildrenRequest {
        request_id: "fan-5".to_string(),
        ..first.clone()
    };

    h.spawn_children
        .handle_spawn_children(&parent(), &first)
        .await
        .unwrap();
    let err = h
        .spawn_children
        .handle_spawn_children(&parent(), &second)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidSpawnRequest(_)));
}
