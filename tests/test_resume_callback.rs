//! Resume callback behaviour of the bounded child scheduler
//!
//! Drives `MaxConcurrentChildScheduler` against sled storage and a recording
//! starter, covering ordering, the exhausted tail, duplicate delivery,
//! response accumulation and the failure paths.

use async_trait::async_trait;
use childflow::collaborators::{ExecutionStarter, ParentResumer};
use childflow::lock::{child_cursor_lock_name, LockService, SledLockService};
use childflow::storage::{ChildCursorRecord, CursorStore, ResponseMap, SledStorage};
use childflow::waiter::{CallbackRegistry, CallbackSpec, WaitNotifyEngine};
use childflow::{
    Advance, ExecutionContext, MaxConcurrentChildScheduler, RetryStrategy, SchedulerConfig,
    SchedulerError, SchedulerState,
};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct RecordingStarter {
    started: Mutex<Vec<String>>,
    fail: AtomicBool,
}

impl RecordingStarter {
    fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecutionStarter for RecordingStarter {
    async fn start(&self, node_id: &str) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("node {} cannot be started", node_id);
        }
        self.started.lock().unwrap().push(node_id.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct RecordingResumer {
    errors: Mutex<Vec<String>>,
}

#[async_trait]
impl ParentResumer for RecordingResumer {
    async fn resume(&self, _context: &ExecutionContext, _responses: ResponseMap) -> childflow::Result<()> {
        Ok(())
    }

    async fn handle_error(&self, parent_node_id: &str, _error: &SchedulerError) -> childflow::Result<()> {
        self.errors.lock().unwrap().push(parent_node_id.to_string());
        Ok(())
    }
}

struct Harness {
    scheduler: Arc<MaxConcurrentChildScheduler>,
    storage: Arc<SledStorage>,
    starter: Arc<RecordingStarter>,
    engine: Arc<WaitNotifyEngine>,
    locks: Arc<SledLockService>,
}

fn harness_with(config: SchedulerConfig) -> Harness {
    let db = sled::Config::new().temporary(true).open().unwrap();
    let storage = Arc::new(SledStorage::new(&db).unwrap());
    let locks = Arc::new(SledLockService::new(&db, config.lock_retry_interval()).unwrap());
    let engine = Arc::new(WaitNotifyEngine::new(&db, 3, RetryStrategy::Immediate).unwrap());
    let starter = Arc::new(RecordingStarter::default());
    let scheduler = Arc::new(MaxConcurrentChildScheduler::new(
        storage.clone(),
        locks.clone(),
        starter.clone(),
        engine.clone(),
        &config,
    ));
    Harness {
        scheduler,
        storage,
        starter,
        engine,
        locks,
    }
}

fn harness() -> Harness {
    harness_with(SchedulerConfig::development())
}

fn responses(entries: &[(&str, &str)]) -> ResponseMap {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
        .collect()
}

async fn seed(h: &Harness, parent: &str, children: &[&str], cursor: usize) -> SchedulerState {
    let ids = children.iter().map(|c| c.to_string()).collect();
    h.storage
        .save(&ChildCursorRecord::new(parent, ids, cursor, 1))
        .await
        .unwrap();
    SchedulerState::new(parent, 1)
}

#[tokio::test]
async fn test_children_start_in_order_then_tail_is_noop() {
    let h = harness();
    let state = seed(&h, "parent", &["A", "B", "C"], 0).await;

    for (expected_cursor, child) in [(1, "A"), (2, "B"), (3, "C")] {
        let advance = h
            .scheduler
            .on_child_completed(&state, ResponseMap::new())
            .await
            .unwrap();
        assert_eq!(
            advance,
            Advance::Started {
                child_node_id: child.to_string()
            }
        );
        let record = h.storage.load("parent").await.unwrap().unwrap();
        assert_eq!(record.cursor, expected_cursor);
    }
    assert_eq!(h.starter.started(), vec!["A", "B", "C"]);

    let before = h.storage.load("parent").await.unwrap().unwrap();
    let advance = h
        .scheduler
        .on_child_completed(&state, responses(&[("C", "done")]))
        .await
        .unwrap();
    assert_eq!(advance, Advance::Exhausted);

    // no starter call and no write
    assert_eq!(h.starter.started().len(), 3);
    assert_eq!(h.storage.load("parent").await.unwrap().unwrap(), before);
}

#[tokio::test]
async fn test_each_advance_arms_a_callback_on_the_started_child() {
    let h = harness();
    let state = seed(&h, "parent", &["A", "B"], 1).await;

    h.scheduler
        .on_child_completed(&state, responses(&[("A", "ok")]))
        .await
        .unwrap();

    let armed = h.engine.instances_on("B").unwrap();
    assert_eq!(armed.len(), 1);
    assert_eq!(armed[0].callback, CallbackSpec::MaxConcurrentChild(state.clone()));
}

#[tokio::test]
async fn test_missing_cursor_record() {
    let h = harness();
    let state = SchedulerState::new("missing", 1);

    let err = h
        .scheduler
        .on_child_completed(&state, ResponseMap::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::MissingCursorState { ref parent_node_id } if parent_node_id == "missing"
    ));
    assert!(!err.is_retryable());
    assert!(h.starter.started().is_empty());
    assert!(h.storage.load("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn test_missing_cursor_is_reported_to_the_resumer() {
    let h = harness();
    let resumer = Arc::new(RecordingResumer::default());
    let registry = CallbackRegistry::new(h.scheduler.clone(), resumer.clone());

    let ghost = CallbackSpec::MaxConcurrentChild(SchedulerState::new("ghost", 2));
    h.engine.arm(ghost, &["A".to_string()]).await.unwrap();
    h.engine.notify("A", b"done".to_vec()).await.unwrap();

    let stats = h.engine.deliver_ready(&registry).await.unwrap();
    assert_eq!(stats.dropped, 1);
    assert_eq!(*resumer.errors.lock().unwrap(), vec!["ghost".to_string()]);
}

#[tokio::test]
async fn test_exhausted_starter_retries_fail_the_parent() {
    let h = harness();
    let resumer = Arc::new(RecordingResumer::default());
    let registry = CallbackRegistry::new(h.scheduler.clone(), resumer.clone());
    let state = seed(&h, "parent", &["A", "B"], 1).await;

    h.engine
        .arm_once(
            "max-concurrent/parent/A",
            CallbackSpec::MaxConcurrentChild(state.clone()),
            &["A".to_string()],
        )
        .await
        .unwrap();
    h.engine.notify("A", b"ok".to_vec()).await.unwrap();
    h.starter.fail.store(true, Ordering::SeqCst);

    // three attempts allowed, no backoff
    for _ in 0..2 {
        let stats = h.engine.deliver_ready(&registry).await.unwrap();
        assert_eq!(stats.retried, 1);
        assert!(resumer.errors.lock().unwrap().is_empty());
    }
    let stats = h.engine.deliver_ready(&registry).await.unwrap();
    assert_eq!(stats.dropped, 1);

    assert_eq!(*resumer.errors.lock().unwrap(), vec!["parent".to_string()]);
    let record = h.storage.load("parent").await.unwrap().unwrap();
    assert!(record.terminated);
    assert_eq!(record.cursor, 1);
    assert!(h.starter.started().is_empty());

    // a late completion for the same parent no longer starts anything
    h.starter.fail.store(false, Ordering::SeqCst);
    let advance = h
        .scheduler
        .on_child_completed(&state, ResponseMap::new())
        .await
        .unwrap();
    assert_eq!(advance, Advance::Terminated);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicate_delivery_starts_one_child() {
    let h = harness();
    let state = seed(&h, "parent", &["A", "B", "C"], 1).await;
    let completion = responses(&[("A", "result")]);

    let first = {
        let scheduler = h.scheduler.clone();
        let state = state.clone();
        let completion = completion.clone();
        tokio::spawn(async move { scheduler.on_child_completed(&state, completion).await })
    };
    let second = {
        let scheduler = h.scheduler.clone();
        let state = state.clone();
        let completion = completion.clone();
        tokio::spawn(async move { scheduler.on_child_completed(&state, completion).await })
    };

    let mut outcomes = vec![first.await.unwrap().unwrap(), second.await.unwrap().unwrap()];
    outcomes.sort_by_key(|a| matches!(a, Advance::Duplicate));
    assert_eq!(
        outcomes,
        vec![
            Advance::Started {
                child_node_id: "B".to_string()
            },
            Advance::Duplicate
        ]
    );

    assert_eq!(h.starter.started(), vec!["B"]);
    let record = h.storage.load("parent").await.unwrap().unwrap();
    assert_eq!(record.cursor, 2);
}

#[tokio::test]
async fn test_redelivery_matches_single_delivery() {
    let once = harness();
    let twice = harness();
    let state = seed(&once, "parent", &["A", "B", "C"], 1).await;
    seed(&twice, "parent", &["A", "B", "C"], 1).await;
    let completion = responses(&[("A", "result")]);

    once.scheduler
        .on_child_completed(&state, completion.clone())
        .await
        .unwrap();
    twice
        .scheduler
        .on_child_completed(&state, completion.clone())
        .await
        .unwrap();
    twice
        .scheduler
        .on_child_completed(&state, completion)
        .await
        .unwrap();

    let a = once.storage.load("parent").await.unwrap().unwrap();
    let b = twice.storage.load("parent").await.unwrap().unwrap();
    assert_eq!(a.cursor, b.cursor);
    assert_eq!(a.combined_response, b.combined_response);
    assert_eq!(once.starter.started(), twice.starter.started());
}

#[tokio::test]
async fn test_responses_accumulate_across_advances() {
    let h = harness();
    let state = seed(&h, "parent", &["A", "B", "C", "D"], 2).await;

    h.scheduler
        .on_child_completed(&state, responses(&[("A", "a1")]))
        .await
        .unwrap();
    h.scheduler
        .on_child_completed(&state, responses(&[("B", "b1"), ("A", "ignored")]))
        .await
        .unwrap();

    let record = h.storage.load("parent").await.unwrap().unwrap();
    assert_eq!(record.combined_response, responses(&[("A", "a1"), ("B", "b1")]));
    assert_eq!(record.cursor, 4);
}

#[tokio::test]
async fn test_starter_failure_persists_nothing() {
    let h = harness();
    let state = seed(&h, "parent", &["A", "B"], 1).await;
    let before = h.storage.load("parent").await.unwrap().unwrap();

    h.starter.fail.store(true, Ordering::SeqCst);
    let err = h
        .scheduler
        .on_child_completed(&state, responses(&[("A", "x")]))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::StarterFailure { ref node_id, .. } if node_id == "B"));
    assert!(err.is_retryable());
    assert_eq!(h.storage.load("parent").await.unwrap().unwrap(), before);
    assert!(h.engine.instances_on("B").unwrap().is_empty());

    // the lock was released, so a retry goes through
    h.starter.fail.store(false, Ordering::SeqCst);
    let advance = h
        .scheduler
        .on_child_completed(&state, responses(&[("A", "x")]))
        .await
        .unwrap();
    assert_eq!(
        advance,
        Advance::Started {
            child_node_id: "B".to_string()
        }
    );
}

#[tokio::test]
async fn test_lock_timeout_is_retryable() {
    let config = SchedulerConfig::builder()
        .lock_timeouts(Duration::from_millis(60), Duration::from_secs(30))
        .build()
        .unwrap();
    let h = harness_with(config);
    let state = seed(&h, "parent", &["A", "B"], 1).await;

    let held = h
        .locks
        .acquire(
            &child_cursor_lock_name("parent"),
            Duration::from_millis(100),
            Duration::from_secs(30),
        )
        .await
        .unwrap();

    let err = h
        .scheduler
        .on_child_completed(&state, ResponseMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::LockTimeout { .. }));
    assert!(err.is_retryable());
    assert!(h.starter.started().is_empty());

    assert!(h.locks.release(held).await.unwrap());
    assert!(h
        .scheduler
        .on_child_completed(&state, ResponseMap::new())
        .await
        .is_ok());
}

#[tokio::test]
async fn test_abort_stops_further_starts() {
    let h = harness();
    let state = seed(&h, "parent", &["A", "B", "C"], 1).await;

    assert!(h.scheduler.abort("parent").await.unwrap());
    assert!(!h.scheduler.abort("parent").await.unwrap());

    let advance = h
        .scheduler
        .on_child_completed(&state, responses(&[("A", "x")]))
        .await
        .unwrap();
    assert_eq!(advance, Advance::Terminated);
    assert!(h.starter.started().is_empty());
    assert_eq!(h.storage.load("parent").await.unwrap().unwrap().cursor, 1);
}
