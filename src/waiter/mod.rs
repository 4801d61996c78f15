//! Completion subscriptions
//!
//! A callback is armed on one or more correlation ids (node runtime ids) and
//! fires once every one of them has been notified. Registrations, responses
//! and the ready queue live in sled so an armed callback survives restarts.
//!
//! Delivery is at-least-once: a callback that was claimed but not completed
//! before a crash is handed out again by `recover`.

pub mod callback;

pub use callback::{CallbackDispatcher, CallbackRegistry, CallbackSpec};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use crate::core::config::RetryStrategy;
use crate::core::errors::{Result, SchedulerError};
use crate::storage::{codec, ResponseMap};

const INSTANCE_TREE: &str = "wait_instances";
const INDEX_TREE: &str = "wait_index";
const RESPONSE_TREE: &str = "notify_responses";
const READY_TREE: &str = "ready_callbacks";
const ARMED_KEY_TREE: &str = "armed_keys";

/// A registered callback and what it still waits for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitInstance {
    pub id: String,
    pub callback: CallbackSpec,
    pub correlation_ids: Vec<String>,
    pub waiting_on: Vec<String>,
    /// Failed delivery attempts so far
    pub attempts: u32,
    /// Not delivered again before this instant (unix millis)
    pub not_before_ms: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyResponse {
    pub correlation_id: String,
    pub payload: Vec<u8>,
    pub notified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub delivered: usize,
    pub retried: usize,
    pub dropped: usize,
    /// Ready but still backing off from an earlier failure
    pub deferred: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub scanned: usize,
    pub requeued: usize,
    /// Responses that had been stored but not yet applied to a waiter
    pub repaired: usize,
}

pub struct WaitNotifyEngine {
    instances: Tree,
    index: Tree,
    responses: Tree,
    ready: Tree,
    armed_keys: Tree,
    wake: Arc<Notify>,
    max_delivery_attempts: u32,
    retry_strategy: RetryStrategy,
}

fn index_key(correlation_id: &str, instance_id: &str) -> Vec<u8> {
    format!("{}\0{}", correlation_id, instance_id).into_bytes()
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl WaitNotifyEngine {
    pub fn new(db: &Db, max_delivery_attempts: u32, retry_strategy: RetryStrategy) -> Result<Self> {
        Ok(Self {
            instances: db.open_tree(INSTANCE_TREE)?,
            index: db.open_tree(INDEX_TREE)?,
            responses: db.open_tree(RESPONSE_TREE)?,
            ready: db.open_tree(READY_TREE)?,
            armed_keys: db.open_tree(ARMED_KEY_TREE)?,
            wake: Arc::new(Notify::new()),
            max_delivery_attempts: max_delivery_attempts.max(1),
            retry_strategy,
        })
    }

    /// Arm `callback` to fire once every correlation id has been notified.
    ///
    /// Responses recorded before arming count; if all of them are already
    /// present the callback is ready immediately.
    pub async fn arm(&self, callback: CallbackSpec, correlation_ids: &[String]) -> Result<String> {
        self.register(cuid2::create_id(), callback, correlation_ids)
    }

    /// Like `arm`, but at most once per `key` over the life of the database.
    ///
    /// Arming an already used key returns the instance id it was first
    /// armed with, even if that callback has since been delivered.
    pub async fn arm_once(
        &self,
        key: &str,
        callback: CallbackSpec,
        correlation_ids: &[String],
    ) -> Result<String> {
        if let Some(existing) = self.armed_keys.get(key)? {
            let id = String::from_utf8_lossy(&existing).into_owned();
            debug!(key = %key, instance = %id, "Callback already armed");
            return Ok(id);
        }

        let id = cuid2::create_id();
        let prepared = self.prepare(&id, callback, correlation_ids)?;
        match self
            .armed_keys
            .compare_and_swap(key, None as Option<&[u8]>, Some(id.as_bytes()))?
        {
            Ok(()) => match self.commit(prepared.clone()) {
                Ok(()) => Ok(id),
                Err(e) => {
                    // release the key so a retried arm is not answered with
                    // an instance that was never written
                    if let Err(cleanup) = self.delete_instance(&prepared) {
                        warn!(key = %key, error = %cleanup, "Failed to remove partly armed callback");
                    }
                    if let Err(cleanup) = self.armed_keys.compare_and_swap(
                        key,
                        Some(id.as_bytes()),
                        None as Option<&[u8]>,
                    ) {
                        warn!(key = %key, error = %cleanup, "Failed to release armed key");
                    }
                    Err(e)
                }
            },
            Err(conflict) => {
                let winner = conflict
                    .current
                    .map(|v| String::from_utf8_lossy(&v).into_owned())
                    .unwrap_or_default();
                debug!(key = %key, instance = %winner, "Lost race arming callback");
                Ok(winner)
            }
        }
    }

    fn register(
        &self,
        id: String,
        callback: CallbackSpec,
        correlation_ids: &[String],
    ) -> Result<String> {
        let prepared = self.prepare(&id, callback, correlation_ids)?;
        self.commit(prepared)?;
        Ok(id)
    }

    fn prepare(
        &self,
        id: &str,
        callback: CallbackSpec,
        correlation_ids: &[String],
    ) -> Result<WaitInstance> {
        if correlation_ids.is_empty() {
            return Err(SchedulerError::Validation(
                "a callback needs at least one correlation id".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        let ids: Vec<String> = correlation_ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect();

        Ok(WaitInstance {
            id: id.to_string(),
            callback,
            correlation_ids: ids.clone(),
            waiting_on: ids,
            attempts: 0,
            not_before_ms: 0,
            created_at: Utc::now(),
        })
    }

    fn commit(&self, instance: WaitInstance) -> Result<()> {
        self.instances
            .insert(instance.id.as_str(), codec::encode(&instance)?)?;
        for correlation_id in &instance.correlation_ids {
            self.index
                .insert(index_key(correlation_id, &instance.id), &[] as &[u8])?;
        }
        debug!(
            instance = %instance.id,
            callback = instance.callback.name(),
            waiting_on = instance.correlation_ids.len(),
            "Armed callback"
        );

        // responses that arrived before the index entries were written
        for correlation_id in &instance.correlation_ids {
            if self.responses.contains_key(correlation_id)?
                && self.remove_waiting(&instance.id, correlation_id)?
            {
                self.mark_ready(&instance.id)?;
            }
        }
        Ok(())
    }

    /// Record a completion for `correlation_id`.
    ///
    /// Returns the number of callbacks that became ready. Notifying the same
    /// id twice keeps the first payload.
    pub async fn notify(&self, correlation_id: &str, payload: Vec<u8>) -> Result<usize> {
        let response = NotifyResponse {
            correlation_id: correlation_id.to_string(),
            payload,
            notified_at: Utc::now(),
        };
        let encoded = codec::encode(&response)?;
        if self
            .responses
            .compare_and_swap(correlation_id, None as Option<&[u8]>, Some(encoded))?
            .is_err()
        {
            debug!(correlation_id = %correlation_id, "Duplicate notify, keeping first response");
        }

        let mut readied = 0;
        let prefix = format!("{}\0", correlation_id);
        for entry in self.index.scan_prefix(prefix.as_bytes()) {
            let (key, _) = entry?;
            let instance_id = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            if self.remove_waiting(&instance_id, correlation_id)? {
                self.mark_ready(&instance_id)?;
                readied += 1;
            }
        }

        debug!(correlation_id = %correlation_id, readied, "Notified");
        Ok(readied)
    }

    /// Drop `correlation_id` from the wait set of an instance.
    ///
    /// Returns true only for the call that empties the wait set.
    fn remove_waiting(&self, instance_id: &str, correlation_id: &str) -> Result<bool> {
        loop {
            let current = match self.instances.get(instance_id)? {
                Some(bytes) => bytes,
                None => return Ok(false),
            };
            let mut instance: WaitInstance = codec::decode(&current)?;
            if !instance.waiting_on.iter().any(|id| id == correlation_id) {
                return Ok(false);
            }
            instance.waiting_on.retain(|id| id != correlation_id);
            let emptied = instance.waiting_on.is_empty();
            let encoded = codec::encode(&instance)?;
            if self
                .instances
                .compare_and_swap(instance_id, Some(current), Some(encoded))?
                .is_ok()
            {
                return Ok(emptied);
            }
        }
    }

    fn mark_ready(&self, instance_id: &str) -> Result<()> {
        self.ready.insert(instance_id, &[] as &[u8])?;
        self.wake.notify_one();
        Ok(())
    }

    fn delete_instance(&self, instance: &WaitInstance) -> Result<()> {
        for correlation_id in &instance.correlation_ids {
            self.index.remove(index_key(correlation_id, &instance.id))?;
        }
        self.instances.remove(instance.id.as_str())?;
        Ok(())
    }

    fn gather_responses(&self, instance: &WaitInstance) -> Result<ResponseMap> {
        let mut responses = ResponseMap::new();
        for correlation_id in &instance.correlation_ids {
            if let Some(bytes) = self.responses.get(correlation_id)? {
                let response: NotifyResponse = codec::decode(&bytes)?;
                responses.insert(response.correlation_id, response.payload);
            }
        }
        Ok(responses)
    }

    /// Dispatch every ready callback once
    pub async fn deliver_ready(&self, dispatcher: &dyn CallbackDispatcher) -> Result<DeliveryStats> {
        let mut stats = DeliveryStats::default();
        let ready_ids: Vec<String> = self
            .ready
            .iter()
            .keys()
            .map(|key| key.map(|k| String::from_utf8_lossy(&k).into_owned()))
            .collect::<std::result::Result<_, _>>()?;

        for instance_id in ready_ids {
            let mut instance: WaitInstance = match self.instances.get(&instance_id)? {
                Some(bytes) => codec::decode(&bytes)?,
                None => {
                    self.ready.remove(instance_id.as_str())?;
                    continue;
                }
            };
            if instance.not_before_ms > now_ms() {
                stats.deferred += 1;
                continue;
            }
            // claim; someone else may have taken it first
            if self.ready.remove(instance_id.as_str())?.is_none() {
                continue;
            }

            let responses = self.gather_responses(&instance)?;
            match dispatcher.dispatch(&instance.callback, responses).await {
                Ok(()) => {
                    self.delete_instance(&instance)?;
                    stats.delivered += 1;
                    debug!(instance = %instance.id, callback = instance.callback.name(), "Callback delivered");
                }
                Err(e) if e.is_retryable() && instance.attempts + 1 < self.max_delivery_attempts => {
                    instance.attempts += 1;
                    let delay = self.retry_strategy.delay_for(instance.attempts);
                    instance.not_before_ms = now_ms() + delay.as_millis() as i64;
                    self.instances
                        .insert(instance.id.as_str(), codec::encode(&instance)?)?;
                    self.ready.insert(instance.id.as_str(), &[] as &[u8])?;
                    stats.retried += 1;
                    warn!(
                        instance = %instance.id,
                        callback = instance.callback.name(),
                        attempt = instance.attempts,
                        error = %e,
                        "Callback failed, will retry"
                    );
                }
                Err(e) => {
                    self.delete_instance(&instance)?;
                    stats.dropped += 1;
                    error!(
                        instance = %instance.id,
                        callback = instance.callback.name(),
                        attempts = instance.attempts + 1,
                        category = e.category(),
                        error = %e,
                        "Dropping callback"
                    );
                    dispatcher.on_dropped(&instance.callback, &e).await;
                }
            }
        }
        Ok(stats)
    }

    /// Re-queue callbacks whose delivery was interrupted by a crash
    pub async fn recover(&self) -> Result<RecoveryStats> {
        let mut stats = RecoveryStats::default();
        for entry in self.instances.iter() {
            let (_, bytes) = entry?;
            let instance: WaitInstance = codec::decode(&bytes)?;
            stats.scanned += 1;

            let mut emptied = instance.waiting_on.is_empty();
            for correlation_id in &instance.waiting_on {
                if self.responses.contains_key(correlation_id)? {
                    stats.repaired += 1;
                    if self.remove_waiting(&instance.id, correlation_id)? {
                        emptied = true;
                    }
                }
            }

            if emptied && !self.ready.contains_key(instance.id.as_str())? {
                self.mark_ready(&instance.id)?;
                stats.requeued += 1;
            }
        }
        info!(
            scanned = stats.scanned,
            requeued = stats.requeued,
            repaired = stats.repaired,
            "Wait engine recovery completed"
        );
        Ok(stats)
    }

    /// Deliver ready callbacks until `shutdown` flips to true
    pub async fn run(
        self: Arc<Self>,
        dispatcher: Arc<dyn CallbackDispatcher>,
        poll_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Callback delivery worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.deliver_ready(dispatcher.as_ref()).await {
                error!(error = %e, "Callback delivery pass failed");
            }
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Callback delivery worker stopped");
    }

    pub fn instance(&self, instance_id: &str) -> Result<Option<WaitInstance>> {
        match self.instances.get(instance_id)? {
            Some(bytes) => Ok(Some(codec::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Instances armed on `correlation_id` that have not been delivered yet
    pub fn instances_on(&self, correlation_id: &str) -> Result<Vec<WaitInstance>> {
        let prefix = format!("{}\0", correlation_id);
        let mut found = Vec::new();
        for entry in self.index.scan_prefix(prefix.as_bytes()) {
            let (key, _) = entry?;
            let instance_id = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            if let Some(instance) = self.instance(&instance_id)? {
                found.push(instance);
            }
        }
        Ok(found)
    }

    pub fn is_ready(&self, instance_id: &str) -> Result<bool> {
        Ok(self.ready.contains_key(instance_id)?)
    }

    pub fn response(&self, correlation_id: &str) -> Result<Option<Vec<u8>>> {
        match self.responses.get(correlation_id)? {
            Some(bytes) => Ok(Some(codec::decode::<NotifyResponse>(&bytes)?.payload)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SchedulerState;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(CallbackSpec, ResponseMap)>>,
        fail_with: Mutex<Option<fn() -> SchedulerError>>,
        dropped: Mutex<Vec<(CallbackSpec, &'static str)>>,
    }

    #[async_trait]
    impl CallbackDispatcher for Recorder {
        async fn dispatch(&self, callback: &CallbackSpec, responses: ResponseMap) -> Result<()> {
            self.calls.lock().unwrap().push((callback.clone(), responses));
            match *self.fail_with.lock().unwrap() {
                Some(make) => Err(make()),
                None => Ok(()),
            }
        }

        async fn on_dropped(&self, callback: &CallbackSpec, error: &SchedulerError) {
            self.dropped
                .lock()
                .unwrap()
                .push((callback.clone(), error.category()));
        }
    }

    fn publish_failed() -> SchedulerError {
        SchedulerError::publish_failure("t", "closed")
    }

    fn cursor_missing() -> SchedulerError {
        SchedulerError::missing_cursor("p")
    }

    fn engine(max_attempts: u32) -> WaitNotifyEngine {
        let db = sled::Config::new().temporary(true).open().unwrap();
        WaitNotifyEngine::new(&db, max_attempts, RetryStrategy::Immediate).unwrap()
    }

    fn callback(parent: &str) -> CallbackSpec {
        CallbackSpec::MaxConcurrentChild(SchedulerState::new(parent, 1))
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test]
    async fn test_fires_after_last_notify() {
        let engine = engine(3);
        let recorder = Recorder::default();
        let id = engine.arm(callback("p"), &ids(&["a", "b", "a"])).await.unwrap();
        assert_eq!(engine.instance(&id).unwrap().unwrap().waiting_on, ids(&["a", "b"]));

        assert_eq!(engine.notify("a", b"1".to_vec()).await.unwrap(), 0);
        assert_eq!(engine.deliver_ready(&recorder).await.unwrap().delivered, 0);

        assert_eq!(engine.notify("b", b"2".to_vec()).await.unwrap(), 1);
        let stats = engine.deliver_ready(&recorder).await.unwrap();
        assert_eq!(stats.delivered, 1);

        let calls = recorder.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1.get("a"), Some(&b"1".to_vec()));
        assert_eq!(calls[0].1.get("b"), Some(&b"2".to_vec()));
        assert!(engine.instance(&id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_existing_response_fires_immediately() {
        let engine = engine(3);
        engine.notify("done", b"ok".to_vec()).await.unwrap();

        let id = engine.arm(callback("p"), &ids(&["done"])).await.unwrap();
        assert!(engine.is_ready(&id).unwrap());
    }

    #[tokio::test]
    async fn test_empty_correlation_ids_rejected() {
        let engine = engine(3);
        let err = engine.arm(callback("p"), &[]).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));
    }

    #[tokio::test]
    async fn test_duplicate_notify_keeps_first_payload() {
        let engine = engine(3);
        engine.notify("c", b"first".to_vec()).await.unwrap();
        engine.notify("c", b"second".to_vec()).await.unwrap();
        assert_eq!(engine.response("c").unwrap(), Some(b"first".to_vec()));
    }

    #[tokio::test]
    async fn test_arm_once_is_idempotent() {
        let engine = engine(3);
        let recorder = Recorder::default();
        engine.notify("x", vec![]).await.unwrap();

        let first = engine.arm_once("k", callback("p"), &ids(&["x"])).await.unwrap();
        engine.deliver_ready(&recorder).await.unwrap();
        let second = engine.arm_once("k", callback("p"), &ids(&["x"])).await.unwrap();
        engine.deliver_ready(&recorder).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(recorder.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retryable_failure_retries_then_drops() {
        let engine = engine(2);
        let recorder = Recorder::default();
        let make: fn() -> SchedulerError = publish_failed;
        *recorder.fail_with.lock().unwrap() = Some(make);

        engine.notify("a", vec![]).await.unwrap();
        let id = engine.arm(callback("p"), &ids(&["a"])).await.unwrap();

        let first = engine.deliver_ready(&recorder).await.unwrap();
        assert_eq!(first.retried, 1);
        assert_eq!(engine.instance(&id).unwrap().unwrap().attempts, 1);
        assert!(recorder.dropped.lock().unwrap().is_empty());

        let second = engine.deliver_ready(&recorder).await.unwrap();
        assert_eq!(second.dropped, 1);
        assert!(engine.instance(&id).unwrap().is_none());
        assert_eq!(recorder.calls.lock().unwrap().len(), 2);
        assert_eq!(
            *recorder.dropped.lock().unwrap(),
            vec![(callback("p"), "publish_failure")]
        );
    }

    #[tokio::test]
    async fn test_non_retryable_failure_drops() {
        let engine = engine(5);
        let recorder = Recorder::default();
        let make: fn() -> SchedulerError = cursor_missing;
        *recorder.fail_with.lock().unwrap() = Some(make);

        engine.notify("a", vec![]).await.unwrap();
        engine.arm(callback("p"), &ids(&["a"])).await.unwrap();

        let stats = engine.deliver_ready(&recorder).await.unwrap();
        assert_eq!(stats.dropped, 1);
        assert_eq!(recorder.dropped.lock().unwrap().len(), 1);
        assert_eq!(engine.deliver_ready(&recorder).await.unwrap(), DeliveryStats::default());
    }

    #[tokio::test]
    async fn test_recover_requeues_claimed_instance() {
        let engine = engine(3);
        engine.notify("a", vec![]).await.unwrap();
        let id = engine.arm(callback("p"), &ids(&["a"])).await.unwrap();

        // simulate a crash after the claim but before dispatch
        engine.ready.remove(id.as_str()).unwrap();
        assert!(!engine.is_ready(&id).unwrap());

        let stats = engine.recover().await.unwrap();
        assert_eq!(stats.requeued, 1);
        assert!(engine.is_ready(&id).unwrap());
    }
}
