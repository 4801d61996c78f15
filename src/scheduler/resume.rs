use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::{max_concurrent_key, SchedulerState};
use crate::collaborators::ExecutionStarter;
use crate::core::config::SchedulerConfig;
use crate::core::errors::{Result, SchedulerError};
use crate::lock::{child_cursor_lock_name, LockHandle, LockService};
use crate::storage::{CursorStore, ResponseMap};
use crate::waiter::{CallbackSpec, WaitNotifyEngine};

/// What a completion did to the parent's cursor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// The next child was started and a callback armed on it
    Started { child_node_id: String },
    /// Every child has already been started
    Exhausted,
    /// The parent was aborted
    Terminated,
    /// These responses were merged by an earlier delivery
    Duplicate,
}

/// Starts the next child of a parent each time one of its children finishes.
///
/// All reads and writes of a parent's cursor record happen under the lock
/// `child-cursor/{parent}`, so concurrent completions of the same parent
/// are serialized even across processes.
pub struct MaxConcurrentChildScheduler {
    cursors: Arc<dyn CursorStore>,
    locks: Arc<dyn LockService>,
    starter: Arc<dyn ExecutionStarter>,
    engine: Arc<WaitNotifyEngine>,
    lock_wait: Duration,
    lock_lease: Duration,
}

impl MaxConcurrentChildScheduler {
    pub fn new(
        cursors: Arc<dyn CursorStore>,
        locks: Arc<dyn LockService>,
        starter: Arc<dyn ExecutionStarter>,
        engine: Arc<WaitNotifyEngine>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            cursors,
            locks,
            starter,
            engine,
            lock_wait: config.lock_wait(),
            lock_lease: config.lock_lease(),
        }
    }

    /// Handle the completion of one child of `state.parent_node_id`
    #[instrument(skip(self, state, responses), fields(parent = %state.parent_node_id))]
    pub async fn on_child_completed(
        &self,
        state: &SchedulerState,
        responses: ResponseMap,
    ) -> Result<Advance> {
        let handle = self.lock(&state.parent_node_id).await?;
        let outcome = self.advance(state, responses).await;
        self.unlock(handle).await;
        outcome
    }

    async fn advance(&self, state: &SchedulerState, responses: ResponseMap) -> Result<Advance> {
        let parent = state.parent_node_id.as_str();
        let mut record = self
            .cursors
            .load(parent)
            .await?
            .ok_or_else(|| SchedulerError::missing_cursor(parent))?;

        if record.terminated {
            debug!("Parent aborted, not starting more children");
            return Ok(Advance::Terminated);
        }
        let child = match record.next_child() {
            Some(child) => child.to_string(),
            None => {
                debug!(cursor = record.cursor, "All children already started");
                return Ok(Advance::Exhausted);
            }
        };
        if record.has_seen_all(&responses) {
            info!(contributors = responses.len(), "Completion already processed, ignoring redelivery");
            return Ok(Advance::Duplicate);
        }

        self.starter
            .start(&child)
            .await
            .map_err(|e| SchedulerError::starter_failure(&child, e))?;

        // armed before the cursor moves: if the save fails, a redelivery
        // starts the same child again and finds this callback already armed
        self.engine
            .arm_once(
                &max_concurrent_key(parent, &child),
                CallbackSpec::MaxConcurrentChild(state.clone()),
                std::slice::from_ref(&child),
            )
            .await?;

        record.cursor += 1;
        record.merge_responses(&responses);
        record.touch();
        self.cursors.save(&record).await?;

        info!(
            child = %child,
            cursor = record.cursor,
            total = record.child_node_ids.len(),
            "Started next child"
        );
        Ok(Advance::Started {
            child_node_id: child,
        })
    }

    /// Stop starting children of `parent_node_id`.
    ///
    /// Returns false when the parent was already aborted.
    #[instrument(skip(self))]
    pub async fn abort(&self, parent_node_id: &str) -> Result<bool> {
        let handle = self.lock(parent_node_id).await?;
        let outcome = self.mark_terminated(parent_node_id).await;
        self.unlock(handle).await;
        outcome
    }

    async fn mark_terminated(&self, parent_node_id: &str) -> Result<bool> {
        let mut record = self
            .cursors
            .load(parent_node_id)
            .await?
            .ok_or_else(|| SchedulerError::missing_cursor(parent_node_id))?;
        if record.terminated {
            return Ok(false);
        }
        record.terminated = true;
        record.touch();
        self.cursors.save(&record).await?;
        info!(started = record.cursor, total = record.child_node_ids.len(), "Parent aborted");
        Ok(true)
    }

    async fn lock(&self, parent_node_id: &str) -> Result<LockHandle> {
        let name = child_cursor_lock_name(parent_node_id);
        self.locks.acquire(&name, self.lock_wait, self.lock_lease).await
    }

    async fn unlock(&self, handle: LockHandle) {
        let name = handle.name.clone();
        if let Err(e) = self.locks.release(handle).await {
            warn!(lock = %name, error = %e, "Failed to release lock");
        }
    }
}
