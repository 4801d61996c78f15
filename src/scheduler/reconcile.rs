use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{publish_trigger, spawn_resume_key};
use crate::core::errors::{Result, SchedulerError};
use crate::pubsub::{EventBus, TriggerMode, TriggerNodeEvent};
use crate::storage::{CursorStore, ExecutableResponseStore, PendingChild};
use crate::waiter::{CallbackSpec, WaitNotifyEngine};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub scanned: usize,
    pub republished: usize,
    pub failed: usize,
}

/// Finds spawn relations whose trigger never reached the bus and publishes
/// them again. The runtime id is reused, so consumers see a redelivery.
pub struct ReconciliationSweep {
    cursors: Arc<dyn CursorStore>,
    responses: Arc<dyn ExecutableResponseStore>,
    bus: Arc<dyn EventBus>,
    engine: Arc<WaitNotifyEngine>,
    publisher: String,
}

impl ReconciliationSweep {
    pub fn new(
        cursors: Arc<dyn CursorStore>,
        responses: Arc<dyn ExecutableResponseStore>,
        bus: Arc<dyn EventBus>,
        engine: Arc<WaitNotifyEngine>,
        publisher: impl Into<String>,
    ) -> Self {
        Self {
            cursors,
            responses,
            bus,
            engine,
            publisher: publisher.into(),
        }
    }

    /// Republish relations that have been pending for longer than `older_than`
    pub async fn run_once(&self, older_than: Duration) -> Result<SweepStats> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|e| SchedulerError::Validation(format!("sweep age out of range: {}", e)))?;
        let pending = self.responses.pending_older_than(Utc::now() - age).await?;

        let mut stats = SweepStats {
            scanned: pending.len(),
            ..Default::default()
        };
        for child in pending {
            match self.republish(&child).await {
                Ok(()) => stats.republished += 1,
                Err(e) => {
                    stats.failed += 1;
                    warn!(
                        child = %child.relation.runtime_id,
                        error = %e,
                        "Republishing pending spawn failed"
                    );
                }
            }
        }

        if stats.scanned > 0 {
            info!(
                scanned = stats.scanned,
                republished = stats.republished,
                failed = stats.failed,
                "Reconciliation sweep finished"
            );
        }
        Ok(stats)
    }

    async fn republish(&self, child: &PendingChild) -> Result<()> {
        let parent_id = child.parent_context.current_runtime_id();
        let relation = &child.relation;

        // Children of a bounded fan-out that the cursor has not reached yet
        // are only created; the scheduler starts them in turn.
        let fan_out_position = self.cursors.load(parent_id).await?.and_then(|record| {
            record
                .child_node_ids
                .iter()
                .position(|id| *id == relation.runtime_id)
                .map(|index| index < record.cursor)
        });
        let mode = match fan_out_position {
            Some(false) => TriggerMode::Create,
            _ => TriggerMode::CreateAndStart,
        };

        let event = TriggerNodeEvent {
            parent_context: child.parent_context.clone(),
            template_id: relation.template_id.clone(),
            runtime_id: relation.runtime_id.clone(),
            kind: relation.kind,
            mode,
        };
        publish_trigger(self.bus.as_ref(), &self.publisher, &event).await?;
        self.responses
            .mark_published(parent_id, &relation.runtime_id)
            .await?;

        // a fan-out arms its resume callback over all children at once
        if fan_out_position.is_none() {
            self.engine
                .arm_once(
                    &spawn_resume_key(&relation.runtime_id),
                    CallbackSpec::EngineResume {
                        context: child.parent_context.clone(),
                    },
                    std::slice::from_ref(&relation.runtime_id),
                )
                .await?;
        }
        debug!(child = %relation.runtime_id, ?mode, "Republished pending spawn");
        Ok(())
    }

    /// Sweep every `interval` until `shutdown` flips to true
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        older_than: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Reconciliation loop started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.run_once(older_than).await {
                        error!(error = %e, "Reconciliation sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Reconciliation loop stopped");
    }
}
