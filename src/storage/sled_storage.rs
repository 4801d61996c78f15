use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sled::{Db, Tree};
use tracing::{debug, warn};

use super::codec;
use super::{
    ChildCursorRecord, ChildRelation, CursorStore, ExecutableResponseState,
    ExecutableResponseStore, PendingChild, RelationStatus,
};
use crate::context::ExecutionContext;
use crate::core::errors::Result;

const CURSOR_TREE: &str = "child_cursors";
const RESPONSE_TREE: &str = "executable_responses";

/// Sled-backed cursor and executable response storage
#[derive(Clone)]
pub struct SledStorage {
    cursors: Tree,
    responses: Tree,
}

impl SledStorage {
    pub fn new(db: &Db) -> Result<Self> {
        Ok(Self {
            cursors: db.open_tree(CURSOR_TREE)?,
            responses: db.open_tree(RESPONSE_TREE)?,
        })
    }

    /// Read-modify-write of one parent's response state, retried on conflict
    fn update_response_state<F, R>(&self, parent_runtime_id: &str, mut apply: F) -> Result<R>
    where
        F: FnMut(Option<ExecutableResponseState>) -> (Option<ExecutableResponseState>, R),
    {
        loop {
            let current = self.responses.get(parent_runtime_id)?;
            let decoded = match &current {
                Some(bytes) => Some(codec::decode::<ExecutableResponseState>(bytes)?),
                None => None,
            };
            let (next, out) = apply(decoded);
            let next_bytes = match &next {
                Some(state) => Some(codec::encode(state)?),
                None => None,
            };
            match self
                .responses
                .compare_and_swap(parent_runtime_id, current, next_bytes)?
            {
                Ok(()) => return Ok(out),
                Err(_) => {
                    debug!(parent = %parent_runtime_id, "Response state changed concurrently, retrying");
                    continue;
                }
            }
        }
    }
}

#[async_trait]
impl CursorStore for SledStorage {
    async fn load(&self, parent_node_id: &str) -> Result<Option<ChildCursorRecord>> {
        match self.cursors.get(parent_node_id)? {
            Some(bytes) => Ok(Some(codec::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, record: &ChildCursorRecord) -> Result<()> {
        let bytes = codec::encode(record)?;
        self.cursors.insert(record.parent_node_id.as_str(), bytes)?;
        Ok(())
    }

    async fn create(&self, record: &ChildCursorRecord) -> Result<ChildCursorRecord> {
        let bytes = codec::encode(record)?;
        loop {
            match self.cursors.compare_and_swap(
                record.parent_node_id.as_str(),
                None as Option<&[u8]>,
                Some(bytes.clone()),
            )? {
                Ok(()) => return Ok(record.clone()),
                Err(conflict) => match conflict.current {
                    Some(existing) => {
                        debug!(parent = %record.parent_node_id, "Cursor record already exists");
                        return codec::decode(&existing);
                    }
                    // deleted in between
                    None => continue,
                },
            }
        }
    }

    async fn delete(&self, parent_node_id: &str) -> Result<bool> {
        Ok(self.cursors.remove(parent_node_id)?.is_some())
    }
}

#[async_trait]
impl ExecutableResponseStore for SledStorage {
    async fn record_pending_child(
        &self,
        parent_context: &ExecutionContext,
        relation: ChildRelation,
    ) -> Result<ChildRelation> {
        let parent_runtime_id = parent_context.current_runtime_id().to_string();
        self.update_response_state(&parent_runtime_id, |state| {
            let mut state = state.unwrap_or_else(|| ExecutableResponseState {
                parent_context: parent_context.clone(),
                relations: Vec::new(),
            });
            if let Some(existing) = state.relation(&relation.runtime_id) {
                let existing = existing.clone();
                return (Some(state), existing);
            }
            state.relations.push(relation.clone());
            (Some(state), relation.clone())
        })
    }

    async fn mark_published(&self, parent_runtime_id: &str, runtime_id: &str) -> Result<bool> {
        self.update_response_state(parent_runtime_id, |state| match state {
            Some(mut state) => {
                let mut changed = false;
                for relation in state.relations.iter_mut() {
                    if relation.runtime_id == runtime_id
                        && relation.status == RelationStatus::Pending
                    {
                        relation.status = RelationStatus::Published;
                        changed = true;
                    }
                }
                (Some(state), changed)
            }
            None => (None, false),
        })
    }

    async fn remove_child(&self, parent_runtime_id: &str, runtime_id: &str) -> Result<bool> {
        self.update_response_state(parent_runtime_id, |state| match state {
            Some(mut state) => {
                let before = state.relations.len();
                state.relations.retain(|r| r.runtime_id != runtime_id);
                let removed = state.relations.len() != before;
                (Some(state), removed)
            }
            None => (None, false),
        })
    }

    async fn children(&self, parent_runtime_id: &str) -> Result<Vec<ChildRelation>> {
        match self.responses.get(parent_runtime_id)? {
            Some(bytes) => {
                let state: ExecutableResponseState = codec::decode(&bytes)?;
                Ok(state.relations)
            }
            None => Ok(Vec::new()),
        }
    }

    async fn pending_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<PendingChild>> {
        let mut pending = Vec::new();
        for entry in self.responses.iter() {
            let (key, bytes) = entry?;
            let state: ExecutableResponseState = match codec::decode(&bytes) {
                Ok(state) => state,
                Err(e) => {
                    warn!(
                        parent = %String::from_utf8_lossy(&key),
                        error = %e,
                        "Skipping unreadable response state"
                    );
                    continue;
                }
            };
            for relation in &state.relations {
                if relation.status == RelationStatus::Pending && relation.recorded_at <= cutoff {
                    pending.push(PendingChild {
                        parent_context: state.parent_context.clone(),
                        relation: relation.clone(),
                    });
                }
            }
        }
        Ok(pending)
    }
}
