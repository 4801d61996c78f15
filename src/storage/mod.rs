//! Persistent scheduler state
//!
//! Two records live here: the per-parent child cursor that drives bounded
//! fan-out, and the per-parent executable response state that tracks
//! dynamically spawned children. Both sit behind async traits so the
//! scheduler can run against any backing store; `SledStorage` is the
//! embedded implementation.

pub mod codec;
pub mod sled_storage;

pub use sled_storage::SledStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::context::ExecutionContext;
use crate::core::errors::Result;

/// Contributor id to opaque completion payload
pub type ResponseMap = BTreeMap<String, Vec<u8>>;

/// Progress of a parent node through its ordered list of children
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildCursorRecord {
    pub id: String,
    pub parent_node_id: String,
    /// Fixed at creation
    pub child_node_ids: Vec<String>,
    /// Index of the next child to start
    pub cursor: usize,
    pub combined_response: ResponseMap,
    pub max_concurrency: u32,
    pub terminated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChildCursorRecord {
    /// New record with `cursor` children already considered started.
    ///
    /// The cursor is clamped to the number of children.
    pub fn new(
        parent_node_id: impl Into<String>,
        child_node_ids: Vec<String>,
        cursor: usize,
        max_concurrency: u32,
    ) -> Self {
        let now = Utc::now();
        let cursor = cursor.min(child_node_ids.len());
        Self {
            id: cuid2::create_id(),
            parent_node_id: parent_node_id.into(),
            child_node_ids,
            cursor,
            combined_response: ResponseMap::new(),
            max_concurrency,
            terminated: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.child_node_ids.len()
    }

    pub fn next_child(&self) -> Option<&str> {
        self.child_node_ids.get(self.cursor).map(String::as_str)
    }

    /// Insert responses whose contributor id is not yet present.
    ///
    /// Returns the number of entries added.
    pub fn merge_responses(&mut self, responses: &ResponseMap) -> usize {
        let mut added = 0;
        for (contributor, payload) in responses {
            if !self.combined_response.contains_key(contributor) {
                self.combined_response
                    .insert(contributor.clone(), payload.clone());
                added += 1;
            }
        }
        added
    }

    /// True when every contributor in `responses` was already merged.
    /// An empty map is never considered seen.
    pub fn has_seen_all(&self, responses: &ResponseMap) -> bool {
        !responses.is_empty()
            && responses
                .keys()
                .all(|contributor| self.combined_response.contains_key(contributor))
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// How a dynamically spawned child relates to its parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChildKind {
    Child,
    ChildChain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationStatus {
    /// Recorded, trigger not yet confirmed on the bus
    Pending,
    Published,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildRelation {
    pub runtime_id: String,
    pub template_id: String,
    pub kind: ChildKind,
    pub status: RelationStatus,
    pub recorded_at: DateTime<Utc>,
}

impl ChildRelation {
    pub fn pending(
        runtime_id: impl Into<String>,
        template_id: impl Into<String>,
        kind: ChildKind,
    ) -> Self {
        Self {
            runtime_id: runtime_id.into(),
            template_id: template_id.into(),
            kind,
            status: RelationStatus::Pending,
            recorded_at: Utc::now(),
        }
    }
}

/// Spawned child relations of one parent node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutableResponseState {
    pub parent_context: ExecutionContext,
    pub relations: Vec<ChildRelation>,
}

impl ExecutableResponseState {
    pub fn relation(&self, runtime_id: &str) -> Option<&ChildRelation> {
        self.relations.iter().find(|r| r.runtime_id == runtime_id)
    }
}

/// A relation still waiting for its trigger event, with the parent it hangs off
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChild {
    pub parent_context: ExecutionContext,
    pub relation: ChildRelation,
}

/// Storage for child cursor records, keyed by parent node id
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Load the record of a parent
    async fn load(&self, parent_node_id: &str) -> Result<Option<ChildCursorRecord>>;

    /// Insert or replace a record
    async fn save(&self, record: &ChildCursorRecord) -> Result<()>;

    /// Insert a record only if the parent has none.
    ///
    /// Returns the stored record: the new one, or the one that already existed.
    async fn create(&self, record: &ChildCursorRecord) -> Result<ChildCursorRecord>;

    /// Remove the record of a parent
    async fn delete(&self, parent_node_id: &str) -> Result<bool>;
}

/// Storage for the spawned-child relations of parent nodes
#[async_trait]
pub trait ExecutableResponseStore: Send + Sync {
    /// Record a pending relation; recording an existing runtime id returns
    /// the stored relation untouched
    async fn record_pending_child(
        &self,
        parent_context: &ExecutionContext,
        relation: ChildRelation,
    ) -> Result<ChildRelation>;

    /// Flip a relation to `Published`
    async fn mark_published(&self, parent_runtime_id: &str, runtime_id: &str) -> Result<bool>;

    /// Drop a relation
    async fn remove_child(&self, parent_runtime_id: &str, runtime_id: &str) -> Result<bool>;

    /// All relations of a parent in recording order
    async fn children(&self, parent_runtime_id: &str) -> Result<Vec<ChildRelation>>;

    /// Pending relations recorded at or before `cutoff`
    async fn pending_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<PendingChild>>;
}
