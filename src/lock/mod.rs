//! Named, leased mutual exclusion
//!
//! Locks are scoped by name (the scheduler uses one per parent node) and
//! carry a lease so that a crashed holder cannot wedge the name forever.

pub mod sled_lock;

pub use sled_lock::SledLockService;

use async_trait::async_trait;
use std::time::{Duration, Instant};

use crate::core::errors::Result;

/// Proof of a held lock, returned by `acquire` and consumed by `release`
#[derive(Debug)]
pub struct LockHandle {
    pub name: String,
    pub token: String,
    pub acquired_at: Instant,
    pub lease: Duration,
}

impl LockHandle {
    pub fn lease_expired(&self) -> bool {
        self.acquired_at.elapsed() >= self.lease
    }
}

#[async_trait]
pub trait LockService: Send + Sync {
    /// Wait up to `wait` for the lock; holds it for at most `lease`.
    ///
    /// Fails with `LockTimeout` when the wait elapses.
    async fn acquire(&self, name: &str, wait: Duration, lease: Duration) -> Result<LockHandle>;

    /// Release a held lock.
    ///
    /// Returns `false` if the lease had already expired and the name was
    /// taken over or cleared by someone else.
    async fn release(&self, handle: LockHandle) -> Result<bool>;
}

/// Lock name guarding the cursor record of a parent
pub fn child_cursor_lock_name(parent_node_id: &str) -> String {
    format!("child-cursor/{}", parent_node_id)
}
