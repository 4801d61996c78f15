use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{LockHandle, LockService};
use crate::core::errors::{Result, SchedulerError};
use crate::storage::codec;

const LOCK_TREE: &str = "locks";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaseRecord {
    token: String,
    owner: String,
    expires_at_ms: i64,
}

impl LeaseRecord {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms <= now_ms
    }
}

/// Lease locks stored in a sled tree and taken with compare-and-swap.
///
/// Every process sharing the database shares the locks.
#[derive(Clone)]
pub struct SledLockService {
    leases: Tree,
    owner: String,
    retry_interval: Duration,
}

impl SledLockService {
    pub fn new(db: &Db, retry_interval: Duration) -> Result<Self> {
        Ok(Self {
            leases: db.open_tree(LOCK_TREE)?,
            owner: cuid2::create_id(),
            retry_interval,
        })
    }

    /// Single acquisition attempt; `Some(token)` on success
    fn try_acquire(&self, name: &str, lease: Duration) -> Result<Option<String>> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let current = self.leases.get(name)?;

        if let Some(bytes) = &current {
            let holder: LeaseRecord = codec::decode(bytes)?;
            if !holder.is_expired(now_ms) {
                return Ok(None);
            }
            debug!(lock = %name, previous_owner = %holder.owner, "Taking over expired lease");
        }

        let record = LeaseRecord {
            token: cuid2::create_id(),
            owner: self.owner.clone(),
            expires_at_ms: now_ms + lease.as_millis() as i64,
        };
        let encoded = codec::encode(&record)?;
        match self.leases.compare_and_swap(name, current, Some(encoded))? {
            Ok(()) => Ok(Some(record.token)),
            Err(_) => Ok(None),
        }
    }

    fn jittered_pause(&self) -> Duration {
        let base = self.retry_interval.as_millis() as u64;
        Duration::from_millis(base + fastrand::u64(0..=base.max(1)))
    }
}

#[async_trait]
impl LockService for SledLockService {
    async fn acquire(&self, name: &str, wait: Duration, lease: Duration) -> Result<LockHandle> {
        let started = Instant::now();
        loop {
            if let Some(token) = self.try_acquire(name, lease)? {
                debug!(lock = %name, "Lock acquired");
                return Ok(LockHandle {
                    name: name.to_string(),
                    token,
                    acquired_at: Instant::now(),
                    lease,
                });
            }

            let waited = started.elapsed();
            if waited >= wait {
                return Err(SchedulerError::lock_timeout(name, waited));
            }
            let pause = self.jittered_pause().min(wait - waited);
            tokio::time::sleep(pause).await;
        }
    }

    async fn release(&self, handle: LockHandle) -> Result<bool> {
        if handle.lease_expired() {
            warn!(
                lock = %handle.name,
                held_ms = handle.acquired_at.elapsed().as_millis() as u64,
                "Lease expired before release"
            );
        }

        let current = self.leases.get(&handle.name)?;
        let ours = match &current {
            Some(bytes) => codec::decode::<LeaseRecord>(bytes)?.token == handle.token,
            None => false,
        };
        if !ours {
            warn!(lock = %handle.name, "Lock no longer held by this handle");
            return Ok(false);
        }

        match self
            .leases
            .compare_and_swap(&handle.name, current, None as Option<Vec<u8>>)?
        {
            Ok(()) => {
                debug!(lock = %handle.name, "Lock released");
                Ok(true)
            }
            Err(_) => {
                warn!(lock = %handle.name, "Lock changed hands during release");
                Ok(false)
            }
        }
    }
}
