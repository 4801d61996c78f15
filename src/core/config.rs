use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::errors::{Result, SchedulerError};

/// Backoff applied between redeliveries of a failed callback or event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryStrategy {
    /// Exponential backoff with configurable parameters
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    },
    /// Linear backoff with fixed delay
    Linear { delay_ms: u64 },
    /// No delay between retries
    Immediate,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_ms: 500,
            max_delay_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

impl RetryStrategy {
    /// Delay before the given (1-based) retry attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            RetryStrategy::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                let exp = attempt.saturating_sub(1) as i32;
                let delay = (*initial_delay_ms as f64 * multiplier.powi(exp)).min(*max_delay_ms as f64);
                Duration::from_millis(delay as u64)
            }
            RetryStrategy::Linear { delay_ms } => Duration::from_millis(*delay_ms),
            RetryStrategy::Immediate => Duration::ZERO,
        }
    }
}

/// Scheduler configuration with all tuning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Directory of the sled database; `None` opens a temporary database
    pub storage_path: Option<PathBuf>,
    /// Name stamped on published events as the `publisher` metadata key
    pub publisher_name: String,

    // Locking
    /// How long to wait for the per-parent lock
    pub lock_wait_ms: u64,
    /// How long a lock is held before it expires on its own
    pub lock_lease_ms: u64,
    /// Pause between lock acquisition attempts (jitter is added on top)
    pub lock_retry_interval_ms: u64,

    // Delivery
    /// Attempts before a failing callback or event is dropped
    pub max_delivery_attempts: u32,
    /// Backoff between delivery attempts
    pub retry_strategy: RetryStrategy,
    /// Interval at which the delivery worker polls for ready callbacks
    pub notify_poll_interval_ms: u64,
    /// Capacity of each event bus topic
    pub bus_capacity: usize,

    // Fan-out
    /// Upper bound on children started at once (0 = unlimited)
    pub max_concurrency_limit: u32,

    // Reconciliation
    /// How often the pending-spawn sweep runs
    pub reconcile_interval_secs: u64,
    /// Age after which a pending spawn relation is republished
    pub reconcile_after_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            storage_path: None,
            publisher_name: "childflow".to_string(),
            lock_wait_ms: 30_000,
            lock_lease_ms: 30_000,
            lock_retry_interval_ms: 25,
            max_delivery_attempts: 5,
            retry_strategy: RetryStrategy::default(),
            notify_poll_interval_ms: 1_000,
            bus_capacity: 1_024,
            max_concurrency_limit: 256,
            reconcile_interval_secs: 60,
            reconcile_after_secs: 120,
        }
    }
}

impl SchedulerConfig {
    /// Create a new builder for SchedulerConfig
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder::new()
    }

    /// Configuration tuned for tests and local runs
    pub fn development() -> Self {
        Self {
            lock_wait_ms: 2_000,
            lock_lease_ms: 5_000,
            lock_retry_interval_ms: 5,
            retry_strategy: RetryStrategy::Immediate,
            notify_poll_interval_ms: 50,
            bus_capacity: 256,
            reconcile_interval_secs: 1,
            reconcile_after_secs: 1,
            ..Default::default()
        }
    }

    /// Parse a YAML document; missing keys fall back to defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: SchedulerConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.lock_wait_ms == 0 {
            return Err(SchedulerError::Configuration(
                "lock_wait_ms must be greater than 0".to_string(),
            ));
        }
        if self.lock_lease_ms == 0 {
            return Err(SchedulerError::Configuration(
                "lock_lease_ms must be greater than 0".to_string(),
            ));
        }
        if self.lock_retry_interval_ms > self.lock_wait_ms {
            return Err(SchedulerError::Configuration(
                "lock_retry_interval_ms cannot exceed lock_wait_ms".to_string(),
            ));
        }
        if self.max_delivery_attempts == 0 {
            return Err(SchedulerError::Configuration(
                "max_delivery_attempts must be greater than 0".to_string(),
            ));
        }
        if self.bus_capacity == 0 {
            return Err(SchedulerError::Configuration(
                "bus_capacity must be greater than 0".to_string(),
            ));
        }
        if self.notify_poll_interval_ms == 0 {
            return Err(SchedulerError::Configuration(
                "notify_poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        // the sweep loop sleeps for this long between passes
        if self.reconcile_interval_secs == 0 {
            return Err(SchedulerError::Configuration(
                "reconcile_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.publisher_name.trim().is_empty() {
            return Err(SchedulerError::Configuration(
                "publisher_name cannot be empty".to_string(),
            ));
        }
        if let RetryStrategy::Exponential {
            initial_delay_ms,
            max_delay_ms,
            multiplier,
        } = &self.retry_strategy
        {
            if *multiplier < 1.0 {
                return Err(SchedulerError::Configuration(
                    "retry multiplier must be >= 1.0".to_string(),
                ));
            }
            if initial_delay_ms > max_delay_ms {
                return Err(SchedulerError::Configuration(
                    "initial retry delay cannot exceed max retry delay".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }

    pub fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_interval_ms)
    }

    pub fn notify_poll_interval(&self) -> Duration {
        Duration::from_millis(self.notify_poll_interval_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn reconcile_after(&self) -> Duration {
        Duration::from_secs(self.reconcile_after_secs)
    }

    /// Concurrency actually applied to a fan-out of `children` children.
    ///
    /// A requested cap is honoured only when it is positive and below the
    /// configured limit.
    pub fn effective_concurrency(&self, children: usize, requested: u32) -> usize {
        let limit = match self.max_concurrency_limit {
            0 => children,
            limit => (limit as usize).min(children),
        };
        if requested > 0 && (requested as usize) < limit {
            requested as usize
        } else {
            limit
        }
    }
}

/// Builder for SchedulerConfig
pub struct SchedulerConfigBuilder {
    config: SchedulerConfig,
}

impl SchedulerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SchedulerConfig::default(),
        }
    }

    pub fn storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.storage_path = Some(path.into());
        self
    }

    pub fn publisher_name(mut self, name: impl Into<String>) -> Self {
        self.config.publisher_name = name.into();
        self
    }

    /// Set lock wait and lease timeouts
    pub fn lock_timeouts(mut self, wait: Duration, lease: Duration) -> Self {
        self.config.lock_wait_ms = wait.as_millis() as u64;
        self.config.lock_lease_ms = lease.as_millis() as u64;
        self
    }

    pub fn max_delivery_attempts(mut self, attempts: u32) -> Self {
        self.config.max_delivery_attempts = attempts;
        self
    }

    pub fn retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.config.retry_strategy = strategy;
        self
    }

    pub fn notify_poll_interval(mut self, interval: Duration) -> Self {
        self.config.notify_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn bus_capacity(mut self, capacity: usize) -> Self {
        self.config.bus_capacity = capacity;
        self
    }

    pub fn max_concurrency_limit(mut self, limit: u32) -> Self {
        self.config.max_concurrency_limit = limit;
        self
    }

    /// Set reconciliation cadence and staleness threshold
    pub fn reconciliation(mut self, interval: Duration, after: Duration) -> Self {
        self.config.reconcile_interval_secs = interval.as_secs();
        self.config.reconcile_after_secs = after.as_secs();
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<SchedulerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for SchedulerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
