// Infrastructure shared by the scheduler, the wait engine and the runtime

pub mod config;
pub mod errors;
pub mod logging;

pub use config::{RetryStrategy, SchedulerConfig, SchedulerConfigBuilder};
pub use errors::{Result, SchedulerError};
pub use logging::init_logging;
