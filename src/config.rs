//! # Configuration
//!
//! Defaults mirror §6: 10 workers, 1 minute retry, 5 max failures. Grounded
//! on the teacher's builder-default conventions (e.g.
//! `RequestRetryConfiguration::linear()`'s fixed-delay-plus-max-retry
//! defaults), consolidated here into a single struct rather than scattered
//! per-builder defaults, since this crate has one entry point instead of
//! many per-feature builders.

use std::path::PathBuf;
use std::time::Duration;

/// Dispatcher-wide configuration (§6 "Configuration").
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Parallel dispatch workers. Default 10.
    pub worker_concurrency: usize,
    /// Per-queue backoff between a failed delivery and the next retry.
    /// Default 1 minute.
    pub retry_interval: Duration,
    /// Consecutive delivery failures a non-expiring set tolerates before
    /// eviction. Default 5.
    pub default_max_failures: u32,
    /// Root directory for durable queues. `None` disables durability: every
    /// expiring set then falls back to an in-memory per-location queue
    /// (still one queue per location, just not persisted).
    pub queue_root_path: Option<PathBuf>,
    /// This dispatcher's own identity: used for loop detection (`via`) and
    /// as the combined set's owner and publish endpoint.
    pub service_owner_uri: String,
    /// Opaque cookie attached to the combined-set broadcast, if any.
    pub service_access_cookie: Option<String>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 10,
            retry_interval: Duration::from_secs(60),
            default_max_failures: 5,
            queue_root_path: None,
            service_owner_uri: String::new(),
            service_access_cookie: None,
        }
    }
}
