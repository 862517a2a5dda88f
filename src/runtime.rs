//! # Runtime abstraction
//!
//! Mirrors the teacher's `core::runtime::Runtime` trait: a minimal seam for
//! spawning background tasks and sleeping, so the dispatch worker pool and
//! per-queue backoff timers don't hard-code `tokio` throughout the crate.
//! The only implementation shipped is [`TokioRuntime`], grounded on
//! `adapters::runtime::tokio::Runtime`.

use std::future::Future;
use std::time::Duration;

/// Spawns futures and provides a sleep primitive for scheduled retries.
///
/// Express retry timers as scheduled callbacks through [`Runtime::sleep`],
/// never as a thread-blocking sleep (§4.5, §9's design notes).
#[async_trait::async_trait]
pub trait Runtime: Clone + Send + Sync + 'static {
    /// Spawn a future to run in the background, detached from the caller.
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Asynchronously sleep for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// `tokio`-backed [`Runtime`], grounded on `adapters::runtime::tokio::Runtime`.
#[derive(Debug, Clone, Default)]
pub struct TokioRuntime;

#[async_trait::async_trait]
impl Runtime for TokioRuntime {
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future);
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
