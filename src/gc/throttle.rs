//! Coalescing GC trigger
//!
//! Requests set a single pending flag; a dedicated task waits out the
//! throttle window and then runs one cycle for every request that arrived
//! meanwhile. Requests made while a cycle runs schedule exactly one more.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Default)]
struct Signal {
    pending: AtomicBool,
    notify: Notify,
    requests: AtomicU64,
}

/// Fire-and-forget handle for requesting a collection cycle
#[derive(Clone, Default)]
pub struct GcTrigger {
    signal: Arc<Signal>,
}

impl GcTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a collection; never blocks
    pub fn trigger(&self) {
        self.signal.requests.fetch_add(1, Ordering::Relaxed);
        if !self.signal.pending.swap(true, Ordering::AcqRel) {
            self.signal.notify.notify_one();
        }
    }

    /// Whether a request is waiting for its window
    pub fn is_pending(&self) -> bool {
        self.signal.pending.load(Ordering::Acquire)
    }

    /// Number of requests made through this trigger
    pub fn request_count(&self) -> u64 {
        self.signal.requests.load(Ordering::Relaxed)
    }
}

/// Background task draining a `GcTrigger` at a bounded rate
pub struct Throttle {
    task: JoinHandle<()>,
}

impl Throttle {
    /// Spawn the task; `run` executes once per window at most, never concurrently
    pub fn spawn<F, Fut>(trigger: &GcTrigger, interval: Duration, run: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let signal = trigger.signal.clone();
        let task = tokio::spawn(async move {
            loop {
                signal.notify.notified().await;
                tokio::time::sleep(interval).await;

                // Requests from here on need a fresh cycle.
                signal.pending.store(false, Ordering::Release);
                debug!("Starting throttled GC cycle");
                run().await;
            }
        });

        Self { task }
    }

    /// Stop the task; a cycle in progress is cancelled at its next await
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for Throttle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
