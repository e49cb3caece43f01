//! Process-wide atomic counters.
//!
//! Incremented at the call site; [`Metrics::flush`] emits the current values
//! as a single `tracing::info!` event.

use std::sync::atomic::{AtomicU64, Ordering};

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    requests_submitted: AtomicU64,
    stages_committed: AtomicU64,
    issues_raised: AtomicU64,
    dispatch_retries: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            requests_submitted: AtomicU64::new(0),
            stages_committed: AtomicU64::new(0),
            issues_raised: AtomicU64::new(0),
            dispatch_retries: AtomicU64::new(0),
        }
    }

    pub fn inc_requests_submitted(&self) {
        self.requests_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_stages_committed(&self) {
        self.stages_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_issues_raised(&self) {
        self.issues_raised.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dispatch_retries(&self) {
        self.dispatch_retries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "dispatch_retries", "counter incremented");
    }

    /// Emit all counters as one event; call at natural boundaries.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            requests_submitted = self.requests_submitted(),
            stages_committed = self.stages_committed(),
            issues_raised = self.issues_raised(),
            dispatch_retries = self.dispatch_retries(),
        );
    }

    pub fn requests_submitted(&self) -> u64 {
        self.requests_submitted.load(Ordering::Relaxed)
    }

    pub fn stages_committed(&self) -> u64 {
        self.stages_committed.load(Ordering::Relaxed)
    }

    pub fn issues_raised(&self) -> u64 {
        self.issues_raised.load(Ordering::Relaxed)
    }

    pub fn dispatch_retries(&self) -> u64 {
        self.dispatch_retries.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (tests).
    pub fn reset(&self) {
        self.requests_submitted.store(0, Ordering::Relaxed);
        self.stages_committed.store(0, Ordering::Relaxed);
        self.issues_raised.store(0, Ordering::Relaxed);
        self.dispatch_retries.store(0, Ordering::Relaxed);
    }
}
