//! Global atomic counters for dispatch observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a run).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters: no allocations, no locking.
pub struct Metrics {
    events_dispatched: AtomicU64,
    jobs_dispatched: AtomicU64,
    jobs_executed: AtomicU64,
    job_retries: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    runs_superseded: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            events_dispatched: AtomicU64::new(0),
            jobs_dispatched: AtomicU64::new(0),
            jobs_executed: AtomicU64::new(0),
            job_retries: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            runs_superseded: AtomicU64::new(0),
        }
    }

    /// Count one evaluated event and the jobs it produced.
    pub fn record_dispatch(&self, jobs: u64) {
        self.events_dispatched.fetch_add(1, Ordering::Relaxed);
        self.jobs_dispatched.fetch_add(jobs, Ordering::Relaxed);
        tracing::trace!(metric = "events_dispatched", "counter incremented");
    }

    pub fn inc_jobs_executed(&self) {
        self.jobs_executed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "jobs_executed", "counter incremented");
    }

    pub fn inc_retries(&self) {
        self.job_retries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "job_retries", "counter incremented");
    }

    pub fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_misses(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_superseded(&self) {
        self.runs_superseded.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_superseded", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    ///
    /// Call this at natural boundaries (end of a run, CLI exit) rather than
    /// on every increment.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            events_dispatched = self.events_dispatched(),
            jobs_dispatched = self.jobs_dispatched(),
            jobs_executed = self.jobs_executed(),
            job_retries = self.job_retries(),
            cache_hits = self.cache_hits(),
            cache_misses = self.cache_misses(),
            runs_superseded = self.runs_superseded(),
        );
    }

    pub fn events_dispatched(&self) -> u64 {
        self.events_dispatched.load(Ordering::Relaxed)
    }

    pub fn jobs_dispatched(&self) -> u64 {
        self.jobs_dispatched.load(Ordering::Relaxed)
    }

    pub fn jobs_executed(&self) -> u64 {
        self.jobs_executed.load(Ordering::Relaxed)
    }

    pub fn job_retries(&self) -> u64 {
        self.job_retries.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub fn runs_superseded(&self) -> u64 {
        self.runs_superseded.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.events_dispatched,
            &self.jobs_dispatched,
            &self.jobs_executed,
            &self.job_retries,
            &self.cache_hits,
            &self.cache_misses,
            &self.runs_superseded,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
