//! Pipeline-level counters.
//!
//! Counters use relaxed atomics: they are monitoring data, not
//! synchronization.

use std::sync::atomic::{AtomicU64, Ordering};

/// Internal counter storage, shared between the pipeline handle and the
/// orchestrator.
#[derive(Debug, Default)]
pub(crate) struct StatsInner {
    total_loads: AtomicU64,
    coalesced_loads: AtomicU64,
    new_sessions: AtomicU64,
    memory_cache_hits: AtomicU64,
    completed_sessions: AtomicU64,
    cancelled_sessions: AtomicU64,
}

impl StatsInner {
    pub fn record_load(&self) {
        self.total_loads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_coalesced_load(&self) {
        self.coalesced_loads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_new_session(&self) {
        self.new_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_memory_cache_hit(&self) {
        self.memory_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_completed(&self) {
        self.completed_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_cancelled(&self) {
        self.cancelled_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            total_loads: self.total_loads.load(Ordering::Relaxed),
            coalesced_loads: self.coalesced_loads.load(Ordering::Relaxed),
            new_sessions: self.new_sessions.load(Ordering::Relaxed),
            memory_cache_hits: self.memory_cache_hits.load(Ordering::Relaxed),
            completed_sessions: self.completed_sessions.load(Ordering::Relaxed),
            cancelled_sessions: self.cancelled_sessions.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of pipeline counters.
#[derive(Debug, Default, Clone)]
pub struct PipelineStats {
    /// Loads submitted, including cache hits and pre-flight drops.
    pub total_loads: u64,
    /// Loads that joined an existing session.
    pub coalesced_loads: u64,
    /// Sessions created.
    pub new_sessions: u64,
    /// Loads served directly from the memory cache.
    pub memory_cache_hits: u64,
    /// Sessions that delivered a result (success or failure).
    pub completed_sessions: u64,
    /// Sessions torn down because their last subscriber cancelled.
    pub cancelled_sessions: u64,
}

impl PipelineStats {
    /// Fraction of loads that reused an existing session (0.0 to 1.0).
    pub fn coalescing_ratio(&self) -> f64 {
        if self.total_loads == 0 {
            0.0
        } else {
            self.coalesced_loads as f64 / self.total_loads as f64
        }
    }
}
