//! Passive timing records for tasks and sessions.
//!
//! The pipeline stamps these records as work moves through the phases; it
//! never reads them back. Presentation is the caller's concern: a task's
//! record is reachable through [`ImageTask::metrics`](crate::pipeline::ImageTask::metrics),
//! and session timings are emitted as trace logs on completion.

use std::time::{Duration, Instant};

/// Per-task record, created at submission.
#[derive(Debug, Clone)]
pub struct TaskMetrics {
    /// When the task was submitted.
    pub time_created: Instant,
    /// When the task reached a terminal state (delivered or cancelled).
    pub time_completed: Option<Instant>,
    /// True when the result came straight from the memory cache.
    pub is_memory_cache_hit: bool,
    /// True when the task joined a session another task had already started.
    pub was_subscribed_to_existing_session: bool,
    /// True when the task was cancelled before delivery.
    pub was_cancelled: bool,
}

impl TaskMetrics {
    pub(crate) fn new() -> Self {
        Self {
            time_created: Instant::now(),
            time_completed: None,
            is_memory_cache_hit: false,
            was_subscribed_to_existing_session: false,
            was_cancelled: false,
        }
    }

    /// Wall time from submission to the terminal state, if reached.
    pub fn duration(&self) -> Option<Duration> {
        self.time_completed
            .map(|end| end.duration_since(self.time_created))
    }
}

/// Per-session record.
#[derive(Debug, Clone)]
pub struct SessionMetrics {
    /// When the session was created.
    pub time_created: Instant,
    /// When the fetch was submitted to the fetch queue.
    ///
    /// Stamped at submission rather than at actual dispatch; queue wait time
    /// is included in the apparent load duration.
    pub time_data_loading_started: Option<Instant>,
    /// When the data loader reported completion.
    pub time_data_loading_finished: Option<Instant>,
    /// When the final decode finished.
    pub time_decoding_finished: Option<Instant>,
    /// When the session delivered its result.
    pub time_completed: Option<Instant>,
    /// Total bytes received from the data loader.
    pub downloaded_byte_count: u64,
    /// True when the session was torn down because its last subscriber left.
    pub was_cancelled: bool,
}

impl SessionMetrics {
    pub(crate) fn new() -> Self {
        Self {
            time_created: Instant::now(),
            time_data_loading_started: None,
            time_data_loading_finished: None,
            time_decoding_finished: None,
            time_completed: None,
            downloaded_byte_count: 0,
            was_cancelled: false,
        }
    }

    /// Total session duration, if the session completed.
    pub fn duration(&self) -> Option<Duration> {
        self.time_completed
            .map(|end| end.duration_since(self.time_created))
    }
}
