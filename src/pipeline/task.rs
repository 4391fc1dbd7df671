//! Task handles returned to callers.

use crate::image::{ImageContainer, LoadResult};
use crate::metrics::TaskMetrics;
use crate::pipeline::orchestrator::PipelineMsg;
use crate::request::Priority;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Global counter for generating unique task IDs.
static TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a submitted task.
///
/// IDs are monotonically increasing and unique within a process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        Self(TASK_ID_COUNTER.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Returns the raw numeric value of this task ID.
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Progress callback: (completed bytes, total bytes when known).
pub type ProgressFn = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Progressive preview callback.
pub type PartialImageFn = Arc<dyn Fn(ImageContainer) + Send + Sync>;

/// Completion callback, invoked at most once.
pub type CompletionFn = Box<dyn FnOnce(LoadResult) + Send>;

/// Optional per-task event sinks.
///
/// All callbacks run on the pipeline's delivery context, in order; the
/// completion callback (passed separately to `load_image`) is always the
/// last callback a task receives.
#[derive(Clone, Default)]
pub struct TaskEvents {
    /// Invoked as download progress accumulates.
    pub on_progress: Option<ProgressFn>,
    /// Invoked for progressive previews, when progressive decoding is on.
    pub on_partial: Option<PartialImageFn>,
}

impl TaskEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a progress callback.
    pub fn with_progress(mut self, f: impl Fn(u64, Option<u64>) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(f));
        self
    }

    /// Attaches a progressive preview callback.
    pub fn with_partial(mut self, f: impl Fn(ImageContainer) + Send + Sync + 'static) -> Self {
        self.on_partial = Some(Arc::new(f));
        self
    }
}

pub(crate) type SharedTaskMetrics = Arc<Mutex<TaskMetrics>>;

/// Handle to one submitted load.
///
/// Dropping the handle does not cancel the load; call
/// [`cancel`](ImageTask::cancel) explicitly.
pub struct ImageTask {
    id: TaskId,
    tx: mpsc::UnboundedSender<PipelineMsg>,
    cancelled: Arc<AtomicBool>,
    metrics: SharedTaskMetrics,
}

impl ImageTask {
    pub(crate) fn new(
        id: TaskId,
        tx: mpsc::UnboundedSender<PipelineMsg>,
        cancelled: Arc<AtomicBool>,
        metrics: SharedTaskMetrics,
    ) -> Self {
        Self {
            id,
            tx,
            cancelled,
            metrics,
        }
    }

    /// Returns this task's unique identifier.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Cancels the task. Idempotent.
    ///
    /// After this returns the completion callback will not fire; at most one
    /// callback already dispatched to the delivery context may still run.
    /// If this task was the session's last subscriber the underlying fetch
    /// is aborted.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(PipelineMsg::Cancel { task: self.id });
        }
    }

    /// Returns true once `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Updates this task's priority; the session's fetch priority is
    /// recomputed from all of its subscribers.
    pub fn set_priority(&self, priority: Priority) {
        let _ = self.tx.send(PipelineMsg::SetPriority {
            task: self.id,
            priority,
        });
    }

    /// Returns a snapshot of this task's metrics record.
    pub fn metrics(&self) -> TaskMetrics {
        self.metrics.lock().unwrap().clone()
    }
}

impl fmt::Debug for ImageTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageTask")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
