//! Shared loading state for one deduplication key.

use crate::cancellation::CancelTokenSource;
use crate::loader::UrlResponse;
use crate::metrics::SessionMetrics;
use crate::pipeline::task::{CompletionFn, SharedTaskMetrics, TaskEvents, TaskId};
use crate::pipeline::work_queue::ItemId;
use crate::request::{ImageRequest, LoadKey, Priority};
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Identifier of a session, unique across the pipeline's lifetime.
///
/// Cross-context messages carry the session ID and are re-resolved against
/// the session table on arrival; messages whose session is gone are dropped.
pub(crate) type SessionId = u64;

/// Key under which a session is stored in the session table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum SessionKey {
    /// Deduplicated: all requests with this load key share the session.
    Load(LoadKey),
    /// Deduplication disabled: one session per submission, but still owned
    /// by the session table.
    Unique(u64),
}

/// One subscribed task: its callbacks plus mutable priority.
pub(crate) struct Subscriber {
    pub priority: Priority,
    pub events: TaskEvents,
    pub completion: Option<CompletionFn>,
    pub metrics: SharedTaskMetrics,
    pub cancelled: Arc<AtomicBool>,
}

/// Shared work for one load key, servicing one or more subscriber tasks.
///
/// All fields are read and written only on the orchestrator's serial
/// context. The decoder and byte buffer for this session live in the
/// decoding worker, keyed by the session ID; the session tracks only
/// whether a decoder has been instantiated.
pub(crate) struct Session {
    pub id: SessionId,
    /// The originating request, used for decoder selection, processor
    /// resolution, and the cache write.
    pub request: ImageRequest,
    pub subscribers: HashMap<TaskId, Subscriber>,
    pub cancel_source: CancelTokenSource,
    /// The fetch work item, while one is queued or running. The fetch
    /// handle itself is owned by a hook on the cancellation token.
    pub fetch_item: Option<ItemId>,
    /// Response metadata, stable after the first chunk.
    pub response: Option<UrlResponse>,
    pub downloaded_byte_count: u64,
    pub expected_byte_count: Option<u64>,
    /// True once a decoder has been instantiated for this session.
    pub has_decoder: bool,
    /// In-flight partial-image processing item, if any. While set, newer
    /// partials are dropped (back-pressure).
    pub partial_op: Option<ItemId>,
    /// In-flight final processing item, if any.
    pub final_op: Option<ItemId>,
    pub completed: bool,
    pub metrics: SessionMetrics,
}

impl Session {
    pub fn new(id: SessionId, request: ImageRequest) -> Self {
        Self {
            id,
            request,
            subscribers: HashMap::new(),
            cancel_source: CancelTokenSource::new(),
            fetch_item: None,
            response: None,
            downloaded_byte_count: 0,
            expected_byte_count: None,
            has_decoder: false,
            partial_op: None,
            final_op: None,
            completed: false,
            metrics: SessionMetrics::new(),
        }
    }

    /// Derived priority: the maximum across current subscribers, or normal
    /// when the subscriber set is empty.
    pub fn priority(&self) -> Priority {
        self.subscribers
            .values()
            .map(|sub| sub.priority)
            .max()
            .unwrap_or(Priority::Normal)
    }
}
