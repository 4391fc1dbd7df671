//! Data loading interface.
//!
//! The pipeline never performs I/O itself. Callers supply a [`DataLoader`]
//! that streams raw bytes for a request; the pipeline feeds those bytes to
//! the decoder as they arrive. Retry and transport policy belong to the
//! loader, not to the pipeline.

use crate::request::ImageRequest;
use bytes::Bytes;
use std::sync::Arc;

/// Response metadata for an in-flight fetch.
///
/// Stable after the first chunk callback.
#[derive(Debug, Clone)]
pub struct UrlResponse {
    /// The resolved resource URL.
    pub url: Arc<str>,
    /// Total byte count when the transport knows it up front.
    ///
    /// Progressive decoding requires this: without a known length the
    /// pipeline never attempts a partial decode.
    pub expected_content_length: Option<u64>,
}

/// Opaque error produced by a data loader.
pub type DataLoadError = Arc<dyn std::error::Error + Send + Sync>;

/// Callback invoked for each arriving chunk of bytes.
pub type ChunkSink = Box<dyn FnMut(Bytes, &UrlResponse) + Send>;

/// Callback invoked exactly once when the fetch finishes.
pub type CompletionSink = Box<dyn FnOnce(Result<(), DataLoadError>) + Send>;

/// Streams raw image bytes for a request.
///
/// Implementations must accept concurrent `load` calls. `on_chunk` may be
/// called zero or more times with monotonically accumulating byte arrivals;
/// `on_complete` fires exactly once afterwards.
pub trait DataLoader: Send + Sync + 'static {
    /// Starts a fetch, returning a handle that can abort it.
    fn load(
        &self,
        request: &ImageRequest,
        on_chunk: ChunkSink,
        on_complete: CompletionSink,
    ) -> Box<dyn FetchHandle>;
}

/// Handle to an in-flight fetch.
pub trait FetchHandle: Send + Sync {
    /// Aborts the fetch. Idempotence is the implementation's concern; the
    /// pipeline calls this at most once per fetch.
    fn cancel(&self);
}
