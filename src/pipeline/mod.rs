//! The image loading pipeline.
//!
//! [`ImagePipeline`] is the public entry point: it takes
//! [`ImageRequest`](crate::request::ImageRequest)s and produces decoded,
//! processed in-memory images, with deduplication, memory caching,
//! progressive decoding, cancellation, and priority control.
//!
//! # Architecture
//!
//! ```text
//! load_image ──► Orchestrator (serial) ──► Fetch queue ──► DataLoader
//!                    │    ▲                                    │ bytes
//!                    │    └────────────── messages ◄───────────┘
//!                    ├──► Decoding worker (serial, owns decoders)
//!                    ├──► Processing queue ──► ImageProcessor
//!                    └──► Delivery context ──► user callbacks
//! ```
//!
//! Concurrent requests for the same URL and processor share one underlying
//! fetch; the fetch is aborted only when the last interested task cancels.
//!
//! # Example
//!
//! ```ignore
//! use imgpipe::pipeline::{ImagePipeline, PipelineConfig};
//! use imgpipe::request::ImageRequest;
//!
//! let pipeline = ImagePipeline::new(PipelineConfig::new(my_loader));
//! let task = pipeline.load_image(ImageRequest::new(url), |result| {
//!     // runs on the delivery context
//! });
//! // Later, if the image is no longer needed:
//! task.cancel();
//! ```

mod decode_worker;
mod delivery;
pub(crate) mod orchestrator;
mod rate_limiter;
mod session;
mod stats;
mod task;
mod work_queue;

pub use rate_limiter::{DEFAULT_BUCKET_CAPACITY, DEFAULT_REFILL_RATE};
pub use stats::PipelineStats;
pub use task::{CompletionFn, ImageTask, PartialImageFn, ProgressFn, TaskEvents, TaskId};

use crate::cache::ImageCache;
use crate::decode::{DecoderFactory, DecoderRegistry};
use crate::image::LoadResult;
use crate::loader::DataLoader;
use crate::metrics::TaskMetrics;
use crate::process::ProcessorFactory;
use crate::request::ImageRequest;
use orchestrator::{LoadSubmission, PipelineMsg};
use stats::StatsInner;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Default maximum concurrent fetches.
pub const DEFAULT_FETCH_CONCURRENCY: usize = 6;

/// Default maximum concurrent processing jobs.
pub const DEFAULT_PROCESSING_CONCURRENCY: usize = 2;

/// Configuration for an [`ImagePipeline`].
#[derive(Clone)]
pub struct PipelineConfig {
    /// Streams raw image bytes. Required.
    pub data_loader: Arc<dyn DataLoader>,
    /// Memory cache consulted and filled per the request's cache policy.
    pub image_cache: Option<Arc<dyn ImageCache>>,
    /// Decoder selection when `make_decoder` is not set.
    pub decoder_registry: Arc<DecoderRegistry>,
    /// Overrides decoder selection entirely.
    pub make_decoder: Option<DecoderFactory>,
    /// Overrides processor resolution. The default uses the request's own
    /// processor for previews and the final image alike.
    pub make_processor: Option<ProcessorFactory>,
    /// Maximum concurrent fetches.
    pub fetch_concurrency: usize,
    /// Maximum concurrent processing jobs.
    pub processing_concurrency: usize,
    /// Share one fetch between concurrent requests with equal load keys.
    pub is_deduplication_enabled: bool,
    /// Gate fetch launches behind the token bucket.
    pub is_rate_limiter_enabled: bool,
    /// Attempt partial decodes while data is still downloading.
    pub is_progressive_decoding_enabled: bool,
    /// Rate limiter bucket capacity.
    pub rate_limiter_capacity: usize,
    /// Rate limiter refill rate, tokens per second.
    pub rate_limiter_refill_rate: f64,
}

impl PipelineConfig {
    /// Creates a configuration with defaults: deduplication and rate
    /// limiting on, progressive decoding off, no memory cache, the built-in
    /// decoder registry.
    pub fn new(data_loader: Arc<dyn DataLoader>) -> Self {
        Self {
            data_loader,
            image_cache: None,
            decoder_registry: Arc::new(DecoderRegistry::new()),
            make_decoder: None,
            make_processor: None,
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
            processing_concurrency: DEFAULT_PROCESSING_CONCURRENCY,
            is_deduplication_enabled: true,
            is_rate_limiter_enabled: true,
            is_progressive_decoding_enabled: false,
            rate_limiter_capacity: DEFAULT_BUCKET_CAPACITY,
            rate_limiter_refill_rate: DEFAULT_REFILL_RATE,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("has_image_cache", &self.image_cache.is_some())
            .field("fetch_concurrency", &self.fetch_concurrency)
            .field("processing_concurrency", &self.processing_concurrency)
            .field("is_deduplication_enabled", &self.is_deduplication_enabled)
            .field("is_rate_limiter_enabled", &self.is_rate_limiter_enabled)
            .field(
                "is_progressive_decoding_enabled",
                &self.is_progressive_decoding_enabled,
            )
            .finish()
    }
}

struct PipelineInner {
    tx: mpsc::UnboundedSender<PipelineMsg>,
    stats: Arc<StatsInner>,
    shutdown: CancellationToken,
}

impl Drop for PipelineInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Concurrent image loading engine.
///
/// Cloning is cheap; all clones drive the same pipeline. The pipeline's
/// workers shut down when the last clone is dropped; user callbacks already
/// dispatched may still run.
///
/// Must be created within a Tokio runtime.
#[derive(Clone)]
pub struct ImagePipeline {
    inner: Arc<PipelineInner>,
}

impl ImagePipeline {
    /// Creates a pipeline and spawns its workers.
    pub fn new(config: PipelineConfig) -> Self {
        let shutdown = CancellationToken::new();
        let stats = Arc::new(StatsInner::default());
        let tx = orchestrator::spawn(config, Arc::clone(&stats), shutdown.clone());
        Self {
            inner: Arc::new(PipelineInner {
                tx,
                stats,
                shutdown,
            }),
        }
    }

    /// Loads an image for the given request.
    ///
    /// Returns immediately with a task handle. The completion callback is
    /// invoked exactly once on the delivery context, unless the task is
    /// cancelled first, in which case it is never invoked.
    pub fn load_image(
        &self,
        request: ImageRequest,
        completion: impl FnOnce(LoadResult) + Send + 'static,
    ) -> ImageTask {
        self.load_image_with(request, TaskEvents::default(), completion)
    }

    /// Loads an image with progress and progressive-preview callbacks.
    pub fn load_image_with(
        &self,
        request: ImageRequest,
        events: TaskEvents,
        completion: impl FnOnce(LoadResult) + Send + 'static,
    ) -> ImageTask {
        let id = TaskId::next();
        let cancelled = Arc::new(AtomicBool::new(false));
        let metrics = Arc::new(Mutex::new(TaskMetrics::new()));
        let submission = LoadSubmission {
            task: id,
            request,
            events,
            completion: Box::new(completion),
            cancelled: Arc::clone(&cancelled),
            metrics: Arc::clone(&metrics),
        };
        let _ = self.inner.tx.send(PipelineMsg::Load(Box::new(submission)));
        ImageTask::new(id, self.inner.tx.clone(), cancelled, metrics)
    }

    /// Returns a snapshot of the pipeline counters.
    pub fn stats(&self) -> PipelineStats {
        self.inner.stats.snapshot()
    }
}

impl fmt::Debug for ImagePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImagePipeline").finish()
    }
}
