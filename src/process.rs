//! Image processing interface.

use crate::image::ImageContainer;
use crate::request::ImageRequest;
use std::sync::Arc;

/// Transforms decoded images, e.g. resizing or rounding corners.
///
/// Processors run on the pipeline's bounded processing queue and must not
/// share mutable state between instances. The `identifier` is the
/// processor's cache identity: requests whose processors report the same
/// identifier share sessions and cache entries, so the identifier must
/// encode every parameter that changes the output.
pub trait ImageProcessor: Send + Sync + 'static {
    /// Stable identity for deduplication and caching.
    fn identifier(&self) -> &str;

    /// Produces the transformed image, or `None` on failure.
    ///
    /// A `None` from the final processing step fails the load with
    /// [`ProcessingFailed`](crate::error::LoadError::ProcessingFailed);
    /// a `None` for a progressive preview is silently dropped.
    fn process(&self, image: &ImageContainer) -> Option<ImageContainer>;
}

/// Inputs available when resolving the processor for an image.
pub struct ImageProcessingContext<'a> {
    /// The session's originating request.
    pub request: &'a ImageRequest,
    /// False for progressive previews, true for the final image.
    pub is_final: bool,
    /// Progressive scan index of the image being processed, if known.
    pub scan_number: Option<u32>,
}

/// Factory resolving the processor for a processing context.
///
/// The default resolution uses the request's own processor for both previews
/// and the final image.
pub type ProcessorFactory =
    Arc<dyn Fn(&ImageProcessingContext<'_>) -> Option<Arc<dyn ImageProcessor>> + Send + Sync>;
