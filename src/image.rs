//! In-memory image values produced by the pipeline.

use crate::error::LoadError;
use image::RgbaImage;
use std::fmt;
use std::sync::Arc;

/// A decoded image plus decoding metadata.
///
/// The bitmap is shared via `Arc` so fanning a result out to several
/// subscribers never copies pixels. Identity comparisons (`same_bitmap`)
/// distinguish, for example, a progressive preview from the final image.
#[derive(Clone)]
pub struct ImageContainer {
    /// The decoded pixels.
    pub bitmap: Arc<RgbaImage>,
    /// True for intermediate images produced by progressive decoding.
    pub is_preview: bool,
    /// Progressive scan index, when the decoder tracks one.
    pub scan_number: Option<u32>,
}

impl ImageContainer {
    /// Wraps a final decoded bitmap.
    pub fn new(bitmap: RgbaImage) -> Self {
        Self {
            bitmap: Arc::new(bitmap),
            is_preview: false,
            scan_number: None,
        }
    }

    /// Wraps an intermediate bitmap from a partial decode.
    pub fn preview(bitmap: RgbaImage, scan_number: Option<u32>) -> Self {
        Self {
            bitmap: Arc::new(bitmap),
            is_preview: true,
            scan_number,
        }
    }

    /// Returns true if both containers share the same underlying bitmap.
    pub fn same_bitmap(&self, other: &ImageContainer) -> bool {
        Arc::ptr_eq(&self.bitmap, &other.bitmap)
    }

    /// Approximate in-memory cost of the bitmap in bytes.
    pub fn cost(&self) -> usize {
        self.bitmap.as_raw().len()
    }
}

impl fmt::Debug for ImageContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageContainer")
            .field("width", &self.bitmap.width())
            .field("height", &self.bitmap.height())
            .field("is_preview", &self.is_preview)
            .field("scan_number", &self.scan_number)
            .finish()
    }
}

/// The value delivered to a task's completion callback on success.
#[derive(Debug, Clone)]
pub struct ImageResponse {
    /// The decoded, processed image.
    pub image: ImageContainer,
    /// True when the image was served from the memory cache without a fetch.
    pub is_from_memory_cache: bool,
}

/// Result type delivered to completion callbacks.
pub type LoadResult = Result<ImageResponse, LoadError>;
