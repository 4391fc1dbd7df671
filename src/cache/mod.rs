//! Memory cache interface and the built-in implementation.
//!
//! The pipeline reads and writes the cache only when the request's cache
//! policy allows it, and only stores final successful images. Failures and
//! progressive previews are never stored.

mod memory;

pub use memory::{MemoryCacheStats, MemoryImageCache};

use crate::image::ImageContainer;
use crate::request::LoadKey;

/// Thread-safe store of decoded, processed images.
///
/// Implementations are shared across the pipeline's execution contexts and
/// must synchronize internally.
pub trait ImageCache: Send + Sync + 'static {
    /// Returns the cached image for a key, if present.
    fn get(&self, key: &LoadKey) -> Option<ImageContainer>;

    /// Stores an image under a key, replacing any existing entry.
    fn set(&self, key: LoadKey, image: ImageContainer);
}
