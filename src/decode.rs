//! Image decoding interface and decoder selection.
//!
//! Decoders are selected per session from the first arriving bytes via a
//! [`DecoderRegistry`] (or a config override), then confined to the
//! pipeline's decoding context for the life of the session. A decoder may
//! carry state across calls, e.g. a progressive scan counter.

use crate::loader::UrlResponse;
use crate::request::ImageRequest;
use image::RgbaImage;
use std::sync::Arc;

/// Inputs available when selecting a decoder for a session.
pub struct ImageDecodingContext<'a> {
    /// The session's originating request.
    pub request: &'a ImageRequest,
    /// Response metadata from the data loader.
    pub response: &'a UrlResponse,
    /// The bytes received so far.
    pub data: &'a [u8],
}

/// Decodes accumulated bytes into bitmaps.
///
/// `decode` is called with the full byte buffer received so far. Calls with
/// `is_final = false` happen only in progressive mode and may return `None`
/// when no new image can be produced yet; the call with `is_final = true`
/// happens exactly once, after the fetch completes.
pub trait ImageDecoder: Send + 'static {
    fn decode(&mut self, data: &[u8], is_final: bool) -> Option<RgbaImage>;

    /// Index of the most recently decoded progressive scan, when the decoder
    /// tracks one.
    fn scan_number(&self) -> Option<u32> {
        None
    }
}

/// Factory producing a decoder for a decoding context, or `None` when the
/// data is not recognized.
pub type DecoderFactory =
    Arc<dyn Fn(&ImageDecodingContext<'_>) -> Option<Box<dyn ImageDecoder>> + Send + Sync>;

/// Ordered collection of decoder factories.
///
/// Selection asks each registered factory in turn, newest first, and takes
/// the first decoder offered. The default registry ends with
/// [`StaticImageDecoder`], which handles any format the `image` crate can
/// identify.
pub struct DecoderRegistry {
    factories: Vec<DecoderFactory>,
}

impl DecoderRegistry {
    /// Creates a registry containing only the built-in static decoder.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(|_ctx| {
            Some(Box::new(StaticImageDecoder::default()) as Box<dyn ImageDecoder>)
        }));
        registry
    }

    /// Creates a registry with no factories.
    pub fn empty() -> Self {
        Self {
            factories: Vec::new(),
        }
    }

    /// Registers a factory, giving it precedence over existing ones.
    pub fn register(&mut self, factory: DecoderFactory) {
        self.factories.insert(0, factory);
    }

    /// Selects a decoder for the given context.
    pub fn select(&self, context: &ImageDecodingContext<'_>) -> Option<Box<dyn ImageDecoder>> {
        self.factories.iter().find_map(|factory| factory(context))
    }
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Whole-image decoder backed by `image::load_from_memory`.
///
/// Produces no partial images; progressive sessions using this decoder
/// simply deliver the final image only.
#[derive(Default)]
pub struct StaticImageDecoder;

impl ImageDecoder for StaticImageDecoder {
    fn decode(&mut self, data: &[u8], is_final: bool) -> Option<RgbaImage> {
        if !is_final {
            return None;
        }
        image::load_from_memory(data).ok().map(|img| img.to_rgba8())
    }
}
