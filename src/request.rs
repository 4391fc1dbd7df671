//! Image request model.
//!
//! An [`ImageRequest`] describes one load: the resource URL, an optional
//! post-processor, a scheduling priority, and the memory cache policy for
//! this specific request. Requests are immutable values; the pipeline takes
//! a snapshot of the request per submitted task.
//!
//! Two requests are considered equivalent work when their [`LoadKey`]s match:
//! the URL plus the processor's cache identity. The pipeline uses the load
//! key both for deduplicating concurrent loads and as the memory cache key.

use crate::process::ImageProcessor;
use std::fmt;
use std::sync::Arc;

/// Priority level for image loads.
///
/// Priorities order fetch dispatch when the fetch queue is saturated. A
/// session shared by several tasks runs at the highest priority among its
/// subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// Speculative work, e.g. offscreen prefetching.
    VeryLow,
    /// Background loads.
    Low,
    /// Standard requests.
    #[default]
    Normal,
    /// Loads for content entering the viewport.
    High,
    /// Loads the user is actively waiting on.
    VeryHigh,
}

/// A request for a remote image.
///
/// Construction is builder-style:
///
/// ```ignore
/// let request = ImageRequest::new("https://example.com/cat.jpg")
///     .with_priority(Priority::High)
///     .with_processor(Arc::new(Thumbnail::new(128)));
/// ```
#[derive(Clone)]
pub struct ImageRequest {
    url: Arc<str>,
    processor: Option<Arc<dyn ImageProcessor>>,
    priority: Priority,
    is_cache_read_allowed: bool,
    is_cache_write_allowed: bool,
}

impl ImageRequest {
    /// Creates a request for the given URL with default options: normal
    /// priority, no processor, memory cache reads and writes allowed.
    pub fn new(url: impl Into<Arc<str>>) -> Self {
        Self {
            url: url.into(),
            processor: None,
            priority: Priority::Normal,
            is_cache_read_allowed: true,
            is_cache_write_allowed: true,
        }
    }

    /// Attaches a processor applied to the decoded image.
    ///
    /// The processor's [`identifier`](ImageProcessor::identifier) becomes part
    /// of the load key: two requests with the same URL but different
    /// processors do not share work or cache entries.
    pub fn with_processor(mut self, processor: Arc<dyn ImageProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Sets the scheduling priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Disables the memory cache probe for this request.
    pub fn without_cache_read(mut self) -> Self {
        self.is_cache_read_allowed = false;
        self
    }

    /// Disables storing the result in the memory cache.
    pub fn without_cache_write(mut self) -> Self {
        self.is_cache_write_allowed = false;
        self
    }

    /// Returns the resource URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the attached processor, if any.
    pub fn processor(&self) -> Option<&Arc<dyn ImageProcessor>> {
        self.processor.as_ref()
    }

    /// Returns the current priority.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub(crate) fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    /// Returns true if this request may be served from the memory cache.
    pub fn is_cache_read_allowed(&self) -> bool {
        self.is_cache_read_allowed
    }

    /// Returns true if a successful result may be stored in the memory cache.
    pub fn is_cache_write_allowed(&self) -> bool {
        self.is_cache_write_allowed
    }

    /// Derives the deduplication key for this request.
    pub fn load_key(&self) -> LoadKey {
        LoadKey {
            url: Arc::clone(&self.url),
            processor_id: self
                .processor
                .as_ref()
                .map(|p| p.identifier().to_string()),
        }
    }

    /// Derives the memory cache key for this request.
    ///
    /// Structurally identical to the load key in the default configuration.
    pub fn cache_key(&self) -> LoadKey {
        self.load_key()
    }
}

impl fmt::Debug for ImageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageRequest")
            .field("url", &self.url)
            .field("processor", &self.processor.as_ref().map(|p| p.identifier()))
            .field("priority", &self.priority)
            .field("cache_read", &self.is_cache_read_allowed)
            .field("cache_write", &self.is_cache_write_allowed)
            .finish()
    }
}

/// Equivalence class used for deduplication and memory cache lookup.
///
/// Hashes on the resource URL plus the processor's cache identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoadKey {
    url: Arc<str>,
    processor_id: Option<String>,
}

impl LoadKey {
    /// Returns the URL component of the key.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the processor identity component of the key, if any.
    pub fn processor_id(&self) -> Option<&str> {
        self.processor_id.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageContainer;

    struct NamedProcessor(&'static str);

    impl ImageProcessor for NamedProcessor {
        fn identifier(&self) -> &str {
            self.0
        }

        fn process(&self, image: &ImageContainer) -> Option<ImageContainer> {
            Some(image.clone())
        }
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::VeryLow < Priority::Low);
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert!(Priority::High < Priority::VeryHigh);
    }

    #[test]
    fn test_priority_default() {
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_request_defaults() {
        let request = ImageRequest::new("https://example.com/a.png");
        assert_eq!(request.url(), "https://example.com/a.png");
        assert_eq!(request.priority(), Priority::Normal);
        assert!(request.is_cache_read_allowed());
        assert!(request.is_cache_write_allowed());
        assert!(request.processor().is_none());
    }

    #[test]
    fn test_request_cache_policy() {
        let request = ImageRequest::new("https://example.com/a.png")
            .without_cache_read()
            .without_cache_write();
        assert!(!request.is_cache_read_allowed());
        assert!(!request.is_cache_write_allowed());
    }

    #[test]
    fn test_load_key_same_url_matches() {
        let a = ImageRequest::new("https://example.com/a.png");
        let b = ImageRequest::new("https://example.com/a.png");
        assert_eq!(a.load_key(), b.load_key());
    }

    #[test]
    fn test_load_key_different_url_differs() {
        let a = ImageRequest::new("https://example.com/a.png");
        let b = ImageRequest::new("https://example.com/b.png");
        assert_ne!(a.load_key(), b.load_key());
    }

    #[test]
    fn test_load_key_includes_processor_identity() {
        let plain = ImageRequest::new("https://example.com/a.png");
        let thumb = ImageRequest::new("https://example.com/a.png")
            .with_processor(Arc::new(NamedProcessor("thumb-64")));
        let thumb_again = ImageRequest::new("https://example.com/a.png")
            .with_processor(Arc::new(NamedProcessor("thumb-64")));
        let large = ImageRequest::new("https://example.com/a.png")
            .with_processor(Arc::new(NamedProcessor("thumb-256")));

        assert_ne!(plain.load_key(), thumb.load_key());
        assert_eq!(thumb.load_key(), thumb_again.load_key());
        assert_ne!(thumb.load_key(), large.load_key());
    }

    #[test]
    fn test_cache_key_equals_load_key() {
        let request = ImageRequest::new("https://example.com/a.png")
            .with_processor(Arc::new(NamedProcessor("thumb-64")));
        assert_eq!(request.cache_key(), request.load_key());
    }

    #[test]
    fn test_priority_does_not_affect_load_key() {
        let a = ImageRequest::new("https://example.com/a.png").with_priority(Priority::VeryHigh);
        let b = ImageRequest::new("https://example.com/a.png").with_priority(Priority::Low);
        assert_eq!(a.load_key(), b.load_key());
    }
}
