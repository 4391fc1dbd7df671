//! imgpipe - concurrent image loading pipeline.
//!
//! This library is the core of an image loading stack: a concurrent engine
//! that takes requests for remote images and produces decoded, processed,
//! in-memory image objects, with coordinated caching, deduplication, rate
//! limiting, progressive decoding, cancellation, and priority control.
//!
//! The pipeline performs no I/O and ships no codecs of its own beyond a
//! basic whole-image decoder; byte transport, decoding, and processing are
//! supplied through the [`loader`], [`decode`], and [`process`] interfaces.
//!
//! # High-Level API
//!
//! ```ignore
//! use imgpipe::{ImagePipeline, ImageRequest, PipelineConfig};
//! use std::sync::Arc;
//!
//! let mut config = PipelineConfig::new(Arc::new(my_data_loader));
//! config.image_cache = Some(Arc::new(imgpipe::cache::MemoryImageCache::default()));
//! let pipeline = ImagePipeline::new(config);
//!
//! let task = pipeline.load_image(ImageRequest::new("https://example.com/cat.jpg"), |result| {
//!     match result {
//!         Ok(response) => show(response.image),
//!         Err(error) => log_failure(error),
//!     }
//! });
//! ```

pub mod cache;
pub mod cancellation;
pub mod decode;
pub mod error;
pub mod image;
pub mod loader;
pub mod metrics;
pub mod pipeline;
pub mod process;
pub mod request;

pub use crate::image::{ImageContainer, ImageResponse, LoadResult};
pub use error::LoadError;
pub use pipeline::{ImagePipeline, ImageTask, PipelineConfig, TaskEvents};
pub use request::{ImageRequest, LoadKey, Priority};

/// Version of the imgpipe library.
///
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
