//! Error types surfaced to load completions.

use std::sync::Arc;
use thiserror::Error;

/// Terminal failure of an image load.
///
/// Every error fans out identically to all tasks subscribed to the failed
/// session. Cancellation is not an error: a cancelled task's completion
/// callback simply never fires.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    /// The data loader reported a failure.
    #[error("data loading failed: {0}")]
    DataLoad(Arc<dyn std::error::Error + Send + Sync>),

    /// The final decode produced no image, the fetch delivered zero bytes,
    /// or no decoder could be instantiated for the response.
    #[error("image decoding failed")]
    DecodingFailed,

    /// The final processor returned no image.
    #[error("image processing failed")]
    ProcessingFailed,
}

impl LoadError {
    /// Wraps an arbitrary loader error.
    pub fn data_load(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::DataLoad(Arc::new(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = LoadError::data_load(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "connection timed out",
        ));
        assert_eq!(format!("{}", err), "data loading failed: connection timed out");

        assert_eq!(format!("{}", LoadError::DecodingFailed), "image decoding failed");
        assert_eq!(
            format!("{}", LoadError::ProcessingFailed),
            "image processing failed"
        );
    }

    #[test]
    fn test_clone_preserves_variant() {
        let err = LoadError::DecodingFailed;
        assert!(matches!(err.clone(), LoadError::DecodingFailed));
    }
}
