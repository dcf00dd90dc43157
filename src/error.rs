//! Error types for the stitching pipeline.

use thiserror::Error;

/// Result type alias for stitching operations.
pub type Result<T> = std::result::Result<T, StitchError>;

/// What kind of failure the statistics engine hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatisticsFailure {
    /// A read or compute buffer operation exceeded its configured timeout.
    Timeout,
    /// Reading, reducing or writing the statistics failed.
    Compute,
}

/// Errors that can occur while finalizing a segmentation.
#[derive(Debug, Error)]
pub enum StitchError {
    /// A blob could not be fetched, stored or deleted.
    #[error("transfer error: {message}")]
    Transfer {
        /// Description of the transfer failure.
        message: String,
        /// Underlying object store error, if any.
        #[source]
        source: Option<object_store::Error>,
    },

    /// A state or request document could not be decoded.
    #[error("deserialization error: {message}")]
    Deserialization {
        /// Description of the decoding failure.
        message: String,
    },

    /// Invalid arguments, settings or callback names.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of what is misconfigured.
        message: String,
    },

    /// The finalization engine failed to assemble the tiles.
    #[error("finalization error: {message}")]
    Finalization {
        /// Description of the assembly failure.
        message: String,
    },

    /// The statistics engine failed.
    #[error("statistics error ({kind:?}): {message}")]
    Statistics {
        /// Timeout or compute failure.
        kind: StatisticsFailure,
        /// Description of the failure.
        message: String,
    },

    /// A raster could not be opened or updated.
    #[error("raster error: {message}")]
    Raster {
        /// Description of the raster failure.
        message: String,
    },

    /// Local filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StitchError {
    pub(crate) fn transfer(message: impl Into<String>, source: object_store::Error) -> Self {
        Self::Transfer {
            message: message.into(),
            source: Some(source),
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub(crate) fn deserialization(message: impl Into<String>) -> Self {
        Self::Deserialization {
            message: message.into(),
        }
    }

    pub(crate) fn finalization(message: impl Into<String>) -> Self {
        Self::Finalization {
            message: message.into(),
        }
    }

    pub(crate) fn stats(message: impl Into<String>) -> Self {
        Self::Statistics {
            kind: StatisticsFailure::Compute,
            message: message.into(),
        }
    }

    pub(crate) fn stats_timeout(message: impl Into<String>) -> Self {
        Self::Statistics {
            kind: StatisticsFailure::Timeout,
            message: message.into(),
        }
    }

    pub(crate) fn raster(message: impl Into<String>) -> Self {
        Self::Raster {
            message: message.into(),
        }
    }

    /// True if this is a statistics buffer timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Statistics {
                kind: StatisticsFailure::Timeout,
                ..
            }
        )
    }
}

impl From<gdal::errors::GdalError> for StitchError {
    fn from(err: gdal::errors::GdalError) -> Self {
        Self::raster(err.to_string())
    }
}
