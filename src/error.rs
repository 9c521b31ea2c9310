//! Error types for the activation buffer

use thiserror::Error;

/// Errors raised while building, refilling or sampling an activation buffer.
#[derive(Debug, Error)]
pub enum BufferError {
    /// Missing or invalid configuration (e.g. feature width not inferable).
    #[error("Configuration error: {message}")]
    Config {
        /// What is wrong with the configuration
        message: String,
    },

    /// The text source ran dry before a full ingestion batch was read.
    #[error("End of data stream reached: requested {requested} texts, only {available} available")]
    Exhausted {
        /// Texts requested for the ingestion batch
        requested: usize,
        /// Texts the source could still produce
        available: usize,
    },

    /// The text stream was closed explicitly.
    #[error("Text stream is closed")]
    Closed,

    /// A tapped value was absent or not shaped like activations.
    #[error("Shape anomaly: {message}")]
    ShapeAnomaly {
        /// Description of the unexpected shape
        message: String,
    },

    /// Tokenizer failure.
    #[error("Tokenization error: {0}")]
    Tokenizer(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl BufferError {
    /// Create a Config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a ShapeAnomaly error.
    pub fn shape_anomaly(message: impl Into<String>) -> Self {
        Self::ShapeAnomaly {
            message: message.into(),
        }
    }

    /// Create an Exhausted error.
    pub fn exhausted(requested: usize, available: usize) -> Self {
        Self::Exhausted {
            requested,
            available,
        }
    }

    /// True when the error means no more text can be ingested.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. } | Self::Closed)
    }
}

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, BufferError>;
