//! Error types for the expert distribution recorder
//!
//! Lifecycle transitions never fail. Errors surface when building a routing
//! tensor, when recording a batch (device failures, missing layer context),
//! and when writing the dump artifact. The binary adds configuration and
//! server startup failures.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for recorder operations
pub type Result<T> = std::result::Result<T, DistributionError>;

/// Error type for all recorder operations
#[derive(Debug, Error)]
pub enum DistributionError {
    /// Artifact could not be created, written, or flushed
    #[error("Failed to write expert distribution artifact {path}: {source}")]
    Io {
        /// Artifact path being written
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Flat routing data does not match the declared `[num_tokens, k]` shape
    #[error("Data size {data_size} does not match shape {shape:?} (expected {expected})")]
    DataShapeMismatch {
        /// Number of elements supplied
        data_size: usize,
        /// Declared shape
        shape: Vec<usize>,
        /// Elements implied by the shape
        expected: usize,
    },

    /// Row-wise construction saw rows of different widths
    #[error("Row {row} has {actual} experts, expected {expected}")]
    RaggedRows {
        /// Offending row index
        row: usize,
        /// Width of the first row
        expected: usize,
        /// Width of the offending row
        actual: usize,
    },

    /// A batch arrived while recording but no layer context was ever set
    #[error(
        "record_new_token called before set_current_layer; \
         the forward pass must set the layer before emitting routing decisions"
    )]
    LayerNotSet,

    /// Device transfer or synchronization failed
    #[error("Device error: {reason}")]
    Device {
        /// Description from the device backend
        reason: String,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Control plane could not bind or serve
    #[error("Server error: {reason}")]
    Server {
        /// What failed
        reason: String,
    },
}
