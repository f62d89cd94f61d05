//! Error types for Matcha-Tune Core.

use thiserror::Error;

/// Result type alias for Matcha-Tune operations.
pub type Result<T> = std::result::Result<T, MatchaTuneError>;

/// Errors that can occur in Matcha-Tune operations.
#[derive(Error, Debug)]
pub enum MatchaTuneError {
    /// Backbone configuration could not be read or is invalid.
    #[error("config error: {0}")]
    ConfigError(String),

    /// Model construction or forward-pass error.
    #[error("model error: {0}")]
    ModelError(String),

    /// Checkpoint file could not be located or decoded.
    #[error("checkpoint error: {0}")]
    CheckpointError(String),

    /// AWP cycle was driven out of order.
    #[error("perturbation error: {0}")]
    PerturbationError(String),

    /// I/O error.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// Candle tensor error.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}
