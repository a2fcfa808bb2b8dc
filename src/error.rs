//! Error types for nano-specdec.

use thiserror::Error;

/// Result type alias for nano-specdec operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nano-specdec.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed distribution input: empty, non-finite, or no mass left.
    #[error("numeric error: {0}")]
    Numeric(String),

    /// Backend forward pass failed or returned a malformed shape.
    #[error("inference error: {0}")]
    Inference(String),

    /// Command that requires an active session arrived without one.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Internal state machine invariant was violated.
    #[error("state invariant violated: {0}")]
    StateInvariant(String),

    /// Tokenization or chat templating error.
    #[error("tokenization error: {0}")]
    Tokenization(String),

    /// Model or tokenizer download failed.
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error aborts the running session.
    ///
    /// Protocol errors are no-ops; everything else ends the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Protocol(_))
    }
}
