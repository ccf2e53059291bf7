//! Error types for var-rs.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
///
/// Every variant is deterministic: the same inputs reproduce the same error.
/// Only the manager retries, by reloading on CPU after a CUDA OOM.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Invalid model or codebook configuration. Fatal at construction.
    #[error("config: {0}")]
    Config(String),

    /// Caller-supplied tensor or label with the wrong dimensions or range.
    #[error("shape: {0}")]
    Shape(String),

    /// KV-cache lifecycle misuse (double enable, teacher forcing while caching).
    #[error("state: {0}")]
    State(String),

    /// Model weight loading error.
    #[error("weight loading: {0}")]
    WeightLoad(String),

    /// Generation manager error (worker gone, reply dropped).
    #[error("manager: {0}")]
    Manager(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        Error::Shape(msg.into())
    }

    pub(crate) fn state(msg: impl Into<String>) -> Self {
        Error::State(msg.into())
    }
}
