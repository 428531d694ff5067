//! Error types for the tilestream engine

use thiserror::Error;

/// Main error type for the engine
#[derive(Debug, Error)]
pub enum Error {
    #[error("GPU error: {0}")]
    Gpu(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("streaming error: {0}")]
    Streaming(String),
}

/// Convenience result alias used throughout the engine
pub type Result<T> = std::result::Result<T, Error>;
