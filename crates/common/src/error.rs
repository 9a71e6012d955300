//! Error types shared across the server crates.

use thiserror::Error;

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid JSON.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// Config parsed but failed validation.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Shared-memory instrument catalogue errors.
#[derive(Debug, Error)]
pub enum CatalogueError {
    /// Underlying file or mmap operation failed.
    #[error("catalogue I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Mapped region is too small or carries a foreign header.
    #[error("catalogue region invalid: {0}")]
    Invalid(String),

    /// Region is full; the instrument was not recorded.
    #[error("catalogue is full ({capacity} entries)")]
    Full { capacity: usize },
}
