//! Error types for tilestack_core.

use thiserror::Error;

use crate::source::LayerId;

/// Error types for tiling, caching and fetch operations.
#[derive(Error, Debug)]
pub enum TileError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Key already present: {0}")]
    DuplicateKey(String),

    #[error("Image source cannot produce a request: {0}")]
    IndeterminateSource(String),

    #[error("Fetch task failed: {0}")]
    TaskFailure(String),

    #[error("Malformed fragment: {0}")]
    MalformedFragment(String),

    #[error("Unknown layer: {0}")]
    UnknownLayer(LayerId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for tile operations.
pub type TileResult<T> = Result<T, TileError>;
