//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid cid: {0}")]
    InvalidCid(String),

    #[error("invalid multihash: {0}")]
    InvalidMultihash(String),

    #[error("invalid transport metadata: {0}")]
    InvalidMetadata(String),

    #[error("invalid backend url {url}: {reason}")]
    InvalidBackendUrl { url: String, reason: String },

    #[error("cannot read backends file: {0}")]
    BackendsFile(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
