//! Error types for Bucketeer.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Bucketeer operations.
#[derive(Error, Debug)]
pub enum BucketeerError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The bucket state store could not complete the atomic cycle
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The bucket is drained and its window never refills, so there is no
    /// time after which a retry would succeed.
    #[error("Bucket {key} is exhausted and never refills")]
    Exhausted {
        /// Store key of the exhausted bucket.
        key: String,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for BucketeerError {
    fn from(err: config::ConfigError) -> Self {
        BucketeerError::Config(err.to_string())
    }
}

/// Result type alias for Bucketeer operations.
pub type Result<T> = std::result::Result<T, BucketeerError>;
