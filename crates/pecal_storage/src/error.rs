//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The store directory is held by another process.
    #[error("store directory is locked by another process: {0}")]
    Locked(String),

    /// The key cannot be used as a storage key.
    #[error("invalid storage key: {0:?}")]
    InvalidKey(String),

    /// A stored value could not be decoded.
    #[error("stored value for {key:?} is corrupted: {message}")]
    Corrupted {
        /// The key whose value failed to decode.
        key: String,
        /// Decoder message.
        message: String,
    },

    /// A value could not be encoded for storage.
    #[error("failed to encode value for {key:?}: {message}")]
    Encode {
        /// The key being written.
        key: String,
        /// Encoder message.
        message: String,
    },

    /// A blocking storage task failed to complete.
    #[error("storage task failed: {0}")]
    Task(String),
}

impl StorageError {
    /// Returns true if the error means the stored bytes are unreadable, as
    /// opposed to the store itself being unavailable.
    pub fn is_corruption(&self) -> bool {
        matches!(self, StorageError::Corrupted { .. })
    }
}
