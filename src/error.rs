//! Iamages Lock - Error Types

use thiserror::Error;

use crate::model::ImageId;

/// Result type for lock operations
pub type LockResult<T> = Result<T, LockError>;

/// Lock error types
#[derive(Error, Debug)]
pub enum LockError {
    // ═══════════════════════════════════════════════════════════════
    // CRYPTO ERRORS
    // ═══════════════════════════════════════════════════════════════

    /// Wrong key or tampered data. Deliberately carries no detail.
    #[error("Not authorized")]
    Authentication,

    #[error("Passphrase too short: need at least {min} characters, got {actual}")]
    WeakInput { min: usize, actual: usize },

    #[error("Malformed key: {0}")]
    MalformedKey(String),

    // ═══════════════════════════════════════════════════════════════
    // STATE ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Image {0} was modified concurrently")]
    Conflict(ImageId),

    #[error("Caller is not the owner of this image")]
    NotOwner,

    // ═══════════════════════════════════════════════════════════════
    // STORAGE ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    // ═══════════════════════════════════════════════════════════════
    // IMAGE / SERIALIZATION ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Image codec error: {0}")]
    Codec(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl LockError {
    /// Errors an attacker could be probing for
    pub fn is_security_critical(&self) -> bool {
        matches!(self, LockError::Authentication | LockError::NotOwner)
    }

    /// Only I/O and optimistic-concurrency failures can succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LockError::Storage(_) | LockError::Conflict(_))
    }
}

impl From<std::io::Error> for LockError {
    fn from(e: std::io::Error) -> Self {
        LockError::Storage(e.to_string())
    }
}

impl From<rusqlite::Error> for LockError {
    fn from(e: rusqlite::Error) -> Self {
        LockError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for LockError {
    fn from(e: serde_json::Error) -> Self {
        LockError::Serialization(e.to_string())
    }
}

impl From<image::ImageError> for LockError {
    fn from(e: image::ImageError) -> Self {
        LockError::Codec(e.to_string())
    }
}
