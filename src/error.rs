//! Error taxonomy for the representation engine

use crate::rep::RepKey;

/// Result type for representation-engine operations
pub type Result<T> = std::result::Result<T, FsError>;

/// Errors that can occur while reading, writing or converting representations
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    /// Catch-all for contract violations that are not corruption
    #[error("filesystem error: {0}")]
    General(String),

    /// Stored data is internally inconsistent and cannot be trusted
    #[error("corrupt filesystem data: {0}")]
    Corrupt(String),

    /// A representation changed shape or size underneath an open stream
    #[error("representation changed while in use: {0}")]
    RepChanged(String),

    /// Attempt to mutate a representation outside its owning transaction
    #[error("representation `{0}` is not mutable")]
    RepNotMutable(RepKey),

    /// The delta producer finished without yielding a content digest
    #[error("no MD5 digest available: {0}")]
    ChecksumAbsent(String),

    /// A string or representation key has no record in the backing store
    #[error("not found: {0}")]
    NotFound(String),

    /// The backing store hit a conflict or other retryable condition
    #[error("transient storage error: {0}")]
    Transient(String),

    /// Backend failure from the key-value store
    #[error("database error: {0}")]
    Database(String),

    /// A persisted record failed to encode or decode
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// True for errors the retry harness may replay.
    pub fn is_transient(&self) -> bool {
        matches!(self, FsError::Transient(_))
    }
}

impl From<fjall::Error> for FsError {
    fn from(e: fjall::Error) -> Self {
        FsError::Database(e.to_string())
    }
}

impl From<bincode::Error> for FsError {
    fn from(e: bincode::Error) -> Self {
        FsError::Serialization(e.to_string())
    }
}
