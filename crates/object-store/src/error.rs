//! Error types for the blob store.

/// Errors that can occur when working with the blob store.
#[derive(Debug, thiserror::Error)]
pub enum BlobStoreError {
    /// Object storage error
    #[error("object storage error: {0}")]
    ObjectStore(#[from] object_store::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Blob not found
    #[error("blob not found: {0}")]
    NotFound(String),

    /// Invalid blob name
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// S3 bucket not found - must be created before use
    #[error("S3 bucket '{0}' does not exist. Create it before opening a safe.")]
    BucketNotFound(String),

    /// The upload worker is gone
    #[error("upload queue closed")]
    QueueClosed,

    /// One or more queued uploads failed
    #[error("{0} queued upload(s) failed")]
    UploadsFailed(usize),
}

impl BlobStoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BlobStoreError::NotFound(_))
    }
}

/// Result type alias for blob store operations.
pub type Result<T> = std::result::Result<T, BlobStoreError>;
