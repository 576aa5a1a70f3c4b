use object_store::BlobStoreError;

use crate::crypto::{EnvelopeError, KeyError, SecretError};

/// Errors surfaced by group, key and touch operations on a [`super::Safe`].
#[derive(Debug, thiserror::Error)]
pub enum SafeError {
    /// The signer or caller lacks the required group standing
    #[error("authorization error: {0}")]
    Authorization(String),

    #[error("invalid signature: {0}")]
    SignatureInvalid(String),

    #[error("timed out waiting for lock on {0}")]
    LockTimeout(String),

    /// The stored chain forked from ours with equal endorsement; retry after it moves
    #[error("group chain forked at {at} with equal endorsement")]
    ForkUnresolved { at: usize },

    #[error("not found: {0}")]
    NotFound(String),

    /// A blob that could not be decoded, or that names the wrong group
    #[error("corrupt record {name}: {reason}")]
    CorruptRecord { name: String, reason: String },

    #[error("invalid safe url {0}")]
    InvalidUrl(String),

    #[error("store error: {0}")]
    Store(BlobStoreError),

    #[error("local cache error: {0}")]
    Cache(#[from] sqlx::Error),

    #[error("local cache migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("key error: {0}")]
    Key(#[from] KeyError),

    #[error("encryption error: {0}")]
    Secret(#[from] SecretError),

    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

impl From<BlobStoreError> for SafeError {
    fn from(err: BlobStoreError) -> Self {
        match err {
            BlobStoreError::NotFound(name) => SafeError::NotFound(name),
            e => SafeError::Store(e),
        }
    }
}

impl SafeError {
    pub fn corrupt(name: impl Into<String>, reason: impl ToString) -> Self {
        SafeError::CorruptRecord {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SafeError::NotFound(_))
    }
}
