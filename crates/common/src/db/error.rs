use object_store::BlobStoreError;

use crate::crypto::{KeyError, SecretError};
use crate::safe::SafeError;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error(transparent)]
    Safe(#[from] SafeError),

    #[error("sql error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("invalid definition: {0}")]
    Definition(String),

    #[error("statement {key} is already defined at version {version} with different SQL")]
    DuplicateStatement { key: String, version: f32 },

    #[error("unknown statement {0}")]
    UnknownStatement(String),

    /// A remote update was written against a newer definition than ours
    #[error("statement {key} at version {remote} is newer than the local version {local}")]
    StatementTooNew { key: String, remote: f32, local: f32 },

    #[error("missing argument {name} for statement {key}")]
    MissingArgument { key: String, name: String },

    #[error("a batch is in progress, commit or roll it back first")]
    BatchInProgress,

    #[error("store error: {0}")]
    Store(#[from] BlobStoreError),

    #[error("key error: {0}")]
    Key(#[from] KeyError),

    #[error("encryption error: {0}")]
    Secret(#[from] SecretError),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}
