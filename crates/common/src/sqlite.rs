//! SQLite connection setup shared by the local cache and replicated databases.

use std::path::Path;

use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

/// Open a pool on `path`, or on a private in-memory database when `None`.
pub async fn connect(path: Option<&Path>) -> Result<SqlitePool, sqlx::Error> {
    match path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            let options = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal);

            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await
        }
        None => {
            let options = SqliteConnectOptions::new()
                .filename(":memory:")
                .journal_mode(SqliteJournalMode::Wal);

            // Every connection to ":memory:" is its own database, so keep exactly one alive
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await
        }
    }
}

/// Run a migrator that shares its pool with other migrators.
pub(crate) async fn migrate(
    mut migrator: Migrator,
    pool: &SqlitePool,
) -> Result<(), sqlx::migrate::MigrateError> {
    migrator.set_ignore_missing(true);
    migrator.run(pool).await
}
