//! Replicated SQLite state for one group of a safe.
//!
//! Local writes go through named statements ([`Database::define`]) inside a
//! batch. [`Database::commit`] seals the batch's updates under the group's
//! newest key and drops them in the store as one transaction; every other
//! member replays them with [`Database::sync`], in id order.

mod error;
mod statements;
mod sync;
mod transaction;
mod value;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use sqlx::sqlite::{Sqlite, SqlitePool};
use sqlx::Row;

use crate::id::TxId;
use crate::safe::{GroupName, Safe, SafeError};
use crate::sqlite;

pub use error::DatabaseError;
pub use statements::{parse as parse_definition, Statement, INIT_KEY};
pub use sync::SyncReport;
pub use transaction::{Transaction, Update};
pub use value::{Args, Value};

use statements::Statements;

pub const DB_DIR: &str = "db";

pub(crate) fn db_dir(group: &GroupName) -> String {
    format!("{}/{}", DB_DIR, group)
}

/// Local changes not yet committed.
struct Batch {
    tx: sqlx::Transaction<'static, Sqlite>,
    updates: Vec<Update>,
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("updates", &self.updates)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct Database {
    safe: Arc<Safe>,
    group: GroupName,
    pool: SqlitePool,
    statements: RwLock<Statements>,
    batch: tokio::sync::Mutex<Option<Batch>>,
}

impl Database {
    /// Attach to `group` of `safe`, replicating into `pool`.
    ///
    /// `pool` must not be the pool of the safe's own cache: a batch keeps a
    /// connection busy until commit.
    pub async fn open(
        safe: Arc<Safe>,
        group: GroupName,
        pool: SqlitePool,
    ) -> Result<Self, DatabaseError> {
        sqlite::migrate(sqlx::migrate!("./migrations/database"), &pool).await?;
        Ok(Self {
            safe,
            group,
            pool,
            statements: RwLock::new(Statements::default()),
            batch: tokio::sync::Mutex::new(None),
        })
    }

    pub fn group(&self) -> &GroupName {
        &self.group
    }

    pub fn safe(&self) -> &Arc<Safe> {
        &self.safe
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Register the statements of `ddl` at `version` and run its `INIT` ones.
    pub async fn define(&self, version: f32, ddl: &str) -> Result<(), DatabaseError> {
        if self.batch.lock().await.is_some() {
            return Err(DatabaseError::BatchInProgress);
        }
        for (key, sql) in statements::parse(ddl)? {
            if key == INIT_KEY {
                sqlx::raw_sql(&sql).execute(&self.pool).await?;
                tracing::debug!("ran init statement of {}: {}", self.group, sql);
            } else if self.statements.write().define(&key, version, &sql)? {
                tracing::debug!("defined statement {} v{}", key, version);
            }
        }
        Ok(())
    }

    fn statement(&self, key: &str) -> Result<Statement, DatabaseError> {
        self.statements
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| DatabaseError::UnknownStatement(key.to_string()))
    }

    /// Run statement `key` inside the current batch, opening one if needed.
    /// Returns the number of affected rows.
    pub async fn exec(&self, key: &str, args: Args) -> Result<u64, DatabaseError> {
        let statement = self.statement(key)?;
        let mut batch = self.batch.lock().await;
        let open = match batch.take() {
            Some(open) => batch.insert(open),
            None => batch.insert(Batch {
                tx: self.pool.begin().await?,
                updates: Vec::new(),
            }),
        };

        let result = statement.query(&args)?.execute(&mut *open.tx).await?;
        open.updates.push(Update {
            statement_key: key.to_string(),
            args,
            version: statement.version,
        });
        Ok(result.rows_affected())
    }

    /// Run statement `key` and collect every row. Sees the open batch.
    pub async fn query(&self, key: &str, args: &Args) -> Result<Vec<Vec<Value>>, DatabaseError> {
        let statement = self.statement(key)?;
        let mut batch = self.batch.lock().await;
        let rows = match batch.as_mut() {
            Some(open) => statement.query(args)?.fetch_all(&mut *open.tx).await?,
            None => statement.query(args)?.fetch_all(&self.pool).await?,
        };

        let mut table = Vec::with_capacity(rows.len());
        for row in &rows {
            let values = (0..row.len())
                .map(|i| Value::from_row(row, i))
                .collect::<Result<Vec<_>, _>>()?;
            table.push(values);
        }
        Ok(table)
    }

    /// Drop the open batch and its local effects.
    pub async fn rollback(&self) -> Result<(), DatabaseError> {
        if let Some(batch) = self.batch.lock().await.take() {
            batch.tx.rollback().await?;
            tracing::debug!("rolled back {} updates on {}", batch.updates.len(), self.group);
        }
        Ok(())
    }

    /// Publish the open batch as one transaction.
    ///
    /// Returns the transaction id, or `None` when there was nothing to
    /// publish. If sealing or writing fails the batch stays open.
    pub async fn commit(&self) -> Result<Option<TxId>, DatabaseError> {
        let mut batch = self.batch.lock().await;
        let updates = match batch.as_ref() {
            Some(open) => open.updates.clone(),
            None => return Ok(None),
        };
        if updates.is_empty() {
            if let Some(open) = batch.take() {
                open.tx.commit().await?;
            }
            return Ok(None);
        }

        let ring = self.safe.get_keys(&self.group, 0).await?;
        let (epoch, key) = ring.latest().ok_or_else(|| {
            SafeError::Authorization(format!("no usable key for {}", self.group))
        })?;
        let transaction =
            Transaction::seal(self.safe.identity(), &self.group, epoch, key, &updates)?;

        let id = self.safe.next_id();
        let dir = db_dir(&self.group);
        let path = format!("{}/{}", dir, id);
        let data = bincode::serialize(&transaction)?;
        self.safe.store().write(&path, Bytes::from(data)).await?;

        let Some(Batch { mut tx, .. }) = batch.take() else {
            return Ok(None);
        };
        let recorded = async {
            sync::mark(&mut tx, self.safe.store_id(), &self.group, &id, sync::PENDING).await?;
            tx.commit().await
        }
        .await;
        if let Err(e) = recorded {
            tracing::error!("failed to record transaction {} locally: {}", id, e);
            if let Err(e) = self.safe.store().delete(&path).await {
                tracing::warn!("failed to withdraw transaction {}: {}", path, e);
            }
            return Err(e.into());
        }

        self.safe.touch(&[&dir]).await?;
        tracing::info!(
            "committed transaction {} with {} updates to {} at epoch {}",
            id,
            updates.len(),
            self.group,
            epoch
        );
        Ok(Some(id))
    }
}
