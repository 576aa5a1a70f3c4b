//! Replaying remote transactions and the bookkeeping that makes it
//! restartable: a per-group cursor, parked failures and our own pending
//! commits.

use std::collections::BTreeSet;

use object_store::Filter;
use sqlx::sqlite::SqliteConnection;
use sqlx::Row;

use super::error::DatabaseError;
use super::transaction::Transaction;
use super::{db_dir, Database};
use crate::safe::{GroupName, SafeError};

pub(crate) const PENDING: &str = "pending";
pub(crate) const FAILED: &str = "failed";

/// What one [`Database::sync`] pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub applied: usize,
    /// Transactions parked for retry on the next pass
    pub failed: usize,
    /// Own commits seen back on the store
    pub acknowledged: usize,
}

pub(crate) async fn mark(
    conn: &mut SqliteConnection,
    store_id: &str,
    group: &GroupName,
    tx_id: &str,
    state: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO safe_tx_ids (store_id, group_name, tx_id, state)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(store_id, group_name, tx_id) DO UPDATE SET
            state = excluded.state
        "#,
    )
    .bind(store_id)
    .bind(group.as_str())
    .bind(tx_id)
    .bind(state)
    .execute(conn)
    .await?;
    Ok(())
}

async fn unmark(
    conn: &mut SqliteConnection,
    store_id: &str,
    group: &GroupName,
    tx_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        DELETE FROM safe_tx_ids WHERE store_id = ? AND group_name = ? AND tx_id = ?
        "#,
    )
    .bind(store_id)
    .bind(group.as_str())
    .bind(tx_id)
    .execute(conn)
    .await?;
    Ok(())
}

/// Move the cursor forward to `tx_id`, never back.
async fn advance(
    conn: &mut SqliteConnection,
    store_id: &str,
    group: &GroupName,
    tx_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO safe_tx_cursors (store_id, group_name, last_applied)
        VALUES (?, ?, ?)
        ON CONFLICT(store_id, group_name) DO UPDATE SET
            last_applied = MAX(last_applied, excluded.last_applied)
        "#,
    )
    .bind(store_id)
    .bind(group.as_str())
    .bind(tx_id)
    .execute(conn)
    .await?;
    Ok(())
}

impl Database {
    /// Id of the newest transaction applied or acknowledged here.
    pub async fn last_applied(&self) -> Result<Option<String>, DatabaseError> {
        let row = sqlx::query(
            r#"
            SELECT last_applied FROM safe_tx_cursors WHERE store_id = ? AND group_name = ?
            "#,
        )
        .bind(self.safe.store_id())
        .bind(self.group.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("last_applied")))
    }

    async fn ids_in_state(&self, state: &str) -> Result<BTreeSet<String>, DatabaseError> {
        let rows = sqlx::query(
            r#"
            SELECT tx_id FROM safe_tx_ids WHERE store_id = ? AND group_name = ? AND state = ?
            "#,
        )
        .bind(self.safe.store_id())
        .bind(self.group.as_str())
        .bind(state)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("tx_id")).collect())
    }

    /// Transactions that failed to apply and will be retried.
    pub async fn failed_ids(&self) -> Result<BTreeSet<String>, DatabaseError> {
        self.ids_in_state(FAILED).await
    }

    /// Own commits not yet seen back on the store.
    pub async fn pending_ids(&self) -> Result<BTreeSet<String>, DatabaseError> {
        self.ids_in_state(PENDING).await
    }

    /// Apply remote transactions newer than the cursor, plus parked ones.
    ///
    /// Skipped when the group's touch marker is unchanged, unless `force`.
    /// A transaction that cannot be read, verified, decrypted or applied is
    /// parked and does not stop the pass.
    pub async fn sync(&self, force: bool) -> Result<SyncReport, DatabaseError> {
        let batch = self.batch.lock().await;
        if batch.is_some() {
            return Err(DatabaseError::BatchInProgress);
        }

        let dir = db_dir(&self.group);
        let check = self.safe.check_touch(&dir).await?;
        if !force && !check.updated {
            return Ok(SyncReport::default());
        }

        let store_id = self.safe.store_id();
        let cursor = self.last_applied().await?;
        let failed = self.failed_ids().await?;
        let pending = self.pending_ids().await?;

        let mut filter = Filter::files();
        filter.after_name = cursor.clone();
        let listed: BTreeSet<String> = self
            .safe
            .store()
            .list(&dir, &filter)
            .await?
            .into_iter()
            .map(|entry| entry.name)
            .collect();

        let mut report = SyncReport::default();

        // Own commits already behind the cursor
        for id in &pending {
            if cursor.as_ref().is_some_and(|c| id <= c) {
                let mut conn = self.pool.acquire().await?;
                unmark(&mut conn, store_id, &self.group, id).await?;
                report.acknowledged += 1;
            }
        }

        let candidates: BTreeSet<&String> = listed.iter().chain(failed.iter()).collect();
        for id in candidates {
            if pending.contains(id) {
                let mut tx = self.pool.begin().await?;
                unmark(&mut tx, store_id, &self.group, id).await?;
                advance(&mut tx, store_id, &self.group, id).await?;
                tx.commit().await?;
                report.acknowledged += 1;
                continue;
            }

            match self.apply(&dir, id).await {
                Ok(count) => {
                    tracing::debug!("applied transaction {} ({} updates) to {}", id, count, self.group);
                    report.applied += 1;
                }
                Err(e) => {
                    tracing::warn!("parking transaction {} of {}: {}", id, self.group, e);
                    let mut conn = self.pool.acquire().await?;
                    mark(&mut conn, store_id, &self.group, id, FAILED).await?;
                    report.failed += 1;
                }
            }
        }

        self.safe.acknowledge(&dir, check).await?;
        drop(batch);
        if report != SyncReport::default() {
            tracing::info!("synced {}: {:?}", self.group, report);
        }
        Ok(report)
    }

    /// Read, check, decrypt and apply one transaction atomically.
    async fn apply(&self, dir: &str, id: &str) -> Result<usize, DatabaseError> {
        let name = format!("{}/{}", dir, id);
        let data = self.safe.store().read(&name, None).await?;
        let transaction: Transaction =
            bincode::deserialize(&data).map_err(|e| SafeError::corrupt(&name, e))?;
        transaction.verify(&name, &self.group)?;

        let min_epochs = transaction.key_epoch.checked_add(1).ok_or_else(|| {
            SafeError::corrupt(&name, format!("key epoch {} out of range", transaction.key_epoch))
        })?;
        let ring = self.safe.get_keys(&self.group, min_epochs).await?;
        let key = ring.get(transaction.key_epoch).ok_or_else(|| {
            SafeError::Authorization(format!(
                "no key for epoch {} of {}",
                transaction.key_epoch, self.group
            ))
        })?;
        let updates = transaction.open(key)?;

        let mut statements = Vec::with_capacity(updates.len());
        for update in &updates {
            let statement = self.statement(&update.statement_key)?;
            if update.version > statement.version {
                return Err(DatabaseError::StatementTooNew {
                    key: update.statement_key.clone(),
                    remote: update.version,
                    local: statement.version,
                });
            }
            statements.push(statement);
        }

        let mut tx = self.pool.begin().await?;
        for (statement, update) in statements.iter().zip(&updates) {
            statement.query(&update.args)?.execute(&mut *tx).await?;
        }
        let store_id = self.safe.store_id();
        unmark(&mut tx, store_id, &self.group, id).await?;
        advance(&mut tx, store_id, &self.group, id).await?;
        tx.commit().await?;
        Ok(updates.len())
    }
}
