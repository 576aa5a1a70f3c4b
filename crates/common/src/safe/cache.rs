//! Local SQLite cache of the group chain, unlocked key rings and touch stamps.
//!
//! Rows are keyed by store id so one cache file can serve several safes.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePool, Row};

use super::error::SafeError;
use super::group::{GroupChain, GroupName};
use super::keystore::KeyRing;
use crate::sqlite;

#[derive(Debug, Clone)]
pub struct Cache {
    pool: SqlitePool,
}

impl Cache {
    pub async fn new(path: &Path) -> Result<Self, SafeError> {
        Self::with_pool(sqlite::connect(Some(path)).await?).await
    }

    pub async fn in_memory() -> Result<Self, SafeError> {
        Self::with_pool(sqlite::connect(None).await?).await
    }

    pub async fn with_pool(pool: SqlitePool) -> Result<Self, SafeError> {
        sqlite::migrate(sqlx::migrate!("./migrations/cache"), &pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn load_chain(&self, store_id: &str) -> Result<Option<GroupChain>, SafeError> {
        let row = sqlx::query(
            r#"
            SELECT chain FROM safe_chains WHERE store_id = ?
            "#,
        )
        .bind(store_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let bytes: Vec<u8> = row.get("chain");
                Ok(Some(bincode::deserialize(&bytes)?))
            }
            None => Ok(None),
        }
    }

    pub async fn save_chain(&self, store_id: &str, chain: &GroupChain) -> Result<(), SafeError> {
        let bytes = bincode::serialize(chain)?;
        sqlx::query(
            r#"
            INSERT INTO safe_chains (store_id, chain, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(store_id) DO UPDATE SET
                chain = excluded.chain,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(store_id)
        .bind(bytes)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_keys(
        &self,
        store_id: &str,
        group: &GroupName,
    ) -> Result<Option<KeyRing>, SafeError> {
        let row = sqlx::query(
            r#"
            SELECT keys FROM safe_keys WHERE store_id = ? AND group_name = ?
            "#,
        )
        .bind(store_id)
        .bind(group.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let bytes: Vec<u8> = row.get("keys");
                Ok(Some(bincode::deserialize(&bytes)?))
            }
            None => Ok(None),
        }
    }

    pub async fn save_keys(
        &self,
        store_id: &str,
        group: &GroupName,
        keys: &KeyRing,
    ) -> Result<(), SafeError> {
        let bytes = bincode::serialize(keys)?;
        sqlx::query(
            r#"
            INSERT INTO safe_keys (store_id, group_name, keys, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(store_id, group_name) DO UPDATE SET
                keys = excluded.keys,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(store_id)
        .bind(group.as_str())
        .bind(bytes)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Drop a cached ring, e.g. after losing membership.
    pub async fn delete_keys(&self, store_id: &str, group: &GroupName) -> Result<(), SafeError> {
        sqlx::query(
            r#"
            DELETE FROM safe_keys WHERE store_id = ? AND group_name = ?
            "#,
        )
        .bind(store_id)
        .bind(group.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Last acknowledged modification time of a directory's touch marker.
    pub async fn touch_stamp(
        &self,
        store_id: &str,
        dir: &str,
    ) -> Result<Option<DateTime<Utc>>, SafeError> {
        let row = sqlx::query(
            r#"
            SELECT mod_time FROM safe_touches WHERE store_id = ? AND dir = ?
            "#,
        )
        .bind(store_id)
        .bind(dir)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|r| DateTime::from_timestamp_micros(r.get::<i64, _>("mod_time"))))
    }

    pub async fn set_touch_stamp(
        &self,
        store_id: &str,
        dir: &str,
        mod_time: DateTime<Utc>,
    ) -> Result<(), SafeError> {
        sqlx::query(
            r#"
            INSERT INTO safe_touches (store_id, dir, mod_time)
            VALUES (?, ?, ?)
            ON CONFLICT(store_id, dir) DO UPDATE SET
                mod_time = excluded.mod_time
            "#,
        )
        .bind(store_id)
        .bind(dir)
        .bind(mod_time.timestamp_micros())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
