//! Shared helpers for safe integration tests
#![allow(dead_code)]

use std::sync::{Arc, Once};

use common::prelude::*;
use common::sqlite;
use object_store::{BlobStore, LockConfig, Storage};

static TRACING: Once = Once::new();

pub const NOTES: &str = r#"
-- INIT
CREATE TABLE IF NOT EXISTS notes (id INTEGER PRIMARY KEY, title TEXT NOT NULL, stars INTEGER)

-- INSERT_NOTE
INSERT INTO notes (title, stars) VALUES (:title, :stars)

-- STAR_NOTE
UPDATE notes SET stars = stars + 1 WHERE title = :title

-- SELECT_NOTES
SELECT title, stars FROM notes ORDER BY id
"#;

/// Route `RUST_LOG` output to the test harness.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn options() -> SafeOptions {
    SafeOptions {
        lock: LockConfig {
            expire_ms: 2_000,
            heartbeat_ms: 100,
            settle_ms: 5,
            poll_ms: 10,
            timeout_ms: 5_000,
        },
        ..Default::default()
    }
}

pub fn identity(nick: &str) -> Identity {
    Identity::generate(nick).unwrap()
}

pub fn url_of(creator: &Identity) -> String {
    format!("mem://local/{}/vault", creator.id())
}

/// A shared in-memory store, one per test.
pub fn store() -> Arc<dyn BlobStore> {
    Arc::new(Storage::memory())
}

/// `creator` bootstraps a fresh safe on `store`.
pub async fn create(store: &Arc<dyn BlobStore>, creator: &Identity) -> Arc<Safe> {
    init_tracing();
    let cache = Cache::in_memory().await.unwrap();
    let safe = Safe::create(store.clone(), cache, creator.clone(), &url_of(creator), options())
        .await
        .unwrap();
    Arc::new(safe)
}

/// Another peer opens the safe at `url` with its own cache.
pub async fn join(store: &Arc<dyn BlobStore>, identity: &Identity, url: &str) -> Arc<Safe> {
    init_tracing();
    let cache = Cache::in_memory().await.unwrap();
    let safe = Safe::open(store.clone(), cache, identity.clone(), url, options())
        .await
        .unwrap();
    Arc::new(safe)
}

/// Replicated notes database of `group`, in its own in-memory pool.
pub async fn notes(safe: &Arc<Safe>, group: &GroupName) -> Database {
    let pool = sqlite::connect(None).await.unwrap();
    let db = Database::open(safe.clone(), group.clone(), pool).await.unwrap();
    db.define(1.0, NOTES).await.unwrap();
    db
}

/// `(title, stars)` rows of a notes database.
pub async fn titles(db: &Database) -> Vec<(String, i64)> {
    db.query("SELECT_NOTES", &Args::new())
        .await
        .unwrap()
        .into_iter()
        .map(|row| {
            (
                row[0].as_str().unwrap().to_string(),
                row[1].as_i64().unwrap_or_default(),
            )
        })
        .collect()
}
