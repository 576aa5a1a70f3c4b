//! Best-effort lease lock over a [`BlobStore`].
//!
//! A contender writes `<dir>/.lock/<kind>-<created>-<uuid>.lock`, waits for the
//! store to settle, then re-lists the lock folder. The oldest surviving file
//! wins; age is the creation stamp embedded in the name, so the winner's
//! heartbeat rewrites never make it look younger. Files whose modification
//! time is older than the expiry are treated as abandoned and purged.
//!
//! This is not linearizable: it assumes the store's modification times and
//! the peers' clocks are roughly aligned.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::Result;
use crate::store::{BlobStore, Filter};

/// Name of the folder holding lock files inside a locked directory
pub const LOCK_DIR: &str = ".lock";

/// Timing parameters of the lease lock, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockConfig {
    /// A lock file not renewed for this long is abandoned
    pub expire_ms: u64,
    /// How often a held lock renews its file
    pub heartbeat_ms: u64,
    /// Delay between writing our file and re-listing
    pub settle_ms: u64,
    /// Delay between attempts while waiting for the lock
    pub poll_ms: u64,
    /// Default wait used by callers that do not pass their own timeout
    pub timeout_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            expire_ms: 10_000,
            heartbeat_ms: 500,
            settle_ms: 100,
            poll_ms: 500,
            timeout_ms: 60_000,
        }
    }
}

impl LockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// A named lock on one directory of the store.
#[derive(Debug, Clone)]
pub struct Lock {
    store: Arc<dyn BlobStore>,
    folder: String,
    kind: String,
    config: LockConfig,
}

impl Lock {
    pub fn new(store: Arc<dyn BlobStore>, dir: &str, kind: &str, config: LockConfig) -> Self {
        let dir = dir.trim_end_matches('/');
        let folder = if dir.is_empty() {
            LOCK_DIR.to_string()
        } else {
            format!("{}/{}", dir, LOCK_DIR)
        };
        Self {
            store,
            folder,
            kind: kind.to_string(),
            config,
        }
    }

    /// Keep trying until the lock is won or `timeout` runs out.
    ///
    /// Running out of time is not an error: `Ok(None)` means not acquired.
    pub async fn acquire(&self, timeout: Duration) -> Result<Option<LockGuard>> {
        let deadline = Instant::now() + timeout;
        let poll = Duration::from_millis(self.config.poll_ms);
        loop {
            if let Some(guard) = self.try_acquire().await? {
                return Ok(Some(guard));
            }
            if Instant::now() + poll > deadline {
                tracing::debug!("gave up waiting for lock {}/{}", self.folder, self.kind);
                return Ok(None);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// A single attempt.
    pub async fn try_acquire(&self) -> Result<Option<LockGuard>> {
        let name = format!(
            "{}-{:016x}-{}.lock",
            self.kind,
            Utc::now().timestamp_micros(),
            Uuid::new_v4().simple()
        );
        let path = format!("{}/{}", self.folder, name);
        self.store.write(&path, Bytes::new()).await?;

        tokio::time::sleep(Duration::from_millis(self.config.settle_ms)).await;

        let mine = match self.store.stat(&path).await {
            Ok(entry) => entry,
            // Another contender took us for abandoned
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };

        let expire = chrono::Duration::milliseconds(self.config.expire_ms as i64);
        let filter = Filter::files().with_prefix(format!("{}-", self.kind));
        let mut oldest: Option<String> = None;
        for entry in self.store.list(&self.folder, &filter).await? {
            if entry.name != name && entry.mod_time + expire < mine.mod_time {
                tracing::debug!("purging abandoned lock file {}", entry.name);
                self.store
                    .delete(&format!("{}/{}", self.folder, entry.name))
                    .await?;
                continue;
            }
            // Listing is sorted, so the first survivor is the oldest
            if oldest.is_none() {
                oldest = Some(entry.name);
            }
        }

        if oldest.as_deref() != Some(name.as_str()) {
            tracing::debug!(
                "lock {}/{} held by {:?}, backing off",
                self.folder,
                self.kind,
                oldest
            );
            self.store.delete(&path).await?;
            return Ok(None);
        }

        tracing::debug!("acquired lock {}", path);
        Ok(Some(LockGuard::hold(
            self.store.clone(),
            path,
            Duration::from_millis(self.config.heartbeat_ms),
        )))
    }
}

/// Proof of holding a [`Lock`]. The lock file is renewed in the background
/// until [`LockGuard::release`] is called.
///
/// Dropping the guard without releasing stops the renewal and leaves the file
/// to expire.
#[derive(Debug)]
pub struct LockGuard {
    store: Arc<dyn BlobStore>,
    path: String,
    stop: Option<oneshot::Sender<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl LockGuard {
    fn hold(store: Arc<dyn BlobStore>, path: String, every: Duration) -> Self {
        let (stop, mut stopped) = oneshot::channel::<()>();
        let renew_store = store.clone();
        let renew_path = path.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = renew_store.write(&renew_path, Bytes::new()).await {
                            tracing::warn!("failed to renew lock {}: {}", renew_path, e);
                        }
                    }
                    _ = &mut stopped => break,
                }
            }
        });

        Self {
            store,
            path,
            stop: Some(stop),
            heartbeat: Some(heartbeat),
        }
    }

    /// Full store name of the lock file.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Stop renewing and delete the lock file.
    pub async fn release(mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(heartbeat) = self.heartbeat.take() {
            let _ = heartbeat.await;
        }
        tracing::debug!("releasing lock {}", self.path);
        self.store.delete(&self.path).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::storage::Storage;

    fn fast() -> LockConfig {
        LockConfig {
            expire_ms: 10_000,
            heartbeat_ms: 20,
            settle_ms: 10,
            poll_ms: 10,
            timeout_ms: 5_000,
        }
    }

    fn lock(store: &Arc<dyn BlobStore>, config: LockConfig) -> Lock {
        Lock::new(store.clone(), "groups", "chain", config)
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let store: Arc<dyn BlobStore> = Arc::new(Storage::memory());
        let lock = lock(&store, fast());

        let guard = lock.try_acquire().await.unwrap().expect("lock is free");
        let held = store.list("groups/.lock", &Filter::files()).await.unwrap();
        assert_eq!(held.len(), 1);
        assert!(guard.path().starts_with("groups/.lock/chain-"));

        guard.release().await.unwrap();
        let held = store.list("groups/.lock", &Filter::files()).await.unwrap();
        assert!(held.is_empty());

        // Free again after release
        let guard = lock.try_acquire().await.unwrap();
        assert!(guard.is_some());
    }

    #[tokio::test]
    async fn test_held_lock_is_not_acquired() {
        let store: Arc<dyn BlobStore> = Arc::new(Storage::memory());
        let first = lock(&store, fast());
        let second = lock(&store, fast());

        let guard = first.acquire(Duration::from_secs(1)).await.unwrap().unwrap();
        let denied = second.acquire(Duration::from_millis(50)).await.unwrap();
        assert!(denied.is_none());

        // The loser cleaned up after itself
        let held = store.list("groups/.lock", &Filter::files()).await.unwrap();
        assert_eq!(held.len(), 1);

        guard.release().await.unwrap();
        assert!(second.try_acquire().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_other_kinds_do_not_conflict() {
        let store: Arc<dyn BlobStore> = Arc::new(Storage::memory());
        let chain = lock(&store, fast());
        let other = Lock::new(store.clone(), "groups", "config", fast());

        let _chain = chain.try_acquire().await.unwrap().unwrap();
        assert!(other.try_acquire().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_abandoned_lock_is_purged() {
        let store: Arc<dyn BlobStore> = Arc::new(Storage::memory());
        let config = LockConfig {
            expire_ms: 50,
            ..fast()
        };

        // A crashed peer left this behind, older than anything we will write
        store
            .write(
                "groups/.lock/chain-0000000000000001-dead.lock",
                Bytes::new(),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let guard = lock(&store, config).try_acquire().await.unwrap();
        assert!(guard.is_some());
        let held = store.list("groups/.lock", &Filter::files()).await.unwrap();
        assert_eq!(held.len(), 1);
        assert!(!held[0].name.contains("dead"));
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_lock_alive() {
        let store: Arc<dyn BlobStore> = Arc::new(Storage::memory());
        let config = LockConfig {
            expire_ms: 60,
            ..fast()
        };

        let guard = lock(&store, config.clone()).try_acquire().await.unwrap().unwrap();
        // Well past the expiry, but the heartbeat keeps renewing
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(lock(&store, config).try_acquire().await.unwrap().is_none());
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let store: Arc<dyn BlobStore> = Arc::new(Storage::memory());
        let holders = Arc::new(AtomicUsize::new(0));
        let entered = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let lock = lock(&store, fast());
            let holders = holders.clone();
            let entered = entered.clone();
            tasks.push(tokio::spawn(async move {
                let guard = lock
                    .acquire(Duration::from_secs(10))
                    .await
                    .unwrap()
                    .expect("lock within timeout");
                assert_eq!(holders.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(30)).await;
                holders.fetch_sub(1, Ordering::SeqCst);
                entered.fetch_add(1, Ordering::SeqCst);
                guard.release().await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(entered.load(Ordering::SeqCst), 4);
    }
}
