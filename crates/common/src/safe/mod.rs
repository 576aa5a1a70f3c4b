//! A safe: a shared directory on a passive blob store that several users
//! read and write without any server.
//!
//! Membership lives in a signed, append-only group chain under `groups/`.
//! Each group's symmetric keys live in a keystore under `keys/<group>/`,
//! sealed for every member. Higher layers (see [`crate::db`]) encrypt their
//! records with those keys and use [`Safe::touch`] / [`Safe::is_updated`] to
//! tell each other when to look.
//!
//! Store layout:
//!
//! ```text
//! groups/<batch>            1024 changes per immutable batch
//! groups/.touch
//! groups/.lock/             chain lock, shared with keystore writes
//! keys/<group>/keystore
//! keys/<group>/.touch
//! db/<group>/<tx id>
//! db/<group>/.touch
//! ```

mod cache;
mod chain;
mod error;
mod group;
mod keys;
mod keystore;
mod touch;

use std::collections::HashMap;
use std::sync::Arc;

use object_store::{BlobStore, Lock, LockConfig, LockGuard, UploadConfig, Uploader};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::crypto::{Identity, UserId};
use crate::id::{IdGenerator, TxId};

pub use cache::Cache;
pub use chain::GROUPS_DIR;
pub use error::SafeError;
pub use group::{
    compare, endorsement_score, reconcile, resolve_fork, ChainStatus, ChangeKind, Divergence,
    ForkWinner, GroupChain, GroupChange, GroupName, Groups, ADMIN, BATCH_SIZE, USERS,
};
pub use keys::KEYS_DIR;
pub use keystore::{EnvelopeEntry, KeyRing, Keystore, KEYSTORE_FILE};
pub use touch::TOUCH_FILE;

/// Tunables of an open safe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafeOptions {
    pub lock: LockConfig,
    /// One sync in this many re-reads the chain from batch 0 to spot forks
    pub fork_check_one_in: u32,
    pub uploads: UploadConfig,
}

impl Default for SafeOptions {
    fn default() -> Self {
        Self {
            lock: LockConfig::default(),
            fork_check_one_in: 8,
            uploads: UploadConfig::default(),
        }
    }
}

#[derive(Debug)]
pub struct Safe {
    url: String,
    /// Key of this safe's rows in the local cache
    store_id: String,
    creator: UserId,
    identity: Identity,
    store: Arc<dyn BlobStore>,
    cache: Cache,
    options: SafeOptions,
    chain: tokio::sync::Mutex<GroupChain>,
    keys: RwLock<HashMap<GroupName, KeyRing>>,
    ids: IdGenerator,
}

impl Safe {
    /// Open an existing safe. `store` must already be rooted at the safe.
    ///
    /// The url has the form `<scheme>://<host>/<creator id>/<name>`.
    pub async fn open(
        store: Arc<dyn BlobStore>,
        cache: Cache,
        identity: Identity,
        url: &str,
        options: SafeOptions,
    ) -> Result<Self, SafeError> {
        let creator = creator_of(url)?;
        let chain = cache.load_chain(url).await?.unwrap_or_default();
        tracing::info!(
            "opened safe {} as {} with {} cached changes",
            url,
            identity.id().nick(),
            chain.changes.len()
        );

        Ok(Self {
            url: url.to_string(),
            store_id: url.to_string(),
            creator,
            identity,
            store,
            cache,
            options,
            chain: tokio::sync::Mutex::new(chain),
            keys: RwLock::new(HashMap::new()),
            ids: IdGenerator::default(),
        })
    }

    /// Open a safe and, when its chain is empty, bootstrap it: the creator
    /// grants themselves `adm` and `usr`.
    pub async fn create(
        store: Arc<dyn BlobStore>,
        cache: Cache,
        identity: Identity,
        url: &str,
        options: SafeOptions,
    ) -> Result<Self, SafeError> {
        let safe = Self::open(store, cache, identity, url, options).await?;
        if safe.identity.id() != &safe.creator {
            return Err(SafeError::Authorization(format!(
                "only {} can create {}",
                safe.creator, url
            )));
        }

        let groups = safe.get_groups().await?;
        let me = safe.identity.id().clone();
        if groups.members(&GroupName::admin()).next().is_none() {
            safe.update_group(&GroupName::admin(), ChangeKind::Grant, &[me.clone()])
                .await?;
        }
        if !groups.contains(&GroupName::users(), &me) {
            safe.update_group(&GroupName::users(), ChangeKind::Grant, &[me])
                .await?;
        }
        Ok(safe)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn creator(&self) -> &UserId {
        &self.creator
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn options(&self) -> &SafeOptions {
        &self.options
    }

    pub(crate) fn store_id(&self) -> &str {
        &self.store_id
    }

    /// A fresh, time-ordered id unique across peers.
    pub fn next_id(&self) -> TxId {
        self.ids.next_id()
    }

    /// Start a background uploader writing into this safe's store.
    pub fn uploader(&self) -> Uploader {
        Uploader::spawn(self.store.clone(), self.options.uploads.clone())
    }

    /// Take the `kind` lock on `dir`, waiting up to the configured timeout.
    pub(crate) async fn lock(&self, dir: &str, kind: &str) -> Result<LockGuard, SafeError> {
        let lock = Lock::new(self.store.clone(), dir, kind, self.options.lock.clone());
        lock.acquire(self.options.lock.timeout())
            .await?
            .ok_or_else(|| SafeError::LockTimeout(format!("{}/{}", dir, kind)))
    }
}

/// The creator id is the second-to-last path segment of the url.
fn creator_of(url: &str) -> Result<UserId, SafeError> {
    let parsed = Url::parse(url).map_err(|e| SafeError::InvalidUrl(format!("{}: {}", url, e)))?;
    let segments: Vec<&str> = parsed
        .path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();
    if segments.len() < 2 {
        return Err(SafeError::InvalidUrl(format!(
            "{}: expected <creator>/<name> in the path",
            url
        )));
    }
    segments[segments.len() - 2]
        .parse()
        .map_err(|e| SafeError::InvalidUrl(format!("{}: {}", url, e)))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_creator_from_url() {
        let alice = Identity::generate("alice").unwrap();
        let url = format!("mem://local/{}/vault", alice.id());
        assert_eq!(&creator_of(&url).unwrap(), alice.id());

        let nested = format!("s3://bucket/teams/{}/vault/", alice.id());
        assert_eq!(&creator_of(&nested).unwrap(), alice.id());

        assert!(matches!(
            creator_of("mem://local/vault"),
            Err(SafeError::InvalidUrl(_))
        ));
        assert!(matches!(
            creator_of("mem://local/alice/vault"),
            Err(SafeError::InvalidUrl(_))
        ));
        assert!(matches!(creator_of("not a url"), Err(SafeError::InvalidUrl(_))));
    }
}
