//! Per-group key lists: reading, caching, rotating and resealing keystores.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use object_store::Filter;

use super::chain::{CHAIN_LOCK, GROUPS_DIR};
use super::error::SafeError;
use super::group::{ChangeKind, GroupName, Groups, ADMIN};
use super::keystore::{KeyRing, Keystore, KEYSTORE_FILE};
use super::Safe;
use crate::crypto::{Secret, UserId};

pub const KEYS_DIR: &str = "keys";

pub(crate) fn keys_dir(group: &GroupName) -> String {
    format!("{}/{}", KEYS_DIR, group)
}

fn keystore_path(group: &GroupName) -> String {
    format!("{}/{}/{}", KEYS_DIR, group, KEYSTORE_FILE)
}

/// Users who get an envelope: the group's members and every admin.
fn recipients_of(group: &GroupName, groups: &Groups) -> BTreeSet<UserId> {
    groups
        .members(group)
        .chain(groups.members(&GroupName::admin()))
        .cloned()
        .collect()
}

/// Keystores to rewrite after a batch of membership changes.
///
/// A change to `adm` touches every keystore, since admins hold an envelope
/// in all of them.
#[derive(Debug, Default)]
pub(crate) struct KeyRefresh {
    groups: BTreeMap<GroupName, bool>,
    all: Option<bool>,
}

impl KeyRefresh {
    /// Record one change; `member_of` are the user's groups before it.
    pub fn note(&mut self, group: &GroupName, kind: ChangeKind, member_of: &[GroupName]) {
        match kind {
            ChangeKind::Grant => self.mark(group, false),
            ChangeKind::Revoke => self.mark(group, true),
            ChangeKind::Curse => {
                for group in member_of {
                    self.mark(group, true);
                }
            }
            ChangeKind::Endorse => {}
        }
    }

    fn mark(&mut self, group: &GroupName, rotate: bool) {
        if group.as_str() == ADMIN {
            self.all = Some(self.all.unwrap_or(false) || rotate);
        }
        *self.groups.entry(group.clone()).or_insert(false) |= rotate;
    }
}

/// How to rewrite one keystore.
struct Reseal<'a> {
    group: &'a GroupName,
    /// Membership the existing keystore is verified against
    before: &'a Groups,
    /// Membership the new keystore is sealed for
    after: &'a Groups,
    rotate: bool,
    /// Member whose `since_epoch` drops to 0
    share_history: Option<&'a UserId>,
}

impl Safe {
    /// Keys of `group` this user may use.
    ///
    /// Served from memory or the local cache while the group's touch marker
    /// is unchanged and at least `min_epochs` epochs are known. Otherwise the
    /// keystore is read and verified. An admin reading a keystore that is
    /// missing, or whose envelopes no longer match the membership, rewrites it
    /// under the chain lock.
    pub async fn get_keys(&self, group: &GroupName, min_epochs: u32) -> Result<KeyRing, SafeError> {
        let groups = self.get_groups().await?;
        let me = self.identity.id();
        if !groups.contains(group, me) {
            // Lost membership: stop serving keys from the caches
            self.keys.write().remove(group);
            self.cache.delete_keys(&self.store_id, group).await?;
            return Err(SafeError::Authorization(format!(
                "{} is not a member of {}",
                me, group
            )));
        }

        let dir = keys_dir(group);
        let check = self.check_touch(&dir).await?;
        if !check.updated {
            if let Some(ring) = self.cached_ring(group, min_epochs).await? {
                return Ok(ring);
            }
        }

        let keystore = match self.read_keystore(group).await? {
            Some(keystore) => {
                keystore.verify(group, &groups)?;
                let stale = keystore.recipients().cloned().collect::<BTreeSet<_>>()
                    != recipients_of(group, &groups);
                if stale && groups.is_admin(me) {
                    tracing::info!("envelopes of {} are out of date, resealing", group);
                    self.locked_reseal(group, None).await?
                } else {
                    keystore
                }
            }
            None if groups.is_admin(me) => self.locked_reseal(group, None).await?,
            None => return Err(SafeError::NotFound(keystore_path(group))),
        };

        let (keys, since_epoch) = keystore.open(&self.identity)?;
        let ring = KeyRing::from_history(keys, since_epoch);
        if ring.epochs() < min_epochs {
            tracing::warn!(
                "keystore of {} has {} epochs, {} expected",
                group,
                ring.epochs(),
                min_epochs
            );
        }

        self.keys.write().insert(group.clone(), ring.clone());
        self.cache.save_keys(&self.store_id, group, &ring).await?;
        self.acknowledge(&dir, check).await?;
        Ok(ring)
    }

    /// Give `user` every past epoch of `group`, not just those since their grant.
    pub async fn share_key_history(&self, group: &GroupName, user: &UserId) -> Result<(), SafeError> {
        let me = self.identity.id();
        let groups = self.get_groups().await?;
        if !groups.is_admin(me) {
            return Err(SafeError::Authorization(format!("{} is not a member of {}", me, ADMIN)));
        }
        if !groups.contains(group, user) {
            return Err(SafeError::Authorization(format!(
                "{} is not a member of {}",
                user, group
            )));
        }
        self.locked_reseal(group, Some(user)).await?;
        tracing::info!("shared key history of {} with {}", group, user);
        Ok(())
    }

    async fn cached_ring(
        &self,
        group: &GroupName,
        min_epochs: u32,
    ) -> Result<Option<KeyRing>, SafeError> {
        if let Some(ring) = self.keys.read().get(group) {
            if ring.epochs() >= min_epochs {
                return Ok(Some(ring.clone()));
            }
        }
        match self.cache.load_keys(&self.store_id, group).await? {
            Some(ring) if ring.epochs() >= min_epochs => {
                self.keys.write().insert(group.clone(), ring.clone());
                Ok(Some(ring))
            }
            _ => Ok(None),
        }
    }

    async fn read_keystore(&self, group: &GroupName) -> Result<Option<Keystore>, SafeError> {
        let path = keystore_path(group);
        match self.store.read(&path, None).await {
            Ok(data) => {
                let keystore =
                    bincode::deserialize(&data).map_err(|e| SafeError::corrupt(&path, e))?;
                Ok(Some(keystore))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Groups that have a keystore on the store.
    async fn keystore_groups(&self) -> Result<Vec<GroupName>, SafeError> {
        let filter = Filter {
            only_folders: true,
            ..Default::default()
        };
        Ok(self
            .store
            .list(KEYS_DIR, &filter)
            .await?
            .into_iter()
            .filter_map(|entry| GroupName::new(&entry.name).ok())
            .collect())
    }

    /// Rewrite the keystores a batch of changes affected. Every keystore is
    /// attempted; the first failure is returned.
    pub(crate) async fn apply_key_refresh(
        &self,
        refresh: KeyRefresh,
        before: &Groups,
        after: &Groups,
    ) -> Result<(), SafeError> {
        let KeyRefresh { mut groups, all } = refresh;
        if let Some(rotate) = all {
            let known = self.keystore_groups().await?;
            let current = after.iter().map(|(group, _)| group.clone());
            for group in known.into_iter().chain(current) {
                *groups.entry(group).or_insert(false) |= rotate;
            }
        }

        let mut first_error = None;
        for (group, rotate) in groups {
            let plan = Reseal {
                group: &group,
                before,
                after,
                rotate,
                share_history: None,
            };
            if let Err(e) = self.reseal(plan).await {
                tracing::error!("failed to refresh keystore of {}: {}", group, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn locked_reseal(
        &self,
        group: &GroupName,
        share_history: Option<&UserId>,
    ) -> Result<Keystore, SafeError> {
        let guard = self.lock(GROUPS_DIR, CHAIN_LOCK).await?;
        let result = async {
            let (_, chain) = self.sync_group_chain(true, true).await?;
            let plan = Reseal {
                group,
                before: &chain.groups,
                after: &chain.groups,
                rotate: false,
                share_history,
            };
            self.reseal(plan).await
        }
        .await;
        if let Err(e) = guard.release().await {
            tracing::warn!("failed to release chain lock of {}: {}", self.url, e);
        }
        result
    }

    /// Reseal a group's keys for its current recipients. Must run under the
    /// chain lock.
    ///
    /// A new epoch is appended when asked to, when the keystore is new, or
    /// when a recipient of the old keystore is gone. Recipients keep their
    /// `since_epoch`; new ones start at the latest epoch.
    async fn reseal(&self, plan: Reseal<'_>) -> Result<Keystore, SafeError> {
        let Reseal {
            group,
            before,
            after,
            rotate,
            share_history,
        } = plan;
        let recipients = recipients_of(group, after);

        let previous = self.read_keystore(group).await?;
        let mut keys = match &previous {
            Some(keystore) => {
                keystore.verify(group, before)?;
                keystore.open(&self.identity)?.0
            }
            None => Vec::new(),
        };

        let removed = previous
            .as_ref()
            .is_some_and(|keystore| keystore.recipients().any(|u| !recipients.contains(u)));
        if let Some(keystore) = &previous {
            let unchanged = keystore.recipients().cloned().collect::<BTreeSet<_>>() == recipients;
            if unchanged && !rotate && share_history.is_none() {
                return Ok(keystore.clone());
            }
        }

        if keys.is_empty() || rotate || removed {
            keys.push(Secret::generate());
            tracing::info!("keys of {} rotated to epoch {}", group, keys.len() - 1);
        }
        let latest = keys.len() as u32 - 1;

        let sealed_for = recipients.into_iter().map(|user| {
            let since_epoch = match (&previous, share_history) {
                (_, Some(shared)) if shared == &user => 0,
                (Some(keystore), _) => keystore.since_epoch(&user).unwrap_or(latest),
                (None, _) => 0,
            };
            (user, since_epoch)
        });
        let keystore = Keystore::seal(&self.identity, group, &keys, sealed_for)?;

        let data = bincode::serialize(&keystore)?;
        self.store.write(&keystore_path(group), Bytes::from(data)).await?;
        self.touch(&[&keys_dir(group)]).await?;
        self.keys.write().remove(group);
        Ok(keystore)
    }
}
