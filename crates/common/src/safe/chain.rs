//! Reading, merging and appending the group chain on the store.

use bytes::Bytes;
use object_store::Filter;

use super::error::SafeError;
use super::group::{
    self, ChainStatus, ChangeKind, ForkWinner, GroupChain, GroupChange, GroupName, Groups,
    BATCH_SIZE,
};
use super::keys::KeyRefresh;
use super::Safe;
use crate::crypto::UserId;

pub const GROUPS_DIR: &str = "groups";
/// Lock kind guarding chain appends and keystore writes
pub(crate) const CHAIN_LOCK: &str = "chain";

fn batch_path(batch: usize) -> String {
    format!("{}/{:010}", GROUPS_DIR, batch)
}

impl Safe {
    /// Current membership, after catching up with the store.
    pub async fn get_groups(&self) -> Result<Groups, SafeError> {
        let (_, chain) = self.sync_group_chain(false, false).await?;
        Ok(chain.groups)
    }

    /// Synchronize the chain and report how it related to the store.
    ///
    /// `force` ignores the touch marker.
    pub async fn sync_groups(&self, force: bool) -> Result<ChainStatus, SafeError> {
        let (status, _) = self.sync_group_chain(force, false).await?;
        Ok(status)
    }

    /// Merge the store's chain into ours. Only a caller holding the chain
    /// lock (`locked`) may push a winning local tail back to the store.
    pub(crate) async fn sync_group_chain(
        &self,
        force: bool,
        locked: bool,
    ) -> Result<(ChainStatus, GroupChain), SafeError> {
        let mut local = self.chain.lock().await;
        let check = self.check_touch(GROUPS_DIR).await?;
        if !force && !check.updated {
            return Ok((ChainStatus::Unchanged, local.clone()));
        }

        let from_batch = if rand::random_ratio(1, self.options.fork_check_one_in.max(1)) {
            0
        } else {
            local.tail_batch()
        };
        let remote = self.read_batches(from_batch).await?;
        let (merged, status) =
            group::reconcile(&local, remote, from_batch * BATCH_SIZE, &self.creator);

        let settled = match status {
            ChainStatus::Unchanged | ChainStatus::LocalAhead => true,
            ChainStatus::FastForwarded(count) => {
                tracing::debug!("group chain of {} fast-forwarded by {}", self.url, count);
                true
            }
            ChainStatus::AdoptedRemote { at } => {
                tracing::warn!("group chain of {} forked at {}, adopting remote tail", self.url, at);
                true
            }
            ChainStatus::KeptLocal { at } if locked => {
                tracing::warn!("group chain of {} forked at {}, pushing local tail", self.url, at);
                self.write_batches(&merged.changes, at / BATCH_SIZE).await?;
                self.touch(&[GROUPS_DIR]).await?;
                true
            }
            ChainStatus::KeptLocal { at } => {
                tracing::info!(
                    "group chain of {} forked at {}, local tail wins, leaving the store as is",
                    self.url,
                    at
                );
                false
            }
            ChainStatus::ForkUnresolved { at } => {
                tracing::warn!(
                    "group chain of {} forked at {} with equal endorsement, keeping local tail",
                    self.url,
                    at
                );
                false
            }
        };

        if merged != *local {
            self.cache.save_chain(&self.store_id, &merged).await?;
            *local = merged;
        }
        if settled {
            self.acknowledge(GROUPS_DIR, check).await?;
        }
        Ok((status, local.clone()))
    }

    /// Changes stored in batch `from` and every later batch.
    async fn read_batches(&self, from: usize) -> Result<Vec<GroupChange>, SafeError> {
        let mut batches: Vec<(usize, String)> = self
            .store
            .list(GROUPS_DIR, &Filter::files())
            .await?
            .into_iter()
            .filter_map(|entry| entry.name.parse().ok().map(|n| (n, entry.name)))
            .filter(|(n, _)| *n >= from)
            .collect();
        batches.sort();

        let mut changes = Vec::new();
        for (expected, (batch, name)) in (from..).zip(batches) {
            if batch != expected {
                tracing::warn!("group chain of {} is missing batch {}", self.url, expected);
                break;
            }
            let path = format!("{}/{}", GROUPS_DIR, name);
            let data = self.store.read(&path, None).await?;
            let batch: Vec<GroupChange> =
                bincode::deserialize(&data).map_err(|e| SafeError::corrupt(&path, e))?;
            changes.extend(batch);
        }
        Ok(changes)
    }

    /// Write every batch from `from` on, and drop batches past the end.
    async fn write_batches(&self, changes: &[GroupChange], from: usize) -> Result<(), SafeError> {
        for (batch, chunk) in changes.chunks(BATCH_SIZE).enumerate().skip(from) {
            let data = bincode::serialize(chunk)?;
            self.store.write(&batch_path(batch), Bytes::from(data)).await?;
        }

        let last = changes.len().saturating_sub(1) / BATCH_SIZE;
        for entry in self.store.list(GROUPS_DIR, &Filter::files()).await? {
            if let Ok(batch) = entry.name.parse::<usize>() {
                if batch > last {
                    tracing::debug!("dropping stale batch {} of {}", batch, self.url);
                    self.store.delete(&batch_path(batch)).await?;
                }
            }
        }
        Ok(())
    }

    /// Apply `kind` to each of `users` in `group` and publish the changes.
    ///
    /// Grants of existing members and revokes of non-members are skipped.
    /// Nothing is written when the caller is not allowed to make any of the
    /// changes. Keystores of affected groups are rewritten afterwards, with
    /// a new epoch on revoke and curse.
    pub async fn update_group(
        &self,
        group: &GroupName,
        kind: ChangeKind,
        users: &[UserId],
    ) -> Result<Groups, SafeError> {
        let guard = self.lock(GROUPS_DIR, CHAIN_LOCK).await?;
        let result = self.update_group_locked(group, kind, users).await;
        if let Err(e) = guard.release().await {
            tracing::warn!("failed to release chain lock of {}: {}", self.url, e);
        }
        result
    }

    async fn update_group_locked(
        &self,
        group: &GroupName,
        kind: ChangeKind,
        users: &[UserId],
    ) -> Result<Groups, SafeError> {
        let (status, before) = self.sync_group_chain(true, true).await?;
        let mut next = before.clone();
        let first_new = next.changes.len();
        let mut refresh = KeyRefresh::default();

        for user in users {
            let noop = match kind {
                ChangeKind::Grant => next.groups.contains(group, user),
                ChangeKind::Revoke => !next.groups.contains(group, user),
                ChangeKind::Curse => next.groups.groups_of(user).is_empty(),
                ChangeKind::Endorse => false,
            };
            if noop {
                tracing::debug!("skipping no-op {:?} of {} in {}", kind, user, group);
                continue;
            }

            let change =
                GroupChange::sign(&self.identity, next.last_signature(), group, user, kind);
            let member_of = next.groups.groups_of(user);
            next.groups.apply(&change, &self.creator)?;
            next.changes.push(change);
            refresh.note(group, kind, &member_of);
        }

        let added = next.changes.len() - first_new;
        if added == 0 {
            return Ok(next.groups);
        }

        // A tied fork is only overwritten once our tail outscores the stored one
        let mut write_from = first_new;
        if let ChainStatus::ForkUnresolved { at } = status {
            let from_batch = at / BATCH_SIZE;
            let remote = self.read_batches(from_batch).await?;
            let remote_tail = remote
                .get(at - from_batch * BATCH_SIZE..)
                .unwrap_or_default();
            if group::resolve_fork(&next.changes[at..], remote_tail) != ForkWinner::Local {
                tracing::warn!(
                    "not writing {:?} on {} to {}: chain forked at {} and ours does not win",
                    kind,
                    group,
                    self.url,
                    at
                );
                return Err(SafeError::ForkUnresolved { at });
            }
            tracing::warn!("group chain of {} forked at {}, new changes break the tie", self.url, at);
            write_from = at;
        }

        self.write_batches(&next.changes, write_from / BATCH_SIZE).await?;
        self.touch(&[GROUPS_DIR]).await?;
        tracing::info!("appended {} {:?} changes on {} to {}", added, kind, group, self.url);
        {
            let mut local = self.chain.lock().await;
            self.cache.save_chain(&self.store_id, &next).await?;
            *local = next.clone();
        }

        self.apply_key_refresh(refresh, &before.groups, &next.groups).await?;
        Ok(next.groups)
    }
}
