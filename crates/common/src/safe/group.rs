//! Group membership as a fold over a signature-chained log.
//!
//! Everything in this module is pure: it validates, folds and compares
//! [`GroupChange`] sequences. Reading and writing batches lives in
//! [`super::chain`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::error::SafeError;
use crate::crypto::{digest, Identity, Signature, UserId};

/// Administrators: the only users allowed to sign changes and write keystores
pub const ADMIN: &str = "adm";
/// Default member group
pub const USERS: &str = "usr";
/// Changes per immutable batch blob
pub const BATCH_SIZE: usize = 1024;

/// Name of a group. Restricted to characters that are safe in a store path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GroupName(String);

impl GroupName {
    pub fn new(name: &str) -> Result<Self, SafeError> {
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(SafeError::corrupt(name, "invalid group name"));
        }
        Ok(Self(name.to_string()))
    }

    pub fn admin() -> Self {
        Self(ADMIN.to_string())
    }

    pub fn users() -> Self {
        Self(USERS.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for GroupName {
    type Err = SafeError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for GroupName {
    type Error = SafeError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(&s)
    }
}

impl From<GroupName> for String {
    fn from(name: GroupName) -> Self {
        name.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Grant,
    Revoke,
    /// Removes the user from every group
    Curse,
    /// Marks the chain as endorsed; resets the endorsement score
    Endorse,
}

impl ChangeKind {
    fn tag(self) -> u8 {
        match self {
            ChangeKind::Grant => 0,
            ChangeKind::Revoke => 1,
            ChangeKind::Curse => 2,
            ChangeKind::Endorse => 3,
        }
    }
}

/// One signed entry of the group chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupChange {
    pub group_name: GroupName,
    pub user_id: UserId,
    pub kind: ChangeKind,
    /// Microseconds since the Unix epoch, as claimed by the signer
    pub timestamp: i64,
    pub signer: UserId,
    pub signature: Signature,
}

impl GroupChange {
    fn payload(
        prev: Option<&Signature>,
        group_name: &GroupName,
        user_id: &UserId,
        kind: ChangeKind,
        timestamp: i64,
        signer: &UserId,
    ) -> [u8; 32] {
        let prev = prev.map(|s| s.to_bytes()).unwrap_or([0; 64]);
        digest(&[
            &prev,
            group_name.as_str().as_bytes(),
            user_id.as_str().as_bytes(),
            &[kind.tag()],
            &timestamp.to_le_bytes(),
            signer.as_str().as_bytes(),
        ])
    }

    /// Build a change linked to `prev`, the signature of the entry before it.
    pub fn sign(
        identity: &Identity,
        prev: Option<&Signature>,
        group_name: &GroupName,
        user_id: &UserId,
        kind: ChangeKind,
    ) -> Self {
        let timestamp = Utc::now().timestamp_micros();
        let payload = Self::payload(prev, group_name, user_id, kind, timestamp, identity.id());
        Self {
            group_name: group_name.clone(),
            user_id: user_id.clone(),
            kind,
            timestamp,
            signer: identity.id().clone(),
            signature: identity.sign(&payload),
        }
    }

    /// Check the signature against the signer's key and the chain link.
    pub fn verify(&self, prev: Option<&Signature>) -> Result<(), SafeError> {
        let payload = Self::payload(
            prev,
            &self.group_name,
            &self.user_id,
            self.kind,
            self.timestamp,
            &self.signer,
        );
        self.signer
            .public_key()?
            .verify(&payload, &self.signature)
            .map_err(|e| {
                SafeError::SignatureInvalid(format!(
                    "{:?} of {} in {} by {}: {}",
                    self.kind, self.user_id, self.group_name, self.signer, e
                ))
            })
    }
}

/// Materialized membership: group name to members. Empty groups are dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Groups(BTreeMap<GroupName, BTreeSet<UserId>>);

impl Groups {
    pub fn contains(&self, group: &GroupName, user: &UserId) -> bool {
        self.0.get(group).is_some_and(|members| members.contains(user))
    }

    pub fn is_admin(&self, user: &UserId) -> bool {
        self.contains(&GroupName::admin(), user)
    }

    pub fn members(&self, group: &GroupName) -> impl Iterator<Item = &UserId> {
        self.0.get(group).into_iter().flatten()
    }

    /// Groups `user` currently belongs to.
    pub fn groups_of(&self, user: &UserId) -> Vec<GroupName> {
        self.0
            .iter()
            .filter(|(_, members)| members.contains(user))
            .map(|(group, _)| group.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&GroupName, &BTreeSet<UserId>)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Signers must be admins, except the creator while no admin exists yet.
    pub fn authorize(&self, signer: &UserId, creator: &UserId) -> Result<(), SafeError> {
        let admins_exist = self.members(&GroupName::admin()).next().is_some();
        if self.is_admin(signer) || (!admins_exist && signer == creator) {
            return Ok(());
        }
        Err(SafeError::Authorization(format!(
            "{} is not a member of {}",
            signer, ADMIN
        )))
    }

    /// Authorize and apply one change. Signatures are checked by the caller.
    pub fn apply(&mut self, change: &GroupChange, creator: &UserId) -> Result<(), SafeError> {
        self.authorize(&change.signer, creator)?;
        match change.kind {
            ChangeKind::Grant => {
                self.0
                    .entry(change.group_name.clone())
                    .or_default()
                    .insert(change.user_id.clone());
            }
            ChangeKind::Revoke => self.remove(&change.group_name, &change.user_id),
            ChangeKind::Curse => {
                for group in self.groups_of(&change.user_id) {
                    self.remove(&group, &change.user_id);
                }
            }
            ChangeKind::Endorse => {}
        }
        Ok(())
    }

    fn remove(&mut self, group: &GroupName, user: &UserId) {
        if let Some(members) = self.0.get_mut(group) {
            members.remove(user);
            if members.is_empty() {
                self.0.remove(group);
            }
        }
    }
}

impl<const N: usize> From<[(&str, &[&UserId]); N]> for Groups {
    fn from(entries: [(&str, &[&UserId]); N]) -> Self {
        let mut groups = BTreeMap::new();
        for (name, members) in entries {
            let members: BTreeSet<UserId> = members.iter().map(|&u| u.clone()).collect();
            if !members.is_empty() {
                groups.insert(GroupName(name.to_string()), members);
            }
        }
        Self(groups)
    }
}

/// A peer's copy of the log together with its fold.
///
/// Rejected changes stay in `changes` so positions line up with the store,
/// but leave no trace in `groups`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupChain {
    pub changes: Vec<GroupChange>,
    pub groups: Groups,
}

impl GroupChain {
    /// Replay `changes` from an empty membership.
    pub fn fold(changes: Vec<GroupChange>, creator: &UserId) -> Self {
        let mut chain = Self::default();
        chain.extend(changes, creator);
        chain
    }

    /// Append changes, folding in the ones that verify against the chain link
    /// and the signer's admin standing at that point.
    pub fn extend(&mut self, changes: impl IntoIterator<Item = GroupChange>, creator: &UserId) {
        for change in changes {
            let prev = self.changes.last().map(|c| &c.signature);
            let admitted = change
                .verify(prev)
                .and_then(|_| self.groups.apply(&change, creator));
            if let Err(e) = admitted {
                tracing::warn!("dropping group change at {}: {}", self.changes.len(), e);
            }
            self.changes.push(change);
        }
    }

    pub fn last_signature(&self) -> Option<&Signature> {
        self.changes.last().map(|c| &c.signature)
    }

    /// Batch holding the tail of the chain, where a resync starts reading.
    pub fn tail_batch(&self) -> usize {
        self.changes.len() / BATCH_SIZE
    }
}

/// How a freshly read remote segment relates to the local chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Divergence {
    Identical,
    /// Local is a prefix of remote; remote changes from this position are new
    FastForward { from: usize },
    /// Remote is a prefix of local
    LocalAhead,
    /// First position where the two disagree
    Forked { at: usize },
}

/// Compare `local` with `remote`, a remote read that starts at position `offset`.
pub fn compare(local: &[GroupChange], remote: &[GroupChange], offset: usize) -> Divergence {
    let offset = offset.min(local.len());
    let local_tail = &local[offset..];
    let common = local_tail.len().min(remote.len());

    if let Some(i) = (0..common).find(|&i| local_tail[i] != remote[i]) {
        return Divergence::Forked { at: offset + i };
    }
    match local_tail.len().cmp(&remote.len()) {
        std::cmp::Ordering::Equal => Divergence::Identical,
        std::cmp::Ordering::Less => Divergence::FastForward {
            from: offset + local_tail.len(),
        },
        std::cmp::Ordering::Greater => Divergence::LocalAhead,
    }
}

/// Grants and revokes since the last endorsement.
pub fn endorsement_score(tail: &[GroupChange]) -> usize {
    tail.iter().fold(0, |score, change| match change.kind {
        ChangeKind::Grant | ChangeKind::Revoke => score + 1,
        ChangeKind::Endorse => 0,
        ChangeKind::Curse => score,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkWinner {
    Local,
    Remote,
    /// Equal scores. Nothing converges until a later change breaks the tie.
    Tie,
}

/// Pick the tail with the strictly higher endorsement score.
pub fn resolve_fork(local_tail: &[GroupChange], remote_tail: &[GroupChange]) -> ForkWinner {
    let local = endorsement_score(local_tail);
    let remote = endorsement_score(remote_tail);
    match local.cmp(&remote) {
        std::cmp::Ordering::Greater => ForkWinner::Local,
        std::cmp::Ordering::Less => ForkWinner::Remote,
        std::cmp::Ordering::Equal => ForkWinner::Tie,
    }
}

/// Outcome of synchronizing the chain with the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStatus {
    /// Nothing new, or the touch marker said so
    Unchanged,
    /// This many remote changes were appended
    FastForwarded(usize),
    LocalAhead,
    /// The remote tail won the fork at this position
    AdoptedRemote { at: usize },
    /// The local tail won the fork at this position
    KeptLocal { at: usize },
    /// Equal endorsement scores; try again after more changes
    ForkUnresolved { at: usize },
}

/// Merge a remote read starting at `offset` into `local`.
pub fn reconcile(
    local: &GroupChain,
    remote: Vec<GroupChange>,
    offset: usize,
    creator: &UserId,
) -> (GroupChain, ChainStatus) {
    match compare(&local.changes, &remote, offset) {
        Divergence::Identical => (local.clone(), ChainStatus::Unchanged),
        Divergence::LocalAhead => (local.clone(), ChainStatus::LocalAhead),
        Divergence::FastForward { from } => {
            let skip = from - offset.min(local.changes.len());
            let fresh: Vec<_> = remote.into_iter().skip(skip).collect();
            let count = fresh.len();
            let mut chain = local.clone();
            chain.extend(fresh, creator);
            (chain, ChainStatus::FastForwarded(count))
        }
        Divergence::Forked { at } => {
            let split = at - offset.min(local.changes.len());
            let local_tail = &local.changes[at..];
            let remote_tail = &remote[split..];
            match resolve_fork(local_tail, remote_tail) {
                ForkWinner::Remote => {
                    let mut changes = local.changes[..at].to_vec();
                    changes.extend_from_slice(remote_tail);
                    (
                        GroupChain::fold(changes, creator),
                        ChainStatus::AdoptedRemote { at },
                    )
                }
                ForkWinner::Local => (local.clone(), ChainStatus::KeptLocal { at }),
                ForkWinner::Tie => (local.clone(), ChainStatus::ForkUnresolved { at }),
            }
        }
    }
}
