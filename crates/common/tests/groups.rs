//! Integration tests for the group chain on a shared store

mod common;

use std::sync::Arc;

use ::common::prelude::*;
use ::common::safe::{GroupChange, GROUPS_DIR};
use bytes::Bytes;
use object_store::BlobStore;

const BATCH_0: &str = "groups/0000000000";

async fn stored_chain(store: &Arc<dyn BlobStore>) -> Vec<GroupChange> {
    let data = store.read(BATCH_0, None).await.unwrap();
    bincode::deserialize(&data).unwrap()
}

/// Replace the stored chain with `changes`, as a concurrent writer would.
async fn overwrite_chain(safe: &Safe, changes: &[GroupChange]) {
    let data = bincode::serialize(changes).unwrap();
    safe.store().write(BATCH_0, Bytes::from(data)).await.unwrap();
    safe.touch(&[GROUPS_DIR]).await.unwrap();
}

fn extend(
    signer: &Identity,
    chain: &mut Vec<GroupChange>,
    group: &GroupName,
    user: &UserId,
    kind: ChangeKind,
) {
    let change = GroupChange::sign(signer, chain.last().map(|c| &c.signature), group, user, kind);
    chain.push(change);
}

#[tokio::test]
async fn test_create_and_join() {
    let store = common::store();
    let alice = common::identity("alice");
    let bob = common::identity("bob");
    let safe = common::create(&store, &alice).await;

    let groups = safe.get_groups().await.unwrap();
    assert!(groups.is_admin(alice.id()));
    assert!(groups.contains(&GroupName::users(), alice.id()));
    assert_eq!(stored_chain(&store).await.len(), 2);

    safe.update_group(&GroupName::users(), ChangeKind::Grant, &[bob.id().clone()])
        .await
        .unwrap();

    let peer = common::join(&store, &bob, safe.url()).await;
    let seen = peer.get_groups().await.unwrap();
    assert!(seen.contains(&GroupName::users(), bob.id()));
    assert!(!seen.is_admin(bob.id()));
    assert_eq!(seen, safe.get_groups().await.unwrap());
}

#[tokio::test]
async fn test_create_requires_creator() {
    let store = common::store();
    let alice = common::identity("alice");
    let mallory = common::identity("mallory");

    let cache = Cache::in_memory().await.unwrap();
    let result = Safe::create(
        store,
        cache,
        mallory,
        &common::url_of(&alice),
        common::options(),
    )
    .await;
    assert!(matches!(result, Err(SafeError::Authorization(_))));
}

#[tokio::test]
async fn test_non_admin_cannot_change_groups() {
    let store = common::store();
    let alice = common::identity("alice");
    let bob = common::identity("bob");
    let carol = common::identity("carol");
    let safe = common::create(&store, &alice).await;
    safe.update_group(&GroupName::users(), ChangeKind::Grant, &[bob.id().clone()])
        .await
        .unwrap();

    let peer = common::join(&store, &bob, safe.url()).await;
    let result = peer
        .update_group(&GroupName::users(), ChangeKind::Grant, &[carol.id().clone()])
        .await;
    assert!(matches!(result, Err(SafeError::Authorization(_))));

    // Nothing reached the store
    assert_eq!(stored_chain(&store).await.len(), 3);
    assert_eq!(safe.sync_groups(true).await.unwrap(), ChainStatus::Unchanged);
    assert!(!safe
        .get_groups()
        .await
        .unwrap()
        .contains(&GroupName::users(), carol.id()));
}

#[tokio::test]
async fn test_noop_changes_are_skipped() {
    let store = common::store();
    let alice = common::identity("alice");
    let bob = common::identity("bob");
    let safe = common::create(&store, &alice).await;

    safe.update_group(&GroupName::users(), ChangeKind::Grant, &[alice.id().clone()])
        .await
        .unwrap();
    safe.update_group(&GroupName::users(), ChangeKind::Revoke, &[bob.id().clone()])
        .await
        .unwrap();
    assert_eq!(stored_chain(&store).await.len(), 2);
}

#[tokio::test]
async fn test_revoke_and_curse() {
    let store = common::store();
    let alice = common::identity("alice");
    let bob = common::identity("bob");
    let safe = common::create(&store, &alice).await;
    let team = GroupName::new("team").unwrap();

    safe.update_group(&GroupName::users(), ChangeKind::Grant, &[bob.id().clone()])
        .await
        .unwrap();
    safe.update_group(&team, ChangeKind::Grant, &[bob.id().clone()])
        .await
        .unwrap();

    let groups = safe
        .update_group(&team, ChangeKind::Revoke, &[bob.id().clone()])
        .await
        .unwrap();
    assert!(!groups.contains(&team, bob.id()));
    assert!(groups.members(&team).next().is_none());
    assert!(groups.contains(&GroupName::users(), bob.id()));

    safe.update_group(&team, ChangeKind::Grant, &[bob.id().clone()])
        .await
        .unwrap();
    let groups = safe
        .update_group(&GroupName::users(), ChangeKind::Curse, &[bob.id().clone()])
        .await
        .unwrap();
    assert!(groups.groups_of(bob.id()).is_empty());

    // A fresh peer folds the same membership from the store
    let peer = common::join(&store, &alice, safe.url()).await;
    assert_eq!(peer.get_groups().await.unwrap(), groups);
}

#[tokio::test]
async fn test_touch_markers() {
    let store = common::store();
    let alice = common::identity("alice");
    let bob = common::identity("bob");
    let safe = common::create(&store, &alice).await;
    safe.update_group(&GroupName::users(), ChangeKind::Grant, &[bob.id().clone()])
        .await
        .unwrap();

    let peer = common::join(&store, &bob, safe.url()).await;
    assert!(peer.is_updated(&[GROUPS_DIR]).await.unwrap());
    peer.get_groups().await.unwrap();
    assert!(!peer.is_updated(&[GROUPS_DIR]).await.unwrap());
    assert_eq!(peer.sync_groups(false).await.unwrap(), ChainStatus::Unchanged);

    let team = GroupName::new("team").unwrap();
    safe.update_group(&team, ChangeKind::Grant, &[bob.id().clone()])
        .await
        .unwrap();
    assert!(peer.is_updated(&[GROUPS_DIR]).await.unwrap());
    assert_eq!(
        peer.sync_groups(false).await.unwrap(),
        ChainStatus::FastForwarded(1)
    );
    assert!(!peer.is_updated(&[GROUPS_DIR]).await.unwrap());

    // Markers for any directory, including ones never written
    assert!(peer.is_updated(&["db/team"]).await.unwrap());
    safe.touch(&["db/team"]).await.unwrap();
    assert!(peer.is_updated(&[GROUPS_DIR, "db/team"]).await.unwrap());
}

#[tokio::test]
async fn test_fork_adopts_better_endorsed_remote() {
    let store = common::store();
    let alice = common::identity("alice");
    let bob = common::identity("bob");
    let carol = common::identity("carol");
    let dave = common::identity("dave");
    let safe = common::create(&store, &alice).await;
    let usr = GroupName::users();
    let team = GroupName::new("team").unwrap();

    safe.update_group(&usr, ChangeKind::Grant, &[carol.id().clone()])
        .await
        .unwrap();
    let peer = common::join(&store, &bob, safe.url()).await;
    let local = peer.get_groups().await.unwrap();
    assert!(local.contains(&usr, carol.id()));

    // A competing writer replaced the third change with two of their own
    let mut remote = stored_chain(&store).await;
    remote.truncate(2);
    extend(&alice, &mut remote, &usr, dave.id(), ChangeKind::Grant);
    extend(&alice, &mut remote, &team, dave.id(), ChangeKind::Grant);
    overwrite_chain(&safe, &remote).await;

    assert_eq!(
        peer.sync_groups(false).await.unwrap(),
        ChainStatus::AdoptedRemote { at: 2 }
    );
    let groups = peer.get_groups().await.unwrap();
    assert!(groups.contains(&usr, dave.id()));
    assert!(groups.contains(&team, dave.id()));
    assert!(!groups.contains(&usr, carol.id()));
}

#[tokio::test]
async fn test_fork_with_equal_endorsement_stays_unresolved() {
    let store = common::store();
    let alice = common::identity("alice");
    let carol = common::identity("carol");
    let erin = common::identity("erin");
    let safe = common::create(&store, &alice).await;
    let usr = GroupName::users();

    safe.update_group(&usr, ChangeKind::Grant, &[carol.id().clone()])
        .await
        .unwrap();

    let mut remote = stored_chain(&store).await;
    remote.truncate(2);
    extend(&alice, &mut remote, &usr, erin.id(), ChangeKind::Grant);
    overwrite_chain(&safe, &remote).await;

    assert_eq!(
        safe.sync_groups(false).await.unwrap(),
        ChainStatus::ForkUnresolved { at: 2 }
    );
    let groups = safe.get_groups().await.unwrap();
    assert!(groups.contains(&usr, carol.id()));
    assert!(!groups.contains(&usr, erin.id()));

    // Not acknowledged, so the next sync looks again
    assert!(safe.is_updated(&[GROUPS_DIR]).await.unwrap());
}

#[tokio::test]
async fn test_tied_fork_is_only_overwritten_by_a_better_tail() {
    let store = common::store();
    let alice = common::identity("alice");
    let carol = common::identity("carol");
    let dave = common::identity("dave");
    let erin = common::identity("erin");
    let safe = common::create(&store, &alice).await;
    let usr = GroupName::users();

    safe.update_group(&usr, ChangeKind::Grant, &[carol.id().clone()])
        .await
        .unwrap();
    let mut remote = stored_chain(&store).await;
    remote.truncate(2);
    extend(&alice, &mut remote, &usr, erin.id(), ChangeKind::Grant);
    overwrite_chain(&safe, &remote).await;

    // Endorsing resets our tail to 0 against the stored 1: refused, store intact
    let result = safe
        .update_group(&usr, ChangeKind::Endorse, &[alice.id().clone()])
        .await;
    assert!(matches!(result, Err(SafeError::ForkUnresolved { at: 2 })));
    assert_eq!(stored_chain(&store).await, remote);
    assert!(!safe
        .get_groups()
        .await
        .unwrap()
        .contains(&usr, dave.id()));

    // Another grant makes our tail score 2 against 1, so it replaces the stored one
    safe.update_group(&usr, ChangeKind::Grant, &[dave.id().clone()])
        .await
        .unwrap();
    let stored = stored_chain(&store).await;
    assert_eq!(stored.len(), 4);
    assert_eq!(stored[2].user_id, *carol.id());
    assert_eq!(stored[3].user_id, *dave.id());

    let peer = common::join(&store, &erin, safe.url()).await;
    let groups = peer.get_groups().await.unwrap();
    assert!(groups.contains(&usr, dave.id()));
    assert!(!groups.contains(&usr, erin.id()));
}

#[tokio::test]
async fn test_winning_local_tail_is_pushed_under_lock() {
    let store = common::store();
    let alice = common::identity("alice");
    let carol = common::identity("carol");
    let dave = common::identity("dave");
    let safe = common::create(&store, &alice).await;
    let usr = GroupName::users();

    safe.update_group(&usr, ChangeKind::Grant, &[carol.id().clone()])
        .await
        .unwrap();
    let ours = stored_chain(&store).await;

    // The competing tail only endorses, so it scores lower
    let mut remote = ours.clone();
    remote.truncate(2);
    extend(&alice, &mut remote, &usr, alice.id(), ChangeKind::Endorse);
    overwrite_chain(&safe, &remote).await;

    assert_eq!(
        safe.sync_groups(false).await.unwrap(),
        ChainStatus::KeptLocal { at: 2 }
    );
    // A plain sync leaves the store alone
    assert_eq!(stored_chain(&store).await, remote);

    // The next locked write restores our tail before appending
    safe.update_group(&usr, ChangeKind::Grant, &[dave.id().clone()])
        .await
        .unwrap();
    let stored = stored_chain(&store).await;
    assert_eq!(stored.len(), 4);
    assert_eq!(&stored[..3], &ours[..]);
    assert_eq!(stored[3].user_id, *dave.id());
}
