// tests/integration/detector_test.rs

use super::test_helpers::{address, form_cluster, wait_until};
use gridmerge::core::cluster::{
    ClusterIdentity, InMemoryNetwork, Member, MembershipManager, MembershipView,
    ReconnectOutcome, SplitBrainDetector,
};
use gridmerge::core::events::EventBus;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

const GRACE: Duration = Duration::from_secs(10);

/// A manager for `members[local_index]` whose view holds all `members` in order.
fn manager_with(members: &[Member], local_index: usize) -> Arc<MembershipManager> {
    let cluster_id = ClusterIdentity::generate();
    let local = members[local_index].clone();
    let manager = MembershipManager::new(local, cluster_id, Arc::new(EventBus::new()));
    let mut view = MembershipView::initial(members[0].clone());
    for member in &members[1..] {
        view = view.with_members_added(std::slice::from_ref(member)).unwrap();
    }
    manager.adopt(cluster_id, view).unwrap();
    Arc::new(manager)
}

fn members(n: u16) -> Vec<Member> {
    (0..n)
        .map(|i| Member::new(Uuid::new_v4(), address(5901 + i)))
        .collect()
}

#[tokio::test]
async fn test_repeated_unreachable_signals_are_idempotent() {
    let members = members(3);
    let manager = manager_with(&members, 0);
    let detector = SplitBrainDetector::new(manager.clone(), GRACE);
    let target = &members[2];
    let t0 = Instant::now();

    assert!(detector.on_member_unreachable(target.address(), &target.uuid(), t0));
    assert!(!detector.on_member_unreachable(target.address(), &target.uuid(), t0 + GRACE / 2));

    assert!(manager.is_missing_member(target.address(), &target.uuid()));
    assert_eq!(manager.missing_count(), 1);
    // The first detection time is kept.
    assert_eq!(manager.missing_members()[0].detected_at, t0);
}

#[tokio::test]
async fn test_unknown_or_local_members_are_not_marked_missing() {
    let members = members(2);
    let manager = manager_with(&members, 0);
    let detector = SplitBrainDetector::new(manager.clone(), GRACE);
    let now = Instant::now();

    assert!(!detector.on_member_unreachable(&address(5999), &Uuid::new_v4(), now));
    assert!(!detector.on_member_unreachable(members[0].address(), &members[0].uuid(), now));
    // Address and UUID must belong to the same member.
    assert!(!detector.on_member_unreachable(members[0].address(), &members[1].uuid(), now));
    assert_eq!(manager.missing_count(), 0);
}

#[tokio::test]
async fn test_reconnect_with_same_identity_is_a_blip() {
    let members = members(2);
    let manager = manager_with(&members, 0);
    let detector = SplitBrainDetector::new(manager.clone(), GRACE);
    let target = &members[1];
    let now = Instant::now();

    detector.on_member_unreachable(target.address(), &target.uuid(), now);
    let outcome = detector.on_member_reconnected(
        target.address(),
        &target.uuid(),
        manager.cluster_id(),
        manager.current().as_ref().clone(),
    );

    assert!(matches!(outcome, ReconnectOutcome::Recovered));
    assert!(!manager.is_missing_member(target.address(), &target.uuid()));
    // Nothing is removed later.
    let removed = detector.expire_missing(now + GRACE * 2).unwrap();
    assert!(removed.is_empty());
    assert_eq!(manager.current().size(), 2);
}

#[tokio::test]
async fn test_reconnect_without_pending_record_is_ignored() {
    let members = members(2);
    let manager = manager_with(&members, 0);
    let detector = SplitBrainDetector::new(manager.clone(), GRACE);

    let outcome = detector.on_member_reconnected(
        members[1].address(),
        &members[1].uuid(),
        manager.cluster_id(),
        manager.current().as_ref().clone(),
    );
    assert!(matches!(outcome, ReconnectOutcome::Ignored));
}

#[tokio::test]
async fn test_reconnect_with_other_identity_signals_split_brain() {
    let members = members(3);
    let manager = manager_with(&members[..2], 0);
    let detector = SplitBrainDetector::new(manager.clone(), GRACE);
    let stranger = &members[2];
    let remote_id = ClusterIdentity::generate();
    let remote_view = MembershipView::initial(stranger.clone());

    let outcome = detector.on_member_reconnected(
        stranger.address(),
        &stranger.uuid(),
        remote_id,
        remote_view.clone(),
    );

    let ReconnectOutcome::SplitBrain(detected) = outcome else {
        panic!("expected a split brain, got {outcome:?}");
    };
    assert_eq!(detected.local_cluster_id, manager.cluster_id());
    assert_eq!(detected.remote_cluster_id, remote_id);
    assert_eq!(*detected.remote_view, remote_view);
    assert_eq!(detected.local_view.size(), 2);
    assert_eq!(detected.remote_address, *stranger.address());
    assert!(detected.pair().involves(remote_id));
}

#[tokio::test]
async fn test_remote_view_listing_local_member_is_not_a_split() {
    let members = members(2);
    let manager = manager_with(&members, 0);
    let detector = SplitBrainDetector::new(manager.clone(), GRACE);

    let outcome = detector.on_member_reconnected(
        members[1].address(),
        &members[1].uuid(),
        ClusterIdentity::generate(),
        manager.current().as_ref().clone(),
    );
    assert!(matches!(outcome, ReconnectOutcome::Ignored));
}

#[tokio::test]
async fn test_sub_cluster_of_same_identity_is_decided_after_removal() {
    let members = members(3);
    let manager = manager_with(&members, 0);
    let detector = SplitBrainDetector::new(manager.clone(), GRACE);
    let cluster_id = manager.cluster_id();
    let target = &members[2];
    // The other side of a partition already removed the local member.
    let remote_view = MembershipView::initial(members[1].clone())
        .with_members_added(std::slice::from_ref(target))
        .unwrap();

    let outcome = detector.on_member_reconnected(
        target.address(),
        &target.uuid(),
        cluster_id,
        remote_view.clone(),
    );
    assert!(matches!(outcome, ReconnectOutcome::Deferred), "got {outcome:?}");
    assert!(manager.is_missing_member(target.address(), &target.uuid()));
    assert!(detector.take_ready().is_empty());

    let removed = detector.expire_missing(Instant::now() + GRACE).unwrap();
    assert_eq!(removed.len(), 1);
    let ready = detector.take_ready();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].uuid, target.uuid());
    assert!(detector.take_ready().is_empty());

    let outcome = detector.on_member_reconnected(
        &ready[0].address,
        &ready[0].uuid,
        ready[0].cluster_id,
        ready[0].view.clone(),
    );
    let ReconnectOutcome::SplitBrain(detected) = outcome else {
        panic!("expected a split brain, got {outcome:?}");
    };
    assert_eq!(detected.local_cluster_id, cluster_id);
    assert_eq!(detected.remote_cluster_id, cluster_id);
    assert_eq!(*detected.remote_view, remote_view);
    assert!(detected.pair().involves(cluster_id));
}

#[tokio::test]
async fn test_deferred_reconnect_is_dropped_when_member_lists_agree_again() {
    let members = members(2);
    let manager = manager_with(&members, 0);
    let detector = SplitBrainDetector::new(manager.clone(), GRACE);
    let target = &members[1];

    let outcome = detector.on_member_reconnected(
        target.address(),
        &target.uuid(),
        manager.cluster_id(),
        MembershipView::initial(target.clone()),
    );
    assert!(matches!(outcome, ReconnectOutcome::Deferred));

    let outcome = detector.on_member_reconnected(
        target.address(),
        &target.uuid(),
        manager.cluster_id(),
        manager.current().as_ref().clone(),
    );
    assert!(matches!(outcome, ReconnectOutcome::Recovered));
    assert!(!manager.is_missing_member(target.address(), &target.uuid()));

    detector.expire_missing(Instant::now() + GRACE).unwrap();
    assert!(manager.current().contains(&target.uuid()));
    assert!(detector.take_ready().is_empty());
}

#[tokio::test]
async fn test_missing_member_removed_only_after_grace_period() {
    let members = members(3);
    let manager = manager_with(&members, 0);
    let detector = SplitBrainDetector::new(manager.clone(), GRACE);
    let target = &members[2];
    let t0 = Instant::now();
    detector.on_member_unreachable(target.address(), &target.uuid(), t0);

    let removed = detector
        .expire_missing(t0 + GRACE - Duration::from_millis(1))
        .unwrap();
    assert!(removed.is_empty());
    assert_eq!(manager.member_list_version(), 3);

    let removed = detector.expire_missing(t0 + GRACE).unwrap();
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].uuid(), target.uuid());
    assert_eq!(manager.member_list_version(), 4);
    assert!(!manager.current().contains(&target.uuid()));
    assert!(!manager.is_missing_member(target.address(), &target.uuid()));
}

#[tokio::test]
async fn test_only_future_master_publishes_removal() {
    let members = members(3);
    let t0 = Instant::now();

    // Member 2 is not master before or after member 1 leaves.
    let follower = manager_with(&members, 2);
    let detector = SplitBrainDetector::new(follower.clone(), GRACE);
    detector.on_member_unreachable(members[1].address(), &members[1].uuid(), t0);
    assert!(detector.expire_missing(t0 + GRACE).unwrap().is_empty());
    assert_eq!(follower.current().size(), 3);
    assert!(follower.is_missing_member(members[1].address(), &members[1].uuid()));

    // Member 1 takes over when the master goes missing.
    let successor = manager_with(&members, 1);
    let detector = SplitBrainDetector::new(successor.clone(), GRACE);
    detector.on_member_unreachable(members[0].address(), &members[0].uuid(), t0);
    let removed = detector.expire_missing(t0 + GRACE).unwrap();
    assert_eq!(removed.len(), 1);
    assert!(successor.is_master());
}

#[tokio::test(start_paused = true)]
async fn test_service_removes_missing_member_after_grace_period() {
    let network = InMemoryNetwork::new();
    let nodes = form_cluster(&network, &[5951, 5952, 5953], "PutIfAbsent", 100).await;
    let grace = super::test_helpers::test_cluster_config().missing_member_grace_period;

    nodes[0].unreachable(&nodes[2]).await;
    wait_until("the master records the missing member", || {
        nodes[0]
            .handle
            .membership()
            .is_missing_member(&nodes[2].address, &nodes[2].uuid)
    })
    .await;
    assert!(!nodes[0].handle.status().cluster_safe);

    tokio::time::advance(grace - Duration::from_secs(1)).await;
    tokio::task::yield_now().await;
    assert_eq!(nodes[0].member_count(), 3);

    tokio::time::advance(Duration::from_secs(2)).await;
    wait_until("the master removes the missing member", || {
        nodes[0].member_count() == 2
    })
    .await;
    wait_until("the remaining member installs the new list", || {
        nodes[1].member_count() == 2
    })
    .await;
    assert!(nodes[0].handle.status().cluster_safe);
    assert_eq!(nodes[1].view().version(), nodes[0].view().version());
}

#[tokio::test(start_paused = true)]
async fn test_service_clears_missing_member_on_reconnect() {
    let network = InMemoryNetwork::new();
    let nodes = form_cluster(&network, &[5961, 5962], "PutIfAbsent", 100).await;
    let grace = super::test_helpers::test_cluster_config().missing_member_grace_period;

    nodes[0].unreachable(&nodes[1]).await;
    wait_until("the member is recorded as missing", || {
        nodes[0].handle.membership().missing_count() == 1
    })
    .await;

    nodes[0].reconnected_with(&nodes[1]).await;
    wait_until("the missing record is cleared", || {
        nodes[0].handle.membership().missing_count() == 0
    })
    .await;

    tokio::time::advance(grace * 2).await;
    tokio::task::yield_now().await;
    assert_eq!(nodes[0].member_count(), 2);
}
