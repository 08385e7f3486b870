// tests/integration/membership_test.rs

use super::test_helpers::{TestNode, address, form_cluster, wait_until};
use gridmerge::core::ClusterError;
use gridmerge::core::cluster::{
    ClusterIdentity, InMemoryNetwork, Member, MembershipManager, MembershipView, ViewMember,
};
use gridmerge::core::events::EventBus;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

fn member(port: u16) -> Member {
    Member::new(Uuid::new_v4(), address(port))
}

fn manager(local: &Member) -> MembershipManager {
    MembershipManager::new(
        local.clone(),
        ClusterIdentity::generate(),
        Arc::new(EventBus::new()),
    )
}

#[tokio::test]
async fn test_initial_view_contains_only_local_member() {
    let local = member(5701);
    let manager = manager(&local);
    let view = manager.current();

    assert_eq!(view.version(), MembershipView::INITIAL_VERSION);
    assert_eq!(view.size(), 1);
    assert!(manager.is_master());
    assert!(manager.local_member().is_local());
    assert_eq!(manager.member_list_join_version(), Some(1));
}

#[tokio::test]
async fn test_publish_accepts_only_next_version() {
    let local = member(5701);
    let manager = manager(&local);
    let current = manager.current();

    let next = current.with_members_added(&[member(5702)]).unwrap();
    manager.publish(next.clone()).unwrap();
    assert_eq!(manager.member_list_version(), 2);

    // Publishing the same version again loses the race.
    let err = manager.publish(next).unwrap_err();
    assert_eq!(err, ClusterError::StaleVersion { expected: 3, actual: 2 });

    // Skipping a version is rejected too.
    let skipped = MembershipView::from_parts(4, current.entries().to_vec()).unwrap();
    assert!(matches!(
        manager.publish(skipped),
        Err(ClusterError::StaleVersion { expected: 3, actual: 4 })
    ));
    assert_eq!(manager.member_list_version(), 2);
}

#[tokio::test]
async fn test_publish_rejects_view_without_local_member() {
    let local = member(5701);
    let manager = manager(&local);
    let foreign = MembershipView::initial(member(5702));
    let next = foreign.with_members_added(&[member(5703)]).unwrap();

    assert!(matches!(
        manager.publish(next),
        Err(ClusterError::MemberNotFound(_))
    ));
}

#[tokio::test]
async fn test_concurrent_publishes_have_single_winner_per_version() {
    let local = member(5701);
    let manager = Arc::new(manager(&local));

    let handles: Vec<_> = (0..8u16)
        .map(|i| {
            let manager = manager.clone();
            std::thread::spawn(move || {
                let mut wins = 0;
                for j in 0..25u16 {
                    let joiner = member(6000 + i * 100 + j);
                    loop {
                        let next = manager.current().with_members_added(&[joiner.clone()]).unwrap();
                        match manager.publish(next) {
                            Ok(()) => {
                                wins += 1;
                                break;
                            }
                            Err(ClusterError::StaleVersion { .. }) => continue,
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                    }
                }
                wins
            })
        })
        .collect();

    let wins: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(wins, 200);
    assert_eq!(manager.member_list_version(), 201);
    assert_eq!(manager.current().size(), 201);
}

#[tokio::test]
async fn test_lookup_requires_matching_address_and_uuid() {
    let local = member(5701);
    let other = member(5702);
    let manager = manager(&local);
    manager
        .publish(manager.current().with_members_added(&[other.clone()]).unwrap())
        .unwrap();

    assert_eq!(manager.lookup_by_uuid(&other.uuid()).unwrap().address(), other.address());
    assert_eq!(manager.lookup_by_address(other.address()).unwrap().uuid(), other.uuid());
    assert!(manager.lookup(other.address(), &other.uuid()).is_some());
    assert!(manager.lookup(local.address(), &other.uuid()).is_none());
    assert!(manager.lookup(other.address(), &Uuid::new_v4()).is_none());
    assert!(manager.lookup_by_uuid(&Uuid::new_v4()).is_none());
}

#[tokio::test]
async fn test_master_is_first_non_lite_member() {
    let lite = member(5701).with_lite(true);
    let data = member(5702);
    let view = MembershipView::initial(lite.clone())
        .with_members_added(&[data.clone()])
        .unwrap();
    assert_eq!(view.master().unwrap().uuid(), data.uuid());

    let all_lite = MembershipView::initial(lite.clone())
        .with_members_added(&[member(5703).with_lite(true)])
        .unwrap();
    assert_eq!(all_lite.master().unwrap().uuid(), lite.uuid());
}

#[tokio::test]
async fn test_view_rejects_duplicate_uuid_and_address() {
    let a = member(5701);
    let same_address = member(5701);
    let err = MembershipView::initial(a.clone())
        .with_members_added(&[same_address])
        .unwrap_err();
    assert!(matches!(err, ClusterError::DuplicateMember(_)));

    let entries = vec![
        ViewMember { member: a.clone(), join_version: 1 },
        ViewMember {
            member: Member::new(a.uuid(), address(5702)),
            join_version: 1,
        },
    ];
    assert!(matches!(
        MembershipView::from_parts(1, entries),
        Err(ClusterError::DuplicateMember(_))
    ));
}

#[tokio::test]
async fn test_admission_requires_version_above_current() {
    let view = MembershipView::initial(member(5701));
    let b = member(5702);

    let err = view.with_member_admitted(b.clone(), 1).unwrap_err();
    assert_eq!(err, ClusterError::StaleVersion { expected: 2, actual: 1 });

    let next = view.with_member_admitted(b.clone(), 9).unwrap();
    assert_eq!(next.version(), 9);
    assert_eq!(next.join_version_of(&b.uuid()), Some(9));
}

#[tokio::test]
async fn test_concurrent_joins_get_distinct_join_versions() {
    let network = InMemoryNetwork::new();
    let master = TestNode::start(&network, 5835, "PutIfAbsent", 100);
    let first = TestNode::start(&network, 5836, "PutIfAbsent", 100);
    let second = TestNode::start(&network, 5837, "PutIfAbsent", 100);

    let (a, b) = tokio::join!(first.join(&master), second.join(&master));
    assert_eq!(a, master.cluster_id());
    assert_eq!(b, master.cluster_id());
    wait_until("every member sees three members", || {
        [&master, &first, &second].iter().all(|n| n.member_count() == 3)
    })
    .await;

    let view = master.view();
    assert_eq!(view.version(), 3);
    let mut join_versions = vec![
        view.join_version_of(&first.uuid).unwrap(),
        view.join_version_of(&second.uuid).unwrap(),
    ];
    join_versions.sort_unstable();
    assert_eq!(join_versions, [2, 3]);

    // Members are listed in join order.
    let order: Vec<Uuid> = view.members().map(Member::uuid).collect();
    let expected_second = if view.join_version_of(&first.uuid) == Some(2) {
        [first.uuid, second.uuid]
    } else {
        [second.uuid, first.uuid]
    };
    assert_eq!(order[1..], expected_second);
}

#[tokio::test]
async fn test_install_requires_same_cluster_and_higher_version() {
    let local = member(5701);
    let master = member(5700);
    let cluster_id = ClusterIdentity::generate();
    let manager = MembershipManager::new(local.clone(), cluster_id, Arc::new(EventBus::new()));

    let joined = MembershipView::initial(master.clone())
        .with_members_added(&[local.clone()])
        .unwrap();
    manager.adopt(cluster_id, joined.clone()).unwrap();
    assert_eq!(manager.member_list_version(), 2);

    // Lower or equal versions are never installed.
    assert!(!manager.install(cluster_id, joined.clone()));

    // Gaps are allowed for pushed updates.
    let v3 = joined.with_members_added(&[member(5702)]).unwrap();
    let v4 = v3.with_members_added(&[member(5703)]).unwrap();
    assert!(manager.install(cluster_id, v4.clone()));
    assert_eq!(manager.member_list_version(), 4);
    assert!(!manager.install(cluster_id, v3));

    // Updates for another cluster are ignored.
    let v5 = v4.with_members_added(&[member(5704)]).unwrap();
    assert!(!manager.install(ClusterIdentity::generate(), v5));
    assert_eq!(manager.member_list_version(), 4);
    assert_eq!(manager.member_list_join_version(), Some(2));
}

#[tokio::test]
async fn test_adopt_never_lowers_the_version() {
    let local = member(5701);
    let manager = manager(&local);
    for port in [5702, 5703] {
        manager
            .publish(manager.current().with_members_added(&[member(port)]).unwrap())
            .unwrap();
    }
    assert_eq!(manager.member_list_version(), 3);

    let other_id = ClusterIdentity::generate();
    let lower = MembershipView::initial(member(5710))
        .with_members_added(&[local.clone()])
        .unwrap();
    assert_eq!(
        manager.adopt(other_id, lower).unwrap_err(),
        ClusterError::StaleVersion { expected: 4, actual: 2 }
    );
    assert_ne!(manager.cluster_id(), other_id);

    // The same view of the same cluster again changes nothing.
    let cluster_id = manager.cluster_id();
    assert!(manager.adopt(cluster_id, manager.current().as_ref().clone()).is_ok());
    assert_eq!(manager.member_list_version(), 3);

    let higher = MembershipView::initial(member(5710))
        .with_member_admitted(local.clone(), 9)
        .unwrap();
    manager.adopt(other_id, higher).unwrap();
    assert_eq!(manager.cluster_id(), other_id);
    assert_eq!(manager.member_list_version(), 9);
    assert_eq!(manager.member_list_join_version(), Some(9));
}

#[tokio::test]
async fn test_publish_at_accepts_any_higher_version() {
    let local = member(5701);
    let manager = manager(&local);
    let current = manager.current();

    let next = current.with_member_admitted(member(5702), 5).unwrap();
    manager.publish_at(next.clone()).unwrap();
    assert_eq!(manager.member_list_version(), 5);
    assert!(matches!(
        manager.publish_at(next),
        Err(ClusterError::StaleVersion { expected: 6, actual: 5 })
    ));
}

#[tokio::test]
async fn test_publish_emits_membership_event() {
    let local = member(5701);
    let manager = manager(&local);
    let mut events = manager.subscribe();
    let joiner = member(5702);

    manager
        .publish(manager.current().with_members_added(&[joiner.clone()]).unwrap())
        .unwrap();

    let event = events.recv().await.unwrap();
    assert_eq!(event.previous_version, 1);
    assert_eq!(event.view.version(), 2);
    assert_eq!(event.added.len(), 1);
    assert_eq!(event.added[0].uuid(), joiner.uuid());
    assert!(event.removed.is_empty());
    assert!(!event.cluster_changed);
}

#[tokio::test]
async fn test_member_attributes_survive_join() {
    let network = InMemoryNetwork::new();
    let master = TestNode::start(&network, 5801, "PutIfAbsent", 100);
    let mut attributes = BTreeMap::new();
    attributes.insert("zone".to_string(), "eu-1".to_string());
    let joiner = TestNode::start_with(
        &network,
        Member::new(Uuid::new_v4(), address(5802)).with_attributes(attributes),
        super::test_helpers::test_cluster_config(),
        gridmerge::core::merge::DataStructureConfig::new("default", "PutIfAbsent"),
    );

    joiner.join(&master).await;

    let seen = master
        .handle
        .membership()
        .lookup_by_uuid(&joiner.uuid)
        .unwrap();
    assert_eq!(seen.attribute("zone"), Some("eu-1"));
    assert!(!seen.is_local());
    assert!(joiner.handle.membership().local_member().is_local());
}

#[tokio::test]
async fn test_join_forms_cluster_and_pushes_member_list() {
    let network = InMemoryNetwork::new();
    let nodes = form_cluster(&network, &[5811, 5812, 5813], "PutIfAbsent", 100).await;

    let cluster_id = nodes[0].cluster_id();
    for node in &nodes {
        assert_eq!(node.cluster_id(), cluster_id);
        assert_eq!(node.view().version(), 3);
        assert_eq!(node.handle.membership().master().unwrap().uuid(), nodes[0].uuid);
    }
    assert_eq!(nodes[1].handle.membership().member_list_join_version(), Some(2));
    assert_eq!(nodes[2].handle.membership().member_list_join_version(), Some(3));
}

#[tokio::test]
async fn test_join_through_non_master_is_redirected() {
    let network = InMemoryNetwork::new();
    let nodes = form_cluster(&network, &[5821, 5822], "PutIfAbsent", 100).await;
    let late = TestNode::start(&network, 5823, "PutIfAbsent", 100);

    let cluster_id = late.join(&nodes[1]).await;

    assert_eq!(cluster_id, nodes[0].cluster_id());
    wait_until("every member sees three members", || {
        nodes.iter().chain(std::iter::once(&late)).all(|n| n.member_count() == 3)
    })
    .await;
}

#[tokio::test]
async fn test_repeated_join_is_idempotent() {
    let network = InMemoryNetwork::new();
    let master = TestNode::start(&network, 5831, "PutIfAbsent", 100);
    let joiner = TestNode::start(&network, 5832, "PutIfAbsent", 100);

    let first = joiner.join(&master).await;
    let version = master.view().version();
    let second = joiner.join(&master).await;

    assert_eq!(first, second);
    assert_eq!(master.view().version(), version);
    assert_eq!(master.member_count(), 2);
}
