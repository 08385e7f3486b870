// tests/property/direction_props.rs

//! The merge direction must be the same decision whichever side computes it.

use gridmerge::core::cluster::{
    Address, Member, MembershipView, decide, decide_disjoint,
};
use proptest::prelude::*;
use std::collections::BTreeSet;
use uuid::Uuid;

fn view_from_ports(ports: &BTreeSet<u16>) -> MembershipView {
    let mut members = ports
        .iter()
        .map(|port| Member::new(Uuid::new_v4(), Address::new("10.0.0.1", *port)));
    let first = members.next().expect("at least one port");
    let rest: Vec<Member> = members.collect();
    if rest.is_empty() {
        MembershipView::initial(first)
    } else {
        MembershipView::initial(first)
            .with_members_added(&rest)
            .expect("unique members")
    }
}

fn ports() -> impl Strategy<Value = BTreeSet<u16>> {
    // A narrow range makes equal sizes and shared smallest addresses common.
    prop::collection::btree_set(1u16..12, 1..6)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_direction_is_symmetric(a in ports(), b in ports()) {
        let local = view_from_ports(&a);
        let remote = view_from_ports(&b);

        match (decide(&local, &remote), decide(&remote, &local)) {
            (Ok(forward), Ok(backward)) => prop_assert_eq!(forward, backward.reversed()),
            (Err(_), Err(_)) => {}
            (forward, backward) => {
                prop_assert!(false, "asymmetric decision: {:?} vs {:?}", forward, backward)
            }
        }
    }

    #[test]
    fn test_smaller_side_merges(a in ports(), b in ports()) {
        let local = view_from_ports(&a);
        let remote = view_from_ports(&b);
        prop_assume!(local.size() != remote.size());

        let direction = decide(&local, &remote).unwrap();
        let local_merges = local.size() < remote.size();
        prop_assert_eq!(
            direction == gridmerge::core::cluster::MergeDirection::LocalMergesIntoRemote,
            local_merges
        );
    }

    #[test]
    fn test_only_indistinguishable_sides_are_ambiguous(a in ports(), b in ports()) {
        let local = view_from_ports(&a);
        let remote = view_from_ports(&b);

        let indistinguishable = local.size() == remote.size()
            && local.smallest_address() == remote.smallest_address();
        prop_assert_eq!(decide(&local, &remote).is_err(), indistinguishable);
    }

    #[test]
    fn test_members_in_transit_do_not_change_symmetry(
        a in ports(),
        b in ports(),
        moved in 0usize..3,
    ) {
        let local = view_from_ports(&a);
        let remote = view_from_ports(&b);

        // Members that already joined `remote` while `local` still lists them.
        let in_transit: Vec<Member> = local
            .members()
            .take(moved.min(local.size().saturating_sub(1)))
            .filter(|m| remote.member_by_address(m.address()).is_none())
            .cloned()
            .collect();
        let remote = if in_transit.is_empty() {
            remote
        } else {
            remote.with_members_added(&in_transit).unwrap()
        };

        match (decide_disjoint(&local, &remote), decide_disjoint(&remote, &local)) {
            (Ok(forward), Ok(backward)) => prop_assert_eq!(forward, backward.reversed()),
            (Err(_), Err(_)) => {}
            (forward, backward) => {
                prop_assert!(false, "asymmetric decision: {:?} vs {:?}", forward, backward)
            }
        }
    }
}
