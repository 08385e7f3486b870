// tests/property/policy_props.rs

//! Built-in policies are pure: they pick one of their inputs (or remove the
//! key), and re-applying the same incoming entry changes nothing.

use bytes::Bytes;
use gridmerge::core::merge::{BuiltinPolicy, MergePolicy, MergingEntryView};
use proptest::prelude::*;
use strum::IntoEnumIterator;

fn entry_view() -> impl Strategy<Value = MergingEntryView> {
    // Small ranges so that statistic ties are frequent.
    ("[a-c]{0,3}", 0u64..4, 0u64..4, 0u64..4, 0u64..4).prop_map(
        |(value, hits, access, update, expiration)| {
            MergingEntryView::new("key", value)
                .with_hits(hits)
                .with_last_access_time(access)
                .with_last_update_time(update)
                .with_expiration_time(expiration)
        },
    )
}

/// The stored entry after a merge produced `result`.
fn stored_after(
    merging: &MergingEntryView,
    existing: Option<&MergingEntryView>,
    result: &Option<Bytes>,
) -> Option<MergingEntryView> {
    let value = result.as_ref()?;
    match existing {
        Some(existing) if existing.value() == value => Some(existing.clone()),
        _ => Some(merging.clone()),
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 300,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_builtin_result_is_one_of_the_inputs(
        merging in entry_view(),
        existing in prop::option::of(entry_view()),
    ) {
        for policy in BuiltinPolicy::iter() {
            let result = MergePolicy::from(policy).merge(&merging, existing.as_ref());
            if let Some(value) = &result {
                let from_merging = value == merging.value();
                let from_existing = existing.as_ref().is_some_and(|e| e.value() == value);
                prop_assert!(from_merging || from_existing, "{} invented a value", policy);
            }
        }
    }

    #[test]
    fn test_reapplying_an_entry_is_idempotent(
        merging in entry_view(),
        existing in prop::option::of(entry_view()),
    ) {
        for policy in BuiltinPolicy::iter() {
            let policy = MergePolicy::from(policy);
            let first = policy.merge(&merging, existing.as_ref());
            let stored = stored_after(&merging, existing.as_ref(), &first);
            let second = policy.merge(&merging, stored.as_ref());
            prop_assert_eq!(&first, &second, "{} is not idempotent", policy.name());
        }
    }
}
