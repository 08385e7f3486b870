// src/core/merge/policy.rs

//! The merge policy engine: per-entry reconciliation of an incoming entry
//! against the locally stored one.
//!
//! Policies are pure functions of their two inputs. They hold no state, so
//! re-sending the same entry after an aborted merge yields the same result.

use super::entry_view::MergingEntryView;
use crate::core::ClusterError;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use strum_macros::{Display, EnumIter, EnumString};

/// Suffix accepted (and ignored) when resolving built-in policy names.
const POLICY_NAME_SUFFIX: &str = "MergePolicy";

/// A user-supplied policy working on raw values only.
///
/// It may return a new value, `None` to remove the key, or either input unchanged.
pub trait CustomMergePolicy: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn merge(&self, merging: &Bytes, existing: Option<&Bytes>) -> Option<Bytes>;
}

/// The closed set of built-in policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
#[strum(ascii_case_insensitive)]
pub enum BuiltinPolicy {
    /// Always take the incoming value.
    PassThrough,
    /// Always keep the existing value and drop the incoming one.
    Discard,
    /// Keep the existing value if there is one, otherwise take the incoming value.
    PutIfAbsent,
    /// The entry with more hits wins; ties keep the existing value.
    HigherHits,
    /// The entry accessed most recently wins; ties keep the existing value.
    LatestAccess,
    /// The entry updated most recently wins; ties keep the existing value.
    LatestUpdate,
    /// The entry expiring last wins; ties keep the existing value.
    ExpirationTime,
    /// Remove the key on both sides.
    RemoveValues,
}

impl BuiltinPolicy {
    fn merge(self, merging: &MergingEntryView, existing: Option<&MergingEntryView>) -> Option<Bytes> {
        let merging_value = || Some(merging.value().clone());
        match self {
            BuiltinPolicy::PassThrough => merging_value(),
            BuiltinPolicy::Discard => existing.map(|e| e.value().clone()),
            BuiltinPolicy::PutIfAbsent => existing.map_or_else(merging_value, |e| Some(e.value().clone())),
            BuiltinPolicy::HigherHits => {
                prefer_existing_unless(merging, existing, |m, e| m.hits() > e.hits())
            }
            BuiltinPolicy::LatestAccess => prefer_existing_unless(merging, existing, |m, e| {
                m.last_access_time() > e.last_access_time()
            }),
            BuiltinPolicy::LatestUpdate => prefer_existing_unless(merging, existing, |m, e| {
                m.last_update_time() > e.last_update_time()
            }),
            BuiltinPolicy::ExpirationTime => prefer_existing_unless(merging, existing, |m, e| {
                m.expiration_time() > e.expiration_time()
            }),
            BuiltinPolicy::RemoveValues => None,
        }
    }
}

/// Takes the incoming value when there is no existing entry or when
/// `merging_wins` holds strictly; every tie keeps the existing value.
fn prefer_existing_unless(
    merging: &MergingEntryView,
    existing: Option<&MergingEntryView>,
    merging_wins: impl Fn(&MergingEntryView, &MergingEntryView) -> bool,
) -> Option<Bytes> {
    match existing {
        None => Some(merging.value().clone()),
        Some(existing) if merging_wins(merging, existing) => Some(merging.value().clone()),
        Some(existing) => Some(existing.value().clone()),
    }
}

/// A resolved policy. Resolution happens once, at configuration time.
#[derive(Debug, Clone)]
pub enum MergePolicy {
    Builtin(BuiltinPolicy),
    Custom(Arc<dyn CustomMergePolicy>),
}

impl MergePolicy {
    /// Reconciles `merging` against `existing`. `None` means the key is removed.
    pub fn merge(
        &self,
        merging: &MergingEntryView,
        existing: Option<&MergingEntryView>,
    ) -> Option<Bytes> {
        match self {
            MergePolicy::Builtin(policy) => policy.merge(merging, existing),
            MergePolicy::Custom(policy) => policy.merge(merging.value(), existing.map(|e| e.value())),
        }
    }

    pub fn name(&self) -> String {
        match self {
            MergePolicy::Builtin(policy) => policy.to_string(),
            MergePolicy::Custom(policy) => policy.name().to_string(),
        }
    }
}

impl Default for MergePolicy {
    fn default() -> Self {
        MergePolicy::Builtin(BuiltinPolicy::PutIfAbsent)
    }
}

impl From<BuiltinPolicy> for MergePolicy {
    fn from(policy: BuiltinPolicy) -> Self {
        MergePolicy::Builtin(policy)
    }
}

/// Named custom policies, consulted before the built-ins during resolution.
#[derive(Debug, Clone, Default)]
pub struct MergePolicyRegistry {
    custom: HashMap<String, Arc<dyn CustomMergePolicy>>,
}

impl MergePolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a custom policy under its own name, replacing any previous one.
    pub fn register(&mut self, policy: Arc<dyn CustomMergePolicy>) -> &mut Self {
        self.custom.insert(policy.name().to_string(), policy);
        self
    }

    /// Resolves a configured policy name.
    ///
    /// Custom policies match their exact name. Built-ins match case-insensitively,
    /// with or without a package-style prefix (`a.b.PassThrough`) and with or
    /// without the `MergePolicy` suffix.
    pub fn resolve(&self, name: &str) -> Result<MergePolicy, ClusterError> {
        let trimmed = name.trim();
        if let Some(policy) = self.custom.get(trimmed) {
            return Ok(MergePolicy::Custom(policy.clone()));
        }

        let simple = trimmed.rsplit('.').next().unwrap_or(trimmed);
        let base = strip_suffix_ignore_case(simple, POLICY_NAME_SUFFIX).unwrap_or(simple);
        BuiltinPolicy::from_str(base)
            .map(MergePolicy::Builtin)
            .map_err(|_| ClusterError::UnknownMergePolicy(name.to_string()))
    }
}

fn strip_suffix_ignore_case<'a>(s: &'a str, suffix: &str) -> Option<&'a str> {
    let split = s.len().checked_sub(suffix.len())?;
    if !s.is_char_boundary(split) {
        return None;
    }
    let (head, tail) = s.split_at(split);
    (tail.eq_ignore_ascii_case(suffix) && !head.is_empty()).then_some(head)
}
