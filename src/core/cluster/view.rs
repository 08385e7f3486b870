// src/core/cluster/view.rs

//! Immutable, versioned snapshots of the member list and the identity of the
//! cluster they belong to.

use super::member::{Address, Member};
use crate::core::ClusterError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

/// Generated once when a cluster first forms. Two sub-clusters that share the
/// same configuration are told apart by this value during merge decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterIdentity(Uuid);

impl ClusterIdentity {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ClusterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A member together with the member-list version at which it was admitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewMember {
    pub member: Member,
    pub join_version: u64,
}

/// A published member list. Never mutated after publication: every change
/// produces a new view with a higher version.
///
/// Every admission gets its own version, so join versions within a view are
/// distinct. A merge re-admits the merging members under new versions, so a
/// member's join version can change after assignment. Callers re-query the
/// current view instead of caching a join version as a member key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipView {
    version: u64,
    members: Vec<ViewMember>,
}

impl MembershipView {
    /// The version of the first view of a freshly formed cluster.
    pub const INITIAL_VERSION: u64 = 1;

    /// Creates the single-member view of a cluster that has just formed.
    pub fn initial(local: Member) -> Self {
        Self {
            version: Self::INITIAL_VERSION,
            members: vec![ViewMember {
                member: local,
                join_version: Self::INITIAL_VERSION,
            }],
        }
    }

    /// Builds a view from raw parts, enforcing UUID and address uniqueness.
    pub fn from_parts(version: u64, members: Vec<ViewMember>) -> Result<Self, ClusterError> {
        let mut uuids = HashSet::with_capacity(members.len());
        let mut addresses = HashSet::with_capacity(members.len());
        for entry in &members {
            if !uuids.insert(entry.member.uuid()) {
                return Err(ClusterError::DuplicateMember(entry.member.uuid().to_string()));
            }
            if !addresses.insert(entry.member.address().clone()) {
                return Err(ClusterError::DuplicateMember(
                    entry.member.address().to_string(),
                ));
            }
        }
        Ok(Self { version, members })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Members in join order.
    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().map(|entry| &entry.member)
    }

    pub fn entries(&self) -> &[ViewMember] {
        &self.members
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The first non-lite member in join order, falling back to the first member.
    pub fn master(&self) -> Option<&Member> {
        self.members()
            .find(|m| !m.is_lite())
            .or_else(|| self.members().next())
    }

    pub fn member(&self, uuid: &Uuid) -> Option<&Member> {
        self.members().find(|m| m.uuid() == *uuid)
    }

    pub fn member_by_address(&self, address: &Address) -> Option<&Member> {
        self.members().find(|m| m.address() == address)
    }

    /// Resolves a member only when both keys point at the same record.
    pub fn member_by_identity(&self, address: &Address, uuid: &Uuid) -> Option<&Member> {
        self.member(uuid).filter(|m| m.address() == address)
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.member(uuid).is_some()
    }

    pub fn join_version_of(&self, uuid: &Uuid) -> Option<u64> {
        self.members
            .iter()
            .find(|entry| entry.member.uuid() == *uuid)
            .map(|entry| entry.join_version)
    }

    /// The lowest member address, used as the merge-direction tie-break.
    pub fn smallest_address(&self) -> Option<&Address> {
        self.members().map(Member::address).min()
    }

    /// Returns the view at `version` with `member` appended, admitted at `version`.
    /// `version` must be ahead of this view; gaps are allowed.
    pub fn with_member_admitted(&self, member: Member, version: u64) -> Result<Self, ClusterError> {
        if version <= self.version {
            return Err(ClusterError::StaleVersion {
                expected: self.version + 1,
                actual: version,
            });
        }
        let mut members = self.members.clone();
        members.push(ViewMember {
            member,
            join_version: version,
        });
        Self::from_parts(version, members)
    }

    /// Returns the next view with `new_members` appended in the given order.
    /// All of them share the new version as their join version. Joining
    /// members are admitted through `with_member_admitted` instead.
    pub fn with_members_added(&self, new_members: &[Member]) -> Result<Self, ClusterError> {
        let next_version = self.version + 1;
        let mut members = self.members.clone();
        members.extend(new_members.iter().map(|member| ViewMember {
            member: member.clone(),
            join_version: next_version,
        }));
        Self::from_parts(next_version, members)
    }

    /// Returns the next view without the given members. Every UUID must be present.
    pub fn without_members(&self, uuids: &[Uuid]) -> Result<Self, ClusterError> {
        if let Some(missing) = uuids.iter().find(|uuid| !self.contains(uuid)) {
            return Err(ClusterError::MemberNotFound(missing.to_string()));
        }
        let members = self
            .members
            .iter()
            .filter(|entry| !uuids.contains(&entry.member.uuid()))
            .cloned()
            .collect();
        Ok(Self {
            version: self.version + 1,
            members,
        })
    }

    /// Recomputes every member's `local` flag relative to `local_uuid`.
    pub(crate) fn localized(&self, local_uuid: Uuid) -> Self {
        Self {
            version: self.version,
            members: self
                .members
                .iter()
                .map(|entry| ViewMember {
                    member: entry.member.localized(local_uuid),
                    join_version: entry.join_version,
                })
                .collect(),
        }
    }
}

impl fmt::Display for MembershipView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Members {{size:{}, ver:{}}} [", self.size(), self.version)?;
        for member in self.members() {
            writeln!(f, "\t{member}")?;
        }
        write!(f, "]")
    }
}
