// src/core/cluster/member.rs

//! Identity of a single cluster participant.

use crate::core::ClusterError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// The network address of a member.
///
/// The derived ordering (host first, then port) is the total order used by the
/// merge-direction tie-break, so it must stay identical on every member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ClusterError::InvalidAddress(s.to_string()))?;
        if host.is_empty() {
            return Err(ClusterError::InvalidAddress(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| ClusterError::InvalidAddress(s.to_string()))?;
        Ok(Address::new(host, port))
    }
}

/// A cluster participant. Immutable once constructed; liveness and other
/// dynamic facts are tracked by the membership manager, never on this value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    uuid: Uuid,
    address: Address,
    attributes: BTreeMap<String, String>,
    lite: bool,
    local: bool,
}

impl Member {
    /// Creates a data-owning, non-local member with no attributes.
    pub fn new(uuid: Uuid, address: Address) -> Self {
        Self {
            uuid,
            address,
            attributes: BTreeMap::new(),
            lite: false,
            local: false,
        }
    }

    pub fn with_attributes(mut self, attributes: BTreeMap<String, String>) -> Self {
        self.attributes = attributes;
        self
    }

    /// Marks the member as lite: it takes part in the cluster but owns no data partitions.
    pub fn with_lite(mut self, lite: bool) -> Self {
        self.lite = lite;
        self
    }

    pub fn with_local(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn is_lite(&self) -> bool {
        self.lite
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    /// Returns a copy whose `local` flag reflects whether it is `local_uuid`.
    /// Views travel between members, so the flag is recomputed on receipt.
    pub(crate) fn localized(&self, local_uuid: Uuid) -> Member {
        let mut member = self.clone();
        member.local = member.uuid == local_uuid;
        member
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Member [{}] - {}", self.address, self.uuid)?;
        if self.lite {
            write!(f, " lite")?;
        }
        if self.local {
            write!(f, " this")?;
        }
        Ok(())
    }
}
