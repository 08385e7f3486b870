// src/core/cluster/transport.rs

//! The member transport abstraction and an in-process implementation of it.
//!
//! The core never opens sockets. It sends `ClusterMessage`s through a
//! `Transport` and answers incoming ones through a `MessageHandler`.
//! `InMemoryNetwork` routes between handlers registered in the same process
//! and can inject partitions and delivery failures.

use super::member::Address;
use super::messages::{self, ClusterMessage, ClusterReply};
use crate::core::ClusterError;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Sends a request to a peer and waits for its reply.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn send(
        &self,
        target: &Address,
        message: ClusterMessage,
    ) -> Result<ClusterReply, ClusterError>;
}

/// Answers requests arriving from peers.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, from: &Address, message: ClusterMessage) -> ClusterReply;
}

/// A pair of address sets that cannot reach each other.
#[derive(Debug, Clone)]
struct Partition {
    side_a: HashSet<Address>,
    side_b: HashSet<Address>,
}

impl Partition {
    fn separates(&self, from: &Address, to: &Address) -> bool {
        (self.side_a.contains(from) && self.side_b.contains(to))
            || (self.side_b.contains(from) && self.side_a.contains(to))
    }
}

/// An in-process network connecting registered members.
#[derive(Default)]
pub struct InMemoryNetwork {
    handlers: DashMap<Address, Arc<dyn MessageHandler>>,
    partitions: RwLock<Vec<Partition>>,
    /// Remaining deliveries to an address before it becomes unreachable.
    delivery_budgets: DashMap<Address, usize>,
}

impl fmt::Debug for InMemoryNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryNetwork")
            .field("members", &self.handlers.len())
            .field("partitions", &self.partitions.read().len())
            .finish()
    }
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, address: Address, handler: Arc<dyn MessageHandler>) {
        debug!("Registered {} on the in-memory network.", address);
        self.handlers.insert(address, handler);
    }

    pub fn deregister(&self, address: &Address) {
        self.handlers.remove(address);
    }

    /// A transport that sends on behalf of `local`.
    pub fn endpoint(self: &Arc<Self>, local: Address) -> Arc<NetworkEndpoint> {
        Arc::new(NetworkEndpoint {
            network: self.clone(),
            local,
        })
    }

    /// Cuts every link between `side_a` and `side_b`.
    pub fn partition(&self, side_a: &[Address], side_b: &[Address]) {
        info!("Partitioning {:?} from {:?}.", side_a, side_b);
        self.partitions.write().push(Partition {
            side_a: side_a.iter().cloned().collect(),
            side_b: side_b.iter().cloned().collect(),
        });
    }

    /// Removes all partitions and delivery limits.
    pub fn heal(&self) {
        info!("Healing the in-memory network.");
        self.partitions.write().clear();
        self.delivery_budgets.clear();
    }

    /// Makes `address` unreachable after `deliveries` more messages reach it.
    pub fn fail_after(&self, address: &Address, deliveries: usize) {
        self.delivery_budgets.insert(address.clone(), deliveries);
    }

    pub fn is_reachable(&self, from: &Address, to: &Address) -> bool {
        self.handlers.contains_key(to)
            && !self.partitions.read().iter().any(|p| p.separates(from, to))
            && self.delivery_budgets.get(to).is_none_or(|budget| *budget > 0)
    }

    fn take_delivery(&self, to: &Address) -> bool {
        match self.delivery_budgets.get_mut(to) {
            Some(budget) if *budget == 0 => false,
            Some(mut budget) => {
                *budget -= 1;
                true
            }
            None => true,
        }
    }

    async fn deliver(
        &self,
        from: &Address,
        to: &Address,
        message: ClusterMessage,
    ) -> Result<ClusterReply, ClusterError> {
        if self.partitions.read().iter().any(|p| p.separates(from, to)) {
            return Err(ClusterError::Transport(format!(
                "{to} is unreachable from {from} (partitioned)"
            )));
        }
        let handler = self
            .handlers
            .get(to)
            .map(|h| h.value().clone())
            .ok_or_else(|| ClusterError::Transport(format!("no member listening on {to}")))?;
        if !self.take_delivery(to) {
            return Err(ClusterError::Transport(format!("{to} is unreachable")));
        }

        let kind = message.kind();
        let message = messages::decode::<ClusterMessage>(&messages::encode(&message)?)?;
        let reply = handler.handle(from, message).await;
        let reply = messages::decode::<ClusterReply>(&messages::encode(&reply)?)?;
        debug!("Delivered {} from {} to {}.", kind, from, to);
        Ok(reply)
    }
}

/// The sending side of one member on an `InMemoryNetwork`.
#[derive(Debug, Clone)]
pub struct NetworkEndpoint {
    network: Arc<InMemoryNetwork>,
    local: Address,
}

#[async_trait]
impl Transport for NetworkEndpoint {
    async fn send(
        &self,
        target: &Address,
        message: ClusterMessage,
    ) -> Result<ClusterReply, ClusterError> {
        self.network.deliver(&self.local, target, message).await
    }
}
