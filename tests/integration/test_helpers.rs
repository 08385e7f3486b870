// tests/integration/test_helpers.rs

//! Test helpers and utilities for integration tests

#![allow(dead_code)]

use gridmerge::core::cluster::{
    Address, ClusterConfig, ClusterHandle, ClusterIdentity, ClusterService, ClusterStateHolder,
    InMemoryNetwork, Member, MembershipView,
};
use bytes::Bytes;
use gridmerge::core::events::LifecycleEvent;
use gridmerge::core::merge::{
    CustomMergePolicy, DataStructureConfig, MergePolicyRegistry, StoreRegistry,
};
use gridmerge::core::storage::RecordStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

/// Name of the data structure every test node registers.
pub const MAP_NAME: &str = "default";

/// Installs a test-writer subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new("warn"))
        .with(fmt::layer().with_test_writer())
        .try_init();
}

/// Short timings so that grace-period and merge tests finish quickly.
pub fn test_cluster_config() -> ClusterConfig {
    ClusterConfig {
        missing_member_grace_period: Duration::from_secs(5),
        merge_timeout: Duration::from_secs(10),
        missing_member_check_interval: Duration::from_millis(100),
        management_channel_capacity: 1024,
    }
}

/// Concatenates both values, or removes the key when the incoming value is "drop".
#[derive(Debug)]
pub struct ConcatPolicy;

impl CustomMergePolicy for ConcatPolicy {
    fn name(&self) -> &str {
        "concat"
    }

    fn merge(&self, merging: &Bytes, existing: Option<&Bytes>) -> Option<Bytes> {
        if merging.as_ref() == b"drop" {
            return None;
        }
        let mut out = existing.map(|e| e.to_vec()).unwrap_or_default();
        out.extend_from_slice(merging);
        Some(Bytes::from(out))
    }
}

pub fn address(port: u16) -> Address {
    Address::new("127.0.0.1", port)
}

/// One running member on an in-memory network.
pub struct TestNode {
    pub handle: ClusterHandle,
    pub store: Arc<RecordStore>,
    pub address: Address,
    pub uuid: Uuid,
    shutdown_tx: broadcast::Sender<()>,
}

impl TestNode {
    /// Starts a member with one `RecordStore` named `MAP_NAME`.
    pub fn start(network: &Arc<InMemoryNetwork>, port: u16, policy: &str, batch_size: usize) -> Self {
        let member = Member::new(Uuid::new_v4(), address(port));
        Self::start_with(
            network,
            member,
            test_cluster_config(),
            DataStructureConfig::new(MAP_NAME, policy).with_batch_size(batch_size),
        )
    }

    pub fn start_with(
        network: &Arc<InMemoryNetwork>,
        member: Member,
        config: ClusterConfig,
        data_structure: DataStructureConfig,
    ) -> Self {
        Self::start_with_policies(
            network,
            member,
            config,
            data_structure,
            &MergePolicyRegistry::new(),
        )
    }

    /// Like `start_with`, resolving the policy name against `policies`.
    pub fn start_with_policies(
        network: &Arc<InMemoryNetwork>,
        member: Member,
        config: ClusterConfig,
        data_structure: DataStructureConfig,
        policies: &MergePolicyRegistry,
    ) -> Self {
        init_tracing();
        let cluster_state = Arc::new(ClusterStateHolder::default());
        let store = Arc::new(RecordStore::new(
            data_structure.name.clone(),
            cluster_state.clone(),
        ));
        let stores = Arc::new(StoreRegistry::new());
        stores
            .register_configured(store.clone(), &data_structure, policies)
            .expect("test policy should resolve");

        let address = member.address().clone();
        let uuid = member.uuid();
        let (service, handle) = ClusterService::new(
            config,
            member,
            stores,
            cluster_state,
            network.endpoint(address.clone()),
        );
        network.register(address.clone(), Arc::new(handle.clone()));

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(service.run(shutdown_rx));

        Self {
            handle,
            store,
            address,
            uuid,
            shutdown_tx,
        }
    }

    pub fn cluster_id(&self) -> ClusterIdentity {
        self.handle.membership().cluster_id()
    }

    pub fn view(&self) -> MembershipView {
        self.handle.membership().current().as_ref().clone()
    }

    pub fn member_count(&self) -> usize {
        self.handle.membership().current().size()
    }

    pub async fn join(&self, seed: &TestNode) -> ClusterIdentity {
        self.handle
            .join(seed.address.clone())
            .await
            .expect("join should succeed")
    }

    /// Delivers the reconnect signal `self` would get when `other` becomes reachable.
    pub async fn reconnected_with(&self, other: &TestNode) {
        self.handle
            .on_member_reconnected(
                other.address.clone(),
                other.uuid,
                other.cluster_id(),
                other.view(),
            )
            .await
            .expect("management task should be running");
    }

    pub async fn unreachable(&self, other: &TestNode) {
        self.handle
            .on_member_unreachable(other.address.clone(), other.uuid)
            .await
            .expect("management task should be running");
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.store
            .entry_view(key.as_bytes())
            .map(|view| String::from_utf8_lossy(view.value()).into_owned())
    }

    pub fn put(&self, key: &str, value: &str) {
        self.store
            .put(key.to_string(), value.to_string())
            .expect("store should accept writes");
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Starts `ports.len()` members that form one cluster with the first as master.
pub async fn form_cluster(
    network: &Arc<InMemoryNetwork>,
    ports: &[u16],
    policy: &str,
    batch_size: usize,
) -> Vec<TestNode> {
    let nodes: Vec<TestNode> = ports
        .iter()
        .map(|port| TestNode::start(network, *port, policy, batch_size))
        .collect();
    for node in &nodes[1..] {
        node.join(&nodes[0]).await;
    }
    let expected = nodes.len();
    wait_until("all members see the full member list", || {
        nodes.iter().all(|n| n.member_count() == expected)
    })
    .await;
    nodes
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting until {what}");
}

/// Collects lifecycle events that are already queued.
pub fn drain_lifecycle(rx: &mut broadcast::Receiver<LifecycleEvent>) -> Vec<LifecycleEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
