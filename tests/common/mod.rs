//! Shared helpers for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use minilease::common::{Config, Error, Result};
use minilease::coordinator::{
    Coordinator, CoordinatorOptions, HandoffRequest, NodeIdentity, PeerClient,
    ReplicaRegistration, Snapshot,
};
use minilease::lease::{DistributedLeaser, LockService, MemoryLockService, PrimaryInfo};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Peer transport that calls coordinators in this process directly
#[derive(Default)]
pub struct LocalPeers {
    nodes: Mutex<HashMap<String, Weak<Coordinator>>>,
    /// Handoff requests sent so far
    pub handoffs: AtomicUsize,
}

impl LocalPeers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, node: &Arc<Coordinator>) {
        self.nodes
            .lock()
            .unwrap()
            .insert(node.identity().advertise_url.clone(), Arc::downgrade(node));
    }

    fn get(&self, url: &str) -> Option<Arc<Coordinator>> {
        self.nodes.lock().unwrap().get(url).and_then(Weak::upgrade)
    }
}

#[async_trait]
impl PeerClient for LocalPeers {
    async fn register(
        &self,
        primary_url: &str,
        identity: &NodeIdentity,
        candidate: bool,
    ) -> Result<PrimaryInfo> {
        let node = self
            .get(primary_url)
            .ok_or_else(|| Error::Connection(format!("no node at {}", primary_url)))?;
        node.register_replica(&ReplicaRegistration {
            id: identity.id.clone(),
            advertise_url: identity.advertise_url.clone(),
            candidate,
        })
    }

    async fn handoff(&self, primary_url: &str, identity: &NodeIdentity) -> Result<()> {
        self.handoffs.fetch_add(1, Ordering::SeqCst);
        let node = self
            .get(primary_url)
            .ok_or_else(|| Error::HandoffUnreachable(format!("no node at {}", primary_url)))?;
        node.handle_handoff(&HandoffRequest {
            requester_id: identity.id.clone(),
        })
    }
}

pub fn url(name: &str) -> String {
    format!("http://{}:20202", name)
}

pub fn proxy_url(name: &str) -> String {
    format!("http://{}:8080", name)
}

pub fn options() -> CoordinatorOptions {
    CoordinatorOptions {
        reconnect_delay: Duration::from_millis(500),
        demote_delay: Duration::from_secs(5),
        promotion_timeout: Duration::from_secs(10),
        replica_timeout: Duration::from_secs(5),
    }
}

/// Coordinator on the distributed backend, registered with `peers`. Its
/// lease advertises a proxy at [`proxy_url`].
pub fn distributed_node(
    service: &Arc<MemoryLockService>,
    peers: &Arc<LocalPeers>,
    name: &str,
    candidate: bool,
    ttl: Duration,
    lock_delay: Duration,
) -> Arc<Coordinator> {
    let service: Arc<dyn LockService> = service.clone();
    let mut leaser = DistributedLeaser::new(service, "minilease/primary", name, url(name))
        .with_proxy_url(proxy_url(name));
    leaser.ttl = ttl;
    leaser.lock_delay = lock_delay;
    node_with_leaser(peers, name, candidate, leaser)
}

/// Coordinator named `name` over `leaser`, registered with `peers`
pub fn node_with_leaser(
    peers: &Arc<LocalPeers>,
    name: &str,
    candidate: bool,
    leaser: DistributedLeaser,
) -> Arc<Coordinator> {
    let node = Coordinator::new(
        NodeIdentity {
            id: name.to_string(),
            advertise_url: url(name),
        },
        candidate,
        Arc::new(leaser),
        peers.clone(),
        options(),
    );
    peers.add(&node);
    node
}

/// Wait (up to `limit`) for a snapshot matching `f`
pub async fn wait_until(
    node: &Coordinator,
    limit: Duration,
    f: impl FnMut(&Snapshot) -> bool,
) -> Snapshot {
    let mut rx = node.subscribe();
    let snap = tokio::time::timeout(limit, rx.wait_for(f))
        .await
        .expect("timed out waiting for state")
        .expect("coordinator dropped")
        .clone();
    snap
}

/// Node config on the distributed backend, listening on an ephemeral port
pub fn http_config(id: &str, candidate: bool) -> Config {
    let toml = format!(
        r#"
node_id = "{id}"

[http]
bind_addr = "127.0.0.1:0"

[lease]
type = "consul"
candidate = {candidate}
hostname = "127.0.0.1"
reconnect_delay_ms = 100
demote_delay_ms = 2000
promotion_timeout_ms = 5000
network_timeout_ms = 500

[lease.consul]
url = "http://127.0.0.1:1"
ttl_ms = 2000
lock_delay_ms = 200
"#
    );
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("minilease.toml");
    std::fs::write(&path, toml).unwrap();
    Config::load(Some(&path), false).unwrap()
}
