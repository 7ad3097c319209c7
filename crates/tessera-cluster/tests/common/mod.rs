//! In-process pool for scenario tests.
//!
//! Nodes talk through a [`MemoryNetwork`] that hands each request straight
//! to the target's `handle_request`. Killing a node makes it unreachable
//! and shuts it down.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use tessera_cluster::{
    BoxFuture, ClusterConfig, ClusterError, Discovery, Node, PeerId, PeerInfo, PeerRequest,
    PeerTransport, BUCKET_COUNT,
};

#[derive(Default)]
pub struct MemoryNetwork {
    nodes: Mutex<HashMap<SocketAddr, Weak<Node>>>,
    down: Mutex<HashSet<SocketAddr>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn node(&self, addr: SocketAddr) -> Option<Arc<Node>> {
        if self.down.lock().unwrap().contains(&addr) {
            return None;
        }
        self.nodes.lock().unwrap().get(&addr).and_then(Weak::upgrade)
    }

    fn live(&self) -> Vec<Arc<Node>> {
        let down = self.down.lock().unwrap().clone();
        self.nodes
            .lock()
            .unwrap()
            .iter()
            .filter(|(addr, _)| !down.contains(addr))
            .filter_map(|(_, n)| n.upgrade())
            .collect()
    }

    async fn deliver(
        self: Arc<Self>,
        from: SocketAddr,
        to: SocketAddr,
        request: PeerRequest,
    ) -> Result<Bytes, ClusterError> {
        if self.down.lock().unwrap().contains(&from) {
            return Err(ClusterError::Network("sender is down".into()));
        }
        let node = self
            .node(to)
            .ok_or_else(|| ClusterError::Network(format!("{to} unreachable")))?;
        // a real transport only carries the error text back
        node.handle_request(request)
            .await
            .map_err(|e| ClusterError::Remote(e.to_string()))
    }

    /// Starts a node on this network.
    pub fn start(self: &Arc<Self>, port: u16, site: Option<u16>) -> Arc<Node> {
        self.start_with(port, site, test_config())
    }

    pub fn start_with(self: &Arc<Self>, port: u16, site: Option<u16>, config: ClusterConfig) -> Arc<Node> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let info = PeerInfo {
            id: PeerId::new(),
            addr,
            site: site.map(|s| SocketAddr::from(([10, 0, 0, 1], s))),
        };
        let transport = Arc::new(MemoryTransport {
            net: Arc::clone(self),
            from: addr,
        });
        let node = Node::start(info, config, transport).unwrap();
        node.set_discovery(Arc::new(MemoryDiscovery {
            net: Arc::downgrade(self),
            from: addr,
        }));
        self.nodes.lock().unwrap().insert(addr, Arc::downgrade(&node));
        node
    }

    /// Makes a node unreachable and stops it.
    pub fn kill(&self, node: &Node) {
        self.down.lock().unwrap().insert(node.local().addr);
        node.shutdown();
    }
}

struct MemoryTransport {
    net: Arc<MemoryNetwork>,
    from: SocketAddr,
}

impl PeerTransport for MemoryTransport {
    fn post(&self, addr: SocketAddr, request: PeerRequest) -> BoxFuture<'static, Result<Bytes, ClusterError>> {
        Box::pin(Arc::clone(&self.net).deliver(self.from, addr, request))
    }
}

/// Delivers discovery pings to every other live node.
struct MemoryDiscovery {
    net: Weak<MemoryNetwork>,
    from: SocketAddr,
}

impl Discovery for MemoryDiscovery {
    fn publish(&self, payload: Bytes) {
        let Some(net) = self.net.upgrade() else {
            return;
        };
        if net.down.lock().unwrap().contains(&self.from) {
            return;
        }
        for node in net.live() {
            if node.local().addr != self.from {
                node.ping_received(&payload);
            }
        }
    }
}

/// Timings scaled down so scenarios finish in a few seconds.
pub fn test_config() -> ClusterConfig {
    let mut config = ClusterConfig::default();
    config.membership.cycle = Duration::from_millis(20);
    config.membership.initial_allowed_gap = Duration::from_millis(600);
    config.membership.gap_adjust = Duration::from_millis(200);
    config.transfer.confirmed_timeout = Duration::from_secs(3);
    config.transfer.unconfirmed_timeout = Duration::from_millis(300);
    config.transfer.unconfirmed_grace = Duration::from_millis(100);
    config.transfer.liveness_poll = Duration::from_millis(20);
    config.locks.audit_period = Duration::from_secs(3600);
    config.locks.audit_retry = Duration::from_millis(50);
    config.locks.notify_retry = Duration::from_millis(20);
    config.outbound.request_timeout = Duration::from_secs(2);
    config
}

/// Polls `check` until it returns true or `limit` passes.
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Returns true once every node agrees on one leader, sees all the others,
/// and every bucket has an owner among them with at most one bucket of
/// skew.
pub fn settled(nodes: &[Arc<Node>]) -> bool {
    let Some(first) = nodes.first() else {
        return true;
    };
    let leader = first.leader();
    if leader.is_none() {
        return false;
    }
    let ids: HashSet<PeerId> = nodes.iter().map(|n| n.local_id()).collect();
    for node in nodes {
        let view = node.view();
        if node.leader() != leader || view.len() != nodes.len() {
            return false;
        }
        if node.buckets().iter().any(|b| b.in_transition()) {
            return false;
        }
    }
    let table = first.buckets().snapshot();
    for node in &nodes[1..] {
        if node.buckets().snapshot() != table {
            return false;
        }
    }
    if !table.iter().all(|a| a.owner.is_some_and(|o| ids.contains(&o))) {
        return false;
    }
    skew(nodes) <= 1
}

/// Max minus min owned bucket count, as seen by the first node.
pub fn skew(nodes: &[Arc<Node>]) -> usize {
    let counts: Vec<usize> = nodes
        .iter()
        .map(|n| nodes[0].buckets().owned_by(n.local_id()))
        .collect();
    let max = counts.iter().copied().max().unwrap_or(0);
    let min = counts.iter().copied().min().unwrap_or(0);
    debug_assert!(counts.iter().sum::<usize>() <= BUCKET_COUNT);
    max - min
}

/// Starts `n` nodes in one site and waits for them to settle.
pub async fn pool(net: &Arc<MemoryNetwork>, n: u16) -> Vec<Arc<Node>> {
    pool_with(net, n, test_config()).await
}

pub async fn pool_with(net: &Arc<MemoryNetwork>, n: u16, config: ClusterConfig) -> Vec<Arc<Node>> {
    let nodes: Vec<Arc<Node>> = (0..n)
        .map(|i| net.start_with(7500 + i, None, config.clone()))
        .collect();
    let ok = eventually(Duration::from_secs(15), || {
        let nodes = nodes.clone();
        async move { settled(&nodes) }
    })
    .await;
    assert!(ok, "pool of {n} did not settle");
    nodes
}

/// A key whose bucket `node` owns.
pub fn local_key(node: &Node, prefix: &str) -> String {
    (0..100_000)
        .map(|i| format!("{prefix}-{i}"))
        .find(|k| node.is_key_local(k.as_bytes()))
        .unwrap()
}
