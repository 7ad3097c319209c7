//! Seed-list discovery.
//!
//! Until membership knows enough peers, the node's gossip payload is posted
//! as an `admin` request to every configured seed. A seed that merges it
//! starts gossiping back, and from then on regular gossip takes over.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tessera_cluster::{paths, Discovery, PeerRequest, PeerTransport};
use tracing::trace;

pub struct SeedDiscovery {
    seeds: Vec<SocketAddr>,
    transport: Arc<dyn PeerTransport>,
}

impl SeedDiscovery {
    /// Drops `local` from `seeds` so a node never announces to itself.
    pub fn new(seeds: Vec<SocketAddr>, local: SocketAddr, transport: Arc<dyn PeerTransport>) -> Self {
        let seeds = seeds.into_iter().filter(|s| *s != local).collect();
        Self { seeds, transport }
    }

    pub fn seeds(&self) -> &[SocketAddr] {
        &self.seeds
    }
}

impl Discovery for SeedDiscovery {
    fn publish(&self, payload: Bytes) {
        for &seed in &self.seeds {
            let request = PeerRequest::new(paths::ADMIN).with_body(payload.clone());
            let post = self.transport.post(seed, request);
            tokio::spawn(async move {
                // seeds that are not up yet are expected
                if let Err(e) = post.await {
                    trace!("announce to seed {} failed: {}", seed, e);
                }
            });
        }
    }
}
