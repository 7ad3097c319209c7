//! Membership table and counter-based gossip.
//!
//! Every cycle each peer bumps its own liveness counter and sends the
//! descriptors it knows about to its notify list. A descriptor is only
//! accepted when its counter is higher than the one already recorded, so
//! stale or replayed gossip never refreshes a peer.
//!
//! Failure detection is adaptive: each peer carries its own allowed gap,
//! re-estimated from the spacing of accepted updates. A peer silent for
//! longer than its gap moves to the failed set, where it stays until a
//! descriptor with a newer counter shows up.
//!
//! # Notify list
//!
//! Within the local site, peers are sorted by id into a ring and the local
//! peer contacts the peers 1, 2, 4, 8, ... positions ahead of itself. One
//! peer from every other site is added on top, so gossip crosses sites
//! every cycle while fan-out stays O(log n).

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::prelude::IndexedRandom;
use tracing::{debug, info, trace, warn};

use crate::message::PeerDescriptor;
use crate::{Peer, PeerId, PeerInfo};

/// Configuration for membership and gossip.
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    /// Length of one event loop cycle; gossip is sent once per cycle.
    pub cycle: Duration,
    /// Allowed gap assigned to a peer on first sighting.
    pub initial_allowed_gap: Duration,
    /// Constant added to the scaled gap when the estimate grows.
    pub gap_adjust: Duration,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            cycle: Duration::from_secs(1),
            initial_allowed_gap: Duration::from_secs(30),
            gap_adjust: Duration::from_secs(1),
        }
    }
}

/// What changed after merging a gossip batch.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Peers seen for the first time, or re-admitted from the failed set.
    pub joined: Vec<PeerId>,
    /// Number of descriptors that advanced a known peer's counter.
    pub updated: usize,
}

/// The local view of the pool.
pub struct Membership {
    local: PeerInfo,
    config: MembershipConfig,
    /// Our own liveness counter.
    count: u32,
    /// Active remote peers, sorted by id.
    peers: BTreeMap<PeerId, Peer>,
    /// Peers that timed out. Kept forever so old descriptors cannot
    /// resurrect them.
    failed: HashMap<PeerId, Peer>,
}

impl Membership {
    pub fn new(local: PeerInfo, config: MembershipConfig) -> Self {
        Self {
            local,
            config,
            count: 0,
            peers: BTreeMap::new(),
            failed: HashMap::new(),
        }
    }

    pub fn local(&self) -> &PeerInfo {
        &self.local
    }

    pub fn local_id(&self) -> PeerId {
        self.local.id
    }

    /// Our current liveness counter.
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn config(&self) -> &MembershipConfig {
        &self.config
    }

    /// Active remote peers, sorted by id.
    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn get(&self, id: &PeerId) -> Option<&Peer> {
        self.peers.get(id)
    }

    /// Returns true if `id` is us or an active peer.
    pub fn is_active(&self, id: &PeerId) -> bool {
        *id == self.local.id || self.peers.contains_key(id)
    }

    pub fn is_failed(&self, id: &PeerId) -> bool {
        self.failed.contains_key(id)
    }

    /// Number of active peers including ourselves.
    pub fn len(&self) -> usize {
        self.peers.len() + 1
    }

    /// Always false; the local peer is always a member.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Every active peer including ourselves, sorted by id.
    pub fn active_infos(&self) -> Vec<PeerInfo> {
        let mut infos: Vec<PeerInfo> = self.peers.values().map(|p| p.info).collect();
        let pos = infos
            .binary_search_by(|p| p.id.cmp(&self.local.id))
            .unwrap_or_else(|pos| pos);
        infos.insert(pos, self.local);
        infos
    }

    /// Sorted ids of every active peer including ourselves.
    pub fn active_ids(&self) -> Vec<PeerId> {
        self.active_infos().into_iter().map(|p| p.id).collect()
    }

    /// Bumps the local liveness counter. Called once per cycle.
    pub fn advance(&mut self) -> u32 {
        self.count = self.count.wrapping_add(1);
        self.count
    }

    /// Descriptor for the local peer at its current counter.
    pub fn local_descriptor(&self) -> PeerDescriptor {
        PeerDescriptor {
            id: self.local.id,
            count: self.count,
            addr: self.local.addr,
            site: self.local.site,
        }
    }

    /// Descriptors for ourselves and every active peer, as sent in `admin`.
    pub fn descriptors(&self) -> Vec<PeerDescriptor> {
        let mut out = Vec::with_capacity(self.len());
        out.push(self.local_descriptor());
        out.extend(self.peers.values().map(|p| PeerDescriptor {
            id: p.info.id,
            count: p.count,
            addr: p.info.addr,
            site: p.info.site,
        }));
        out
    }

    /// Merges a gossip batch into the table.
    pub fn merge(&mut self, descriptors: &[PeerDescriptor], now: Instant) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        for d in descriptors {
            if d.id == self.local.id {
                continue;
            }
            let info = PeerInfo {
                id: d.id,
                addr: d.addr,
                site: d.site,
            };

            if let Some(peer) = self.peers.get_mut(&d.id) {
                if d.count <= peer.count {
                    trace!("ignoring stale descriptor for {} ({} <= {})", d.id, d.count, peer.count);
                    continue;
                }
                let gap = now.saturating_duration_since(peer.last_update);
                peer.allowed_gap = adjust_gap(peer.allowed_gap, gap, self.config.gap_adjust);
                peer.count = d.count;
                peer.last_update = now;
                if peer.info != info {
                    debug!("peer {} moved to {}", d.id, d.addr);
                    peer.info = info;
                }
                outcome.updated += 1;
                continue;
            }

            if let Some(dead) = self.failed.get(&d.id) {
                if d.count <= dead.count {
                    continue;
                }
                info!("failed peer {} is back (counter {} > {})", d.id, d.count, dead.count);
                self.failed.remove(&d.id);
            } else {
                info!("new peer {} at {}", d.id, d.addr);
            }

            self.peers.insert(
                d.id,
                Peer::new(info, d.count, self.config.initial_allowed_gap, now),
            );
            outcome.joined.push(d.id);
        }
        outcome
    }

    /// Moves every peer whose silence exceeds its allowed gap to the failed
    /// set and returns their ids.
    pub fn detect_failures(&mut self, now: Instant) -> Vec<PeerId> {
        let overdue: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| p.is_overdue(now))
            .map(|p| p.id())
            .collect();

        for id in &overdue {
            if let Some(mut peer) = self.peers.remove(id) {
                warn!(
                    "peer {} failed: silent for {:?} (allowed {:?})",
                    id,
                    now.saturating_duration_since(peer.last_update),
                    peer.allowed_gap
                );
                peer.active = false;
                self.failed.insert(*id, peer);
            }
        }
        overdue
    }

    /// Peers to gossip to this cycle. Never includes ourselves.
    pub fn notify_list(&self) -> Vec<PeerInfo> {
        let all = self.active_infos();
        let mut list = Vec::new();

        let same_site: Vec<&PeerInfo> = all.iter().filter(|p| p.same_site(&self.local)).collect();
        let n = same_site.len();
        if let Some(me) = same_site.iter().position(|p| p.id == self.local.id) {
            let mut offset = 1;
            while offset < n {
                list.push(*same_site[(me + offset) % n]);
                offset *= 2;
            }
        }

        let mut other_sites: BTreeMap<Option<SocketAddr>, Vec<PeerInfo>> = BTreeMap::new();
        for p in all.iter().filter(|p| !p.same_site(&self.local)) {
            other_sites.entry(p.site).or_default().push(*p);
        }
        let mut rng = rand::rng();
        for members in other_sites.values() {
            if let Some(p) = members.choose(&mut rng) {
                list.push(*p);
            }
        }
        list
    }
}

/// Re-estimates a peer's allowed gap from the spacing of its last update.
///
/// Grows immediately to `1.5 * gap + adjust` when that exceeds the current
/// estimate, otherwise decays toward the observed gap by 1/16 per update.
pub fn adjust_gap(current: Duration, gap: Duration, adjust: Duration) -> Duration {
    let grown = gap * 3 / 2 + adjust;
    if grown > current {
        grown
    } else {
        (current * 15 + gap) / 16
    }
}
