//! Peer identity and the per-peer record kept by the membership table.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use uuid::Uuid;

/// Unique identifier for a server in the pool.
///
/// Wraps a UUID v4. Ordering follows the UUID bytes, which gives every peer
/// the same view of the sorted ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub Uuid);

impl PeerId {
    /// Generates a new random peer ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a peer ID from a UUID string.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // short form, like a git hash
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Where a peer can be reached and which site it lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addr: SocketAddr,
    /// Site address. Peers sharing a site address are in the same site;
    /// peers with no site address form one implicit site.
    pub site: Option<SocketAddr>,
}

impl PeerInfo {
    /// Returns true if both peers live in the same site.
    pub fn same_site(&self, other: &PeerInfo) -> bool {
        self.site == other.site
    }
}

/// A peer as tracked by membership.
///
/// Records are never deleted; a peer that times out moves to the failed set
/// so a stale descriptor cannot bring it back.
#[derive(Debug, Clone)]
pub struct Peer {
    pub info: PeerInfo,
    /// Liveness counter, bumped by the peer itself once per cycle.
    pub count: u32,
    /// When the counter last advanced.
    pub last_update: Instant,
    /// Silence longer than this marks the peer failed.
    pub allowed_gap: Duration,
    pub active: bool,
}

impl Peer {
    pub fn new(info: PeerInfo, count: u32, allowed_gap: Duration, now: Instant) -> Self {
        Self {
            info,
            count,
            last_update: now,
            allowed_gap,
            active: true,
        }
    }

    pub fn id(&self) -> PeerId {
        self.info.id
    }

    /// Returns true if the peer has been silent longer than its allowed gap.
    pub fn is_overdue(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_update) > self.allowed_gap
    }
}
