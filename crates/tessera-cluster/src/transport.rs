//! Peer-to-peer request plumbing.
//!
//! The pool talks over a small request/reply protocol: a path, a handful of
//! query parameters, and an opaque body. [`PeerTransport`] carries it over
//! whatever wire the embedding server provides. [`Outbound`] layers the
//! per-peer concurrency bound and request timeout on top.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::{ClusterError, PeerId, PeerInfo};

/// Boxed future returned by transports.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Paths served by every peer.
pub mod paths {
    /// Gossip batch of peer descriptors.
    pub const ADMIN: &str = "admin";
    /// Election ballot table.
    pub const VOTE: &str = "vote";
    /// Bucket table update records from the leader.
    pub const BUCKET_UPDATE: &str = "bucket/update";
    /// Bucket state shipped from an old owner to a new one.
    pub const SESSION_DATA: &str = "bucket/sessionData";
    pub const LOCK_LOCK: &str = "lock/lock";
    pub const LOCK_FREE: &str = "lock/free";
    pub const LOCK_LOCKED: &str = "lock/locked";
    pub const LOCK_AUDIT: &str = "lock/audit";
}

/// One request to a peer.
#[derive(Clone, PartialEq, Eq)]
pub struct PeerRequest {
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Bytes,
}

impl PeerRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            query: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Adds a query parameter.
    pub fn param(mut self, name: &str, value: impl ToString) -> Self {
        self.query.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    /// Returns the first value of a query parameter.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Returns a required query parameter parsed as `T`.
    pub fn require<T: std::str::FromStr>(&self, name: &str) -> Result<T, ClusterError> {
        let raw = self
            .get(name)
            .ok_or_else(|| ClusterError::Protocol(format!("{}: missing '{}'", self.path, name)))?;
        raw.parse()
            .map_err(|_| ClusterError::Protocol(format!("{}: bad '{}' value '{}'", self.path, name, raw)))
    }

    /// Returns an optional query parameter parsed as `T`.
    pub fn optional<T: std::str::FromStr>(&self, name: &str) -> Result<Option<T>, ClusterError> {
        match self.get(name) {
            Some(_) => self.require(name).map(Some),
            None => Ok(None),
        }
    }

    /// Renders the path and query string, e.g. `lock/free?key=a&uuid=..`.
    /// Values are not escaped.
    pub fn target(&self) -> String {
        let mut out = self.path.clone();
        for (i, (k, v)) in self.query.iter().enumerate() {
            out.push(if i == 0 { '?' } else { '&' });
            out.push_str(k);
            out.push('=');
            out.push_str(v);
        }
        out
    }

    /// Parses a target produced by [`PeerRequest::target`].
    pub fn from_target(target: &str, body: Bytes) -> Self {
        let (path, query) = target.split_once('?').unwrap_or((target, ""));
        let query = query
            .split('&')
            .filter(|p| !p.is_empty())
            .map(|p| {
                let (k, v) = p.split_once('=').unwrap_or((p, ""));
                (k.to_string(), v.to_string())
            })
            .collect();
        Self {
            path: path.trim_matches('/').to_string(),
            query,
            body,
        }
    }
}

impl fmt::Debug for PeerRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.target(), self.body.len())
    }
}

/// Carries requests to other peers.
///
/// Implementations deliver `request` to the peer listening at `addr`, hand
/// it to that peer's `Node::handle_request`, and return the reply body.
pub trait PeerTransport: Send + Sync + 'static {
    fn post(&self, addr: SocketAddr, request: PeerRequest) -> BoxFuture<'static, Result<Bytes, ClusterError>>;
}

/// Receives this peer's gossip payload for publication to peers that are
/// not in the membership table yet.
pub trait Discovery: Send + Sync + 'static {
    fn publish(&self, payload: Bytes);
}

/// Limits for outbound requests.
#[derive(Debug, Clone)]
pub struct OutboundConfig {
    /// Concurrent requests allowed to any one peer.
    pub max_in_flight_per_peer: usize,
    /// Time limit on a single request.
    pub request_timeout: Duration,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            max_in_flight_per_peer: 10,
            request_timeout: Duration::from_secs(10),
        }
    }
}

pub struct Outbound {
    transport: Arc<dyn PeerTransport>,
    config: OutboundConfig,
    permits: Mutex<HashMap<PeerId, Arc<Semaphore>>>,
}

impl Outbound {
    pub fn new(transport: Arc<dyn PeerTransport>, config: OutboundConfig) -> Self {
        Self {
            transport,
            config,
            permits: Mutex::new(HashMap::new()),
        }
    }

    fn semaphore(&self, peer: PeerId) -> Arc<Semaphore> {
        let mut permits = self.permits.lock().unwrap_or_else(|e| e.into_inner());
        permits
            .entry(peer)
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_in_flight_per_peer)))
            .clone()
    }

    /// Forgets the concurrency state kept for a peer that left.
    pub fn forget(&self, peer: PeerId) {
        let mut permits = self.permits.lock().unwrap_or_else(|e| e.into_inner());
        permits.remove(&peer);
    }

    /// Sends a request and waits for the reply.
    ///
    /// Waits for a free slot if the peer already has the maximum number of
    /// requests in flight. The timeout covers only the transport call.
    pub async fn post(&self, peer: &PeerInfo, request: PeerRequest) -> Result<Bytes, ClusterError> {
        let semaphore = self.semaphore(peer.id);
        let _permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| ClusterError::Shutdown)?;
        let call = self.transport.post(peer.addr, request);
        tokio::time::timeout(self.config.request_timeout, call)
            .await
            .map_err(|_| ClusterError::Timeout)?
    }

    /// Sends a request in the background. Failures are logged and dropped.
    pub fn spawn_post(self: &Arc<Self>, peer: PeerInfo, request: PeerRequest) {
        let outbound = Arc::clone(self);
        tokio::spawn(async move {
            let target = request.path.clone();
            if let Err(e) = outbound.post(&peer, request).await {
                debug!("{} to {} failed: {}", target, peer.id, e);
            }
        });
    }
}
