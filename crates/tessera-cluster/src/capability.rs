//! Application hooks: bucket state migration, routed messages, and
//! application request handlers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use tracing::warn;

use crate::message::{check_str_len, Snapshot};
use crate::transport::{Outbound, PeerRequest};
use crate::{ClusterError, PeerId, PeerInfo};

/// Migrates one kind of per-bucket application state between owners.
///
/// When a bucket changes hands, the old owner calls [`generate`] on every
/// registered provider and ships the results to the new owner, which hands
/// each one to the provider with the same [`kind`].
///
/// [`generate`]: Backup::generate
/// [`kind`]: Backup::kind
pub trait Backup: Send + Sync + 'static {
    /// Name used to match snapshots to providers on the receiving side.
    fn kind(&self) -> &str;

    /// Captures the bucket's state, or `None` if there is nothing to move.
    fn generate(&self, bucket: u16) -> Option<Bytes>;

    /// Installs state captured by `generate` on another peer.
    fn restore(&self, bucket: u16, data: &[u8]) -> Result<(), ClusterError>;
}

/// A unit of work bound to a bucket.
pub trait Message: Send + 'static {
    /// Runs the message on the local peer.
    fn process(self: Box<Self>);

    /// Ships the message to the peer that owns `bucket`.
    fn send_to_peer(self: Box<Self>, peer: RemotePeer, bucket: u16);
}

/// Serves requests on an application-defined path.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, request: PeerRequest) -> Result<Bytes, ClusterError>;
}

/// Handle for sending application traffic to another peer.
#[derive(Clone)]
pub struct RemotePeer {
    info: PeerInfo,
    outbound: Arc<Outbound>,
}

impl RemotePeer {
    pub(crate) fn new(info: PeerInfo, outbound: Arc<Outbound>) -> Self {
        Self { info, outbound }
    }

    pub fn id(&self) -> PeerId {
        self.info.id
    }

    pub fn info(&self) -> &PeerInfo {
        &self.info
    }

    /// Posts a request and waits for the reply.
    pub async fn post(&self, request: PeerRequest) -> Result<Bytes, ClusterError> {
        self.outbound.post(&self.info, request).await
    }

    /// Posts a request in the background, logging any failure.
    pub fn send(&self, request: PeerRequest) {
        self.outbound.spawn_post(self.info, request);
    }
}

impl std::fmt::Debug for RemotePeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotePeer").field("info", &self.info).finish()
    }
}

/// Registered backups and request handlers.
#[derive(Default)]
pub(crate) struct Capabilities {
    backups: RwLock<Vec<Arc<dyn Backup>>>,
    handlers: RwLock<HashMap<String, Arc<dyn RequestHandler>>>,
}

impl Capabilities {
    pub(crate) fn add_backup(&self, backup: Arc<dyn Backup>) {
        let mut backups = self.backups.write().unwrap_or_else(|e| e.into_inner());
        backups.push(backup);
    }

    pub(crate) fn add_handler(&self, path: &str, handler: Arc<dyn RequestHandler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.insert(path.trim_matches('/').to_string(), handler);
    }

    pub(crate) fn handler(&self, path: &str) -> Option<Arc<dyn RequestHandler>> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.get(path).cloned()
    }

    fn backups(&self) -> Vec<Arc<dyn Backup>> {
        self.backups
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Collects a snapshot from every provider that has state for `bucket`.
    pub(crate) fn generate(&self, bucket: u16) -> Vec<Snapshot> {
        self.backups()
            .iter()
            .filter_map(|b| {
                if let Err(e) = check_str_len(b.kind()) {
                    warn!("bucket {}: skipping backup provider: {}", bucket, e);
                    return None;
                }
                b.generate(bucket).map(|data| Snapshot {
                    kind: b.kind().to_string(),
                    data,
                })
            })
            .collect()
    }

    /// Hands each snapshot to the provider of the same kind.
    pub(crate) fn restore(&self, bucket: u16, items: &[Snapshot]) {
        let backups = self.backups();
        for item in items {
            match backups.iter().find(|b| b.kind() == item.kind) {
                Some(b) => {
                    if let Err(e) = b.restore(bucket, &item.data) {
                        warn!("bucket {}: restoring '{}' failed: {}", bucket, item.kind, e);
                    }
                }
                None => warn!("bucket {}: no provider for '{}' state", bucket, item.kind),
            }
        }
    }
}
