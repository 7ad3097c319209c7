//! A running pool member.
//!
//! [`Node`] ties the pieces together: it owns the event loop task, the
//! bucket table, the outbound request layer and the lock manager, and it is
//! the entry point for both application calls and inbound peer requests.

use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bucket::{bucket_number, BucketTable, Route};
use crate::capability::{Backup, Capabilities, Message, RemotePeer, RequestHandler};
use crate::event_loop::{Core, MainLoop};
use crate::events::{ClusterEvent, ClusterObserver, Observers};
use crate::lock::LockManager;
use crate::message::{Ballot, PeerDescriptor};
use crate::transfer::{self, TransferKind};
use crate::transport::{paths, Discovery, Outbound, PeerRequest, PeerTransport};
use crate::{ClusterConfig, ClusterError, PeerId, PeerInfo};

/// Point-in-time view of the pool, published by the event loop.
#[derive(Debug, Clone)]
pub struct ClusterView {
    pub local: PeerId,
    /// Active peers including ourselves, sorted by id.
    pub peers: Vec<PeerInfo>,
    pub leader: Option<PeerId>,
}

impl ClusterView {
    pub fn new(local: PeerId, peers: Vec<PeerInfo>, leader: Option<PeerId>) -> Self {
        Self {
            local,
            peers,
            leader,
        }
    }

    pub fn peer(&self, id: &PeerId) -> Option<PeerInfo> {
        self.index_of(id).map(|i| self.peers[i])
    }

    pub fn is_active(&self, id: &PeerId) -> bool {
        self.index_of(id).is_some()
    }

    /// Position of `id` in the sorted peer list.
    pub fn index_of(&self, id: &PeerId) -> Option<usize> {
        self.peers.binary_search_by(|p| p.id.cmp(id)).ok()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Where a request concerning a bucket has to be handled.
pub(crate) enum Destination {
    Local,
    Remote(PeerInfo),
}

/// State shared by the node, its event loop, and background tasks.
pub(crate) struct Shared {
    pub(crate) local: PeerInfo,
    pub(crate) config: ClusterConfig,
    pub(crate) buckets: BucketTable,
    pub(crate) outbound: Arc<Outbound>,
    pub(crate) capabilities: Capabilities,
    pub(crate) observers: Observers,
    pub(crate) main_loop: MainLoop,
    pub(crate) rebalance_generation: AtomicU64,
    view: RwLock<Arc<ClusterView>>,
    discovery: RwLock<Option<Arc<dyn Discovery>>>,
}

impl Shared {
    pub(crate) fn local_id(&self) -> PeerId {
        self.local.id
    }

    pub(crate) fn view(&self) -> Arc<ClusterView> {
        self.view.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn publish_view(&self, view: ClusterView) {
        *self.view.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(view);
    }

    pub(crate) fn discovery(&self) -> Option<Arc<dyn Discovery>> {
        self.discovery
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Owned locally, or not owned by anyone.
    pub(crate) fn is_local(&self, bucket: u16) -> bool {
        self.buckets
            .owner(bucket)
            .map_or(true, |owner| owner == self.local.id)
    }

    /// Owner of `bucket`, with unowned buckets attributed to us.
    pub(crate) fn owner_or_local(&self, bucket: u16) -> PeerId {
        self.buckets.owner(bucket).unwrap_or(self.local.id)
    }

    /// Resolves where a request for `bucket` must go.
    ///
    /// An incoming transfer means the bucket's state is not here yet, so
    /// the caller gets [`ClusterError::BucketInTransition`]. An outgoing
    /// transfer sends requests to the new owner.
    pub(crate) fn destination(&self, bucket: u16) -> Result<Destination, ClusterError> {
        let b = self
            .buckets
            .get(bucket)
            .ok_or_else(|| ClusterError::Protocol(format!("bucket {bucket} out of range")))?;
        let target = {
            let slot = b.lock_slot();
            match slot.state.as_deref().map(|t| &t.kind) {
                Some(TransferKind::NewOwner(_)) => {
                    return Err(ClusterError::BucketInTransition(bucket))
                }
                Some(TransferKind::OldOwner { new_owner }) => Some(*new_owner),
                None => slot.assignment.owner.filter(|o| *o != self.local.id),
            }
        };
        match target {
            None => Ok(Destination::Local),
            Some(peer) => self
                .view()
                .peer(&peer)
                .map(Destination::Remote)
                .ok_or(ClusterError::UnknownPeer(peer)),
        }
    }
}

/// Outcome of [`Node::route`].
pub enum Routed {
    /// The caller should process the message here.
    Local(Box<dyn Message>),
    /// The message was sent to the owning peer.
    Remote(PeerId),
    /// The message is waiting for the bucket's incoming transfer to finish.
    Queued,
}

impl std::fmt::Debug for Routed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Routed::Local(_) => write!(f, "Local"),
            Routed::Remote(p) => write!(f, "Remote({p})"),
            Routed::Queued => write!(f, "Queued"),
        }
    }
}

fn route_inner(shared: &Arc<Shared>, bucket: u16, message: Box<dyn Message>) -> Result<Routed, ClusterError> {
    match shared.buckets.route(bucket, shared.local.id, message) {
        Route::Local(message) => Ok(Routed::Local(message)),
        Route::Queued => Ok(Routed::Queued),
        Route::Remote(peer, message) => {
            let info = shared
                .view()
                .peer(&peer)
                .ok_or(ClusterError::UnknownPeer(peer))?;
            message.send_to_peer(RemotePeer::new(info, shared.outbound.clone()), bucket);
            Ok(Routed::Remote(peer))
        }
    }
}

/// Routes a message and processes it here if this peer is responsible.
pub(crate) fn dispatch(shared: &Arc<Shared>, bucket: u16, message: Box<dyn Message>) {
    match route_inner(shared, bucket, message) {
        Ok(Routed::Local(message)) => message.process(),
        Ok(_) => {}
        Err(e) => warn!("bucket {}: message dropped: {}", bucket, e),
    }
}

/// A member of the server pool.
pub struct Node {
    shared: Arc<Shared>,
    locks: Arc<LockManager>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("local", &self.shared.local)
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Starts a node and its event loop. Must be called from within a
    /// tokio runtime.
    pub fn start(
        local: PeerInfo,
        config: ClusterConfig,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Arc<Self>, ClusterError> {
        config.validate()?;
        let (main_loop, work_rx) = MainLoop::new();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            local,
            outbound: Arc::new(Outbound::new(transport, config.outbound.clone())),
            config,
            buckets: BucketTable::new(),
            capabilities: Capabilities::default(),
            observers: Observers::default(),
            main_loop,
            rebalance_generation: AtomicU64::new(0),
            view: RwLock::new(Arc::new(ClusterView::new(local.id, vec![local], None))),
            discovery: RwLock::new(None),
        });

        let core = Core::new(shared.clone());
        let event_loop = tokio::spawn(core.run(work_rx, shutdown_rx.clone()));
        let (locks, lock_tasks) = LockManager::start(shared.clone(), shutdown_rx);

        let mut tasks = vec![event_loop];
        tasks.extend(lock_tasks);
        info!("node {} started on {}", local.id, local.addr);

        Ok(Arc::new(Self {
            shared,
            locks,
            shutdown,
            tasks: Mutex::new(tasks),
        }))
    }

    pub fn local_id(&self) -> PeerId {
        self.shared.local.id
    }

    pub fn local(&self) -> PeerInfo {
        self.shared.local
    }

    /// Latest view of active peers and the leader.
    pub fn view(&self) -> Arc<ClusterView> {
        self.shared.view()
    }

    pub fn leader(&self) -> Option<PeerId> {
        self.shared.view().leader
    }

    pub fn buckets(&self) -> &BucketTable {
        &self.shared.buckets
    }

    pub fn bucket_owner(&self, bucket: u16) -> Option<PeerId> {
        self.shared.buckets.owner(bucket)
    }

    /// Returns true if requests for `key` are handled by this peer. Keys in
    /// unowned buckets count as local.
    pub fn is_key_local(&self, key: &[u8]) -> bool {
        self.shared.is_local(bucket_number(key))
    }

    /// Decides where `message` goes and sends it there if it is remote.
    pub fn route(&self, bucket: u16, message: Box<dyn Message>) -> Result<Routed, ClusterError> {
        route_inner(&self.shared, bucket, message)
    }

    /// Routes `message`, processing it here if this peer is responsible.
    pub fn route_or_handle(&self, bucket: u16, message: Box<dyn Message>) -> Result<(), ClusterError> {
        match self.route(bucket, message)? {
            Routed::Local(message) => message.process(),
            Routed::Remote(peer) => debug!("bucket {}: message sent to {}", bucket, peer),
            Routed::Queued => debug!("bucket {}: message queued", bucket),
        }
        Ok(())
    }

    /// [`Node::route_or_handle`] for the bucket `key` hashes to.
    pub fn route_key_or_handle(&self, key: &[u8], message: Box<dyn Message>) -> Result<(), ClusterError> {
        self.route_or_handle(bucket_number(key), message)
    }

    /// Registers per-bucket state to migrate on ownership changes.
    pub fn register_backup(&self, backup: Arc<dyn Backup>) {
        self.shared.capabilities.add_backup(backup);
    }

    /// Serves an application path on [`Node::handle_request`].
    pub fn register_handler(&self, path: &str, handler: Arc<dyn RequestHandler>) {
        self.shared.capabilities.add_handler(path, handler);
    }

    pub fn add_observer(&self, observer: Arc<dyn ClusterObserver>) {
        self.shared.observers.add(observer);
    }

    /// Subscribes to membership and leadership events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.shared.observers.subscribe()
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Installs the publisher for this peer's discovery pings.
    pub fn set_discovery(&self, discovery: Arc<dyn Discovery>) {
        *self
            .shared
            .discovery
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(discovery);
    }

    /// Feeds a discovery ping (an `admin` payload) into membership.
    pub fn ping_received(&self, payload: &[u8]) {
        self.submit_descriptors(payload);
    }

    fn submit_descriptors(&self, payload: &[u8]) {
        let decoded = PeerDescriptor::decode_batch(payload);
        if let Some(e) = &decoded.error {
            debug!("gossip payload: {}", e);
        }
        if decoded.items.is_empty() {
            return;
        }
        let descriptors = decoded.items;
        let _ = self
            .shared
            .main_loop
            .submit(move |core| core.merge(&descriptors));
    }

    /// Serves a request from another peer.
    pub async fn handle_request(&self, request: PeerRequest) -> Result<Bytes, ClusterError> {
        match request.path.as_str() {
            paths::ADMIN => {
                self.submit_descriptors(&request.body);
                Ok(Bytes::new())
            }
            paths::VOTE => {
                let decoded = Ballot::decode_batch(&request.body);
                if let Some(e) = &decoded.error {
                    debug!("vote payload: {}", e);
                }
                let ballots = decoded.items;
                self.shared
                    .main_loop
                    .submit(move |core| core.receive_ballots(&ballots))?;
                Ok(Bytes::new())
            }
            paths::BUCKET_UPDATE => {
                let body = request.body;
                self.shared
                    .main_loop
                    .submit(move |core| core.receive_update(body))?;
                Ok(Bytes::new())
            }
            paths::SESSION_DATA => transfer::receive_session_data(&self.shared, &request),
            paths::LOCK_LOCK => self.locks.handle_lock(&request).await,
            paths::LOCK_FREE => self.locks.handle_free(&request).await,
            paths::LOCK_LOCKED => self.locks.handle_locked(&request).await,
            paths::LOCK_AUDIT => self.locks.handle_audit(&request).await,
            other => match self.shared.capabilities.handler(other) {
                Some(handler) => handler.handle(request),
                None => Err(ClusterError::UnknownPath(other.to_string())),
            },
        }
    }

    /// Waits until everything submitted to the event loop so far has run.
    pub async fn flush(&self) -> Result<(), ClusterError> {
        self.shared.main_loop.call(|_| ()).await
    }

    /// Stops the event loop and background tasks.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }
        info!("node {} shut down", self.shared.local.id);
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
