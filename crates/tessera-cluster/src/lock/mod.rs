//! Distributed lock manager.
//!
//! Every lock attempt is tracked twice. The requester side lives in the
//! bucket of the requester key (a [`LocalLocks`](client::LocalLocks)
//! adjunct) and holds the attempt's state plus a weak reference to the
//! caller's [`Lock`] handle. The lock side lives in the bucket of the lock
//! key (a [`GlobalLocks`](server::GlobalLocks) adjunct) and holds the
//! current holder and a FIFO queue of waiters.
//!
//! Both tables migrate with their buckets. A periodic audit compares them
//! across peers and corrects whatever drifted apart.

mod audit;
mod backup;
mod client;
mod server;

use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bucket::bucket_number;
use crate::events::ClusterObserver;
use crate::message::{check_str_len, AuditData, LockReply};
use crate::node::{Destination, Shared};
use crate::transport::{paths, PeerRequest};
use crate::{ClusterError, PeerId};

use backup::LockBackup;
use client::{ClientRecord, LocalLocks, LockInner};
use server::GlobalLocks;

pub use client::Lock;

/// Unique identity of one lock attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockIdentity {
    /// The key being locked.
    pub key: String,
    /// The key whose owner keeps the requester-side record.
    pub owner_key: String,
    pub uuid: Uuid,
}

impl LockIdentity {
    /// A fresh attempt on `key` on behalf of `owner_key`.
    pub fn new(key: impl Into<String>, owner_key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            owner_key: owner_key.into(),
            uuid: Uuid::new_v4(),
        }
    }

    fn key_bucket(&self) -> u16 {
        bucket_number(self.key.as_bytes())
    }

    fn home_bucket(&self) -> u16 {
        bucket_number(self.owner_key.as_bytes())
    }

    fn request(&self, path: &str, ttl: u32) -> PeerRequest {
        PeerRequest::new(path)
            .param("key", &self.key)
            .param("owner", &self.owner_key)
            .param("uuid", self.uuid)
            .param("ttl", ttl)
    }

    fn from_request(request: &PeerRequest) -> Result<Self, ClusterError> {
        Ok(Self {
            key: request.require("key")?,
            owner_key: request.require("owner")?,
            uuid: request.require("uuid")?,
        })
    }
}

impl std::fmt::Display for LockIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{} ({})", self.key, self.owner_key, self.uuid)
    }
}

/// State of a lock attempt.
///
/// Moves forward only: `Waiting` to `Active`, and either of those to `Free`
/// or `Lost`. `Free` and `Lost` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Queued behind the current holder.
    Waiting,
    /// Held.
    Active,
    /// Released, or never granted.
    Free,
    /// Taken away by the audit after the two sides disagreed.
    Lost,
}

impl LockState {
    pub fn is_final(self) -> bool {
        matches!(self, LockState::Free | LockState::Lost)
    }

    /// Returns true if a record in this state can move to `next`.
    pub fn can_become(self, next: LockState) -> bool {
        match self {
            LockState::Waiting => next != LockState::Waiting,
            LockState::Active => next.is_final(),
            LockState::Free | LockState::Lost => false,
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            LockState::Waiting => 1,
            LockState::Active => 2,
            LockState::Free => 3,
            LockState::Lost => 4,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(LockState::Waiting),
            2 => Some(LockState::Active),
            3 => Some(LockState::Free),
            4 => Some(LockState::Lost),
            _ => None,
        }
    }
}

/// Lock timing.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Time between audits.
    pub audit_period: Duration,
    /// Delay before auditing after membership changes, so ownership can
    /// settle first.
    pub audit_grace: Duration,
    /// Delay before re-checking identities the other side did not confirm.
    pub audit_retry: Duration,
    /// Hop limit for forwarded lock requests.
    pub forward_ttl: u32,
    /// Delay between attempts to notify a promoted waiter.
    pub notify_retry: Duration,
    pub notify_attempts: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            audit_period: Duration::from_secs(300),
            audit_grace: Duration::from_secs(60),
            audit_retry: Duration::from_secs(5),
            forward_ttl: 5,
            notify_retry: Duration::from_secs(1),
            notify_attempts: 5,
        }
    }
}

/// Notified when a lock attempt is granted or taken away. Both methods
/// default to doing nothing.
pub trait LockCallback: Send + Sync + 'static {
    /// The attempt became the holder.
    fn lock_available(&self, _identity: &LockIdentity) {}

    /// The attempt was refused, or the lock was lost.
    fn lock_unavailable(&self, _identity: &LockIdentity) {}
}

/// Reschedules the audit on membership changes.
struct AuditTrigger(Arc<Notify>);

impl ClusterObserver for AuditTrigger {
    fn new_server(&self, _peer: PeerId) {
        self.0.notify_one();
    }

    fn server_failed(&self, _peer: PeerId) {
        self.0.notify_one();
    }
}

/// Acquires and releases locks, serves the `lock/*` paths, and runs the
/// audit.
pub struct LockManager {
    shared: Arc<Shared>,
    cleanup: mpsc::UnboundedSender<LockIdentity>,
    me: Weak<LockManager>,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("local", &self.shared.local.id)
            .finish_non_exhaustive()
    }
}

impl LockManager {
    pub(crate) fn start(
        shared: Arc<Shared>,
        shutdown: watch::Receiver<bool>,
    ) -> (Arc<Self>, Vec<JoinHandle<()>>) {
        let (cleanup, cleanup_rx) = mpsc::unbounded_channel();
        let manager = Arc::new_cyclic(|me| Self {
            shared: shared.clone(),
            cleanup,
            me: me.clone(),
        });

        let reschedule = Arc::new(Notify::new());
        shared
            .capabilities
            .add_backup(Arc::new(LockBackup::new(Arc::downgrade(&manager))));
        shared
            .observers
            .add(Arc::new(AuditTrigger(reschedule.clone())));

        let tasks = vec![
            tokio::spawn(run_cleanup(
                Arc::downgrade(&manager),
                cleanup_rx,
                shutdown.clone(),
            )),
            tokio::spawn(audit::run(Arc::downgrade(&manager), reschedule, shutdown)),
        ];
        (manager, tasks)
    }

    fn config(&self) -> &LockConfig {
        &self.shared.config.locks
    }

    fn local_locks(&self, bucket: u16) -> Option<Arc<LocalLocks>> {
        self.shared.buckets.get(bucket).map(|b| b.adjunct::<LocalLocks>())
    }

    fn global_locks(&self, bucket: u16) -> Option<Arc<GlobalLocks>> {
        self.shared.buckets.get(bucket).map(|b| b.adjunct::<GlobalLocks>())
    }

    /// Requests the lock on `key` for `owner_key`.
    ///
    /// `owner_key` must hash to a bucket this peer owns; its bucket keeps
    /// the requester-side record. With `wait` false the returned lock is
    /// [`LockState::Free`] if someone else holds it. With `wait` true it may
    /// be [`LockState::Waiting`]; use [`Lock::wait_for_grant`].
    pub async fn acquire(
        &self,
        key: &str,
        owner_key: &str,
        wait: bool,
        callback: Option<Arc<dyn LockCallback>>,
    ) -> Result<Lock, ClusterError> {
        check_str_len(key)?;
        check_str_len(owner_key)?;
        let identity = LockIdentity::new(key, owner_key);
        let home = identity.home_bucket();
        match self.shared.destination(home)? {
            Destination::Local => {}
            Destination::Remote(_) => {
                return Err(ClusterError::NotLocal {
                    key: owner_key.to_string(),
                })
            }
        }

        let inner = LockInner::new(
            identity.clone(),
            LockState::Waiting,
            callback,
            self.me.clone(),
            self.cleanup.clone(),
        );
        let locals = self
            .local_locks(home)
            .ok_or_else(|| ClusterError::Protocol(format!("bucket {home} out of range")))?;
        locals.insert(ClientRecord::attached(&inner));
        let lock = Lock::from_inner(inner);

        let reply = match self.request_lock(&identity, wait, self.config().forward_ttl).await {
            Ok(reply) => reply,
            Err(e) => {
                locals.remove(&identity.uuid);
                lock.inner().advance(LockState::Free);
                return Err(e);
            }
        };
        debug!("lock {}: {:?}", identity, reply);

        match reply {
            LockReply::Active => {
                locals.advance(&identity.uuid, LockState::Active);
                lock.inner().advance(LockState::Active);
            }
            LockReply::Waiting => {}
            LockReply::Unavailable => {
                locals.remove(&identity.uuid);
                lock.inner().advance(LockState::Free);
                if let Some(cb) = lock.inner().callback() {
                    cb.lock_unavailable(&identity);
                }
            }
        }
        Ok(lock)
    }

    /// Sends the lock request to the owner of the lock key.
    async fn request_lock(
        &self,
        identity: &LockIdentity,
        wait: bool,
        ttl: u32,
    ) -> Result<LockReply, ClusterError> {
        match self.shared.destination(identity.key_bucket())? {
            Destination::Local => Ok(self.lock_here(identity, wait)),
            Destination::Remote(peer) => {
                let request = identity
                    .request(paths::LOCK_LOCK, ttl)
                    .param("wait", wait);
                let reply = self.shared.outbound.post(&peer, request).await?;
                Ok(LockReply::decode(&reply)?)
            }
        }
    }

    fn lock_here(&self, identity: &LockIdentity, wait: bool) -> LockReply {
        match self.global_locks(identity.key_bucket()) {
            Some(globals) => globals.lock(identity, wait),
            None => LockReply::Unavailable,
        }
    }

    /// Releases the attempt: drops the requester-side record and frees the
    /// lock at the lock key's owner.
    pub async fn release(&self, identity: &LockIdentity) -> Result<(), ClusterError> {
        if self.take_record(identity).is_none() {
            debug!("lock {}: no requester record to remove", identity);
        }
        self.free_at_owner(identity, self.config().forward_ttl).await
    }

    /// Removes the requester-side record, looking in the home bucket first
    /// and then in every bucket in case it migrated.
    fn take_record(&self, identity: &LockIdentity) -> Option<ClientRecord> {
        let home = identity.home_bucket();
        if let Some(record) = self
            .shared
            .buckets
            .get(home)
            .and_then(|b| b.adjunct_if_present::<LocalLocks>())
            .and_then(|locals| locals.remove(&identity.uuid))
        {
            return Some(record);
        }
        self.shared
            .buckets
            .iter()
            .filter(|b| b.index() != home)
            .filter_map(|b| b.adjunct_if_present::<LocalLocks>())
            .find_map(|locals| locals.remove(&identity.uuid))
    }

    async fn free_at_owner(&self, identity: &LockIdentity, ttl: u32) -> Result<(), ClusterError> {
        match self.shared.destination(identity.key_bucket())? {
            Destination::Local => {
                self.free_here(identity);
                Ok(())
            }
            Destination::Remote(peer) => {
                let request = identity.request(paths::LOCK_FREE, ttl);
                self.shared.outbound.post(&peer, request).await.map(|_| ())
            }
        }
    }

    /// Frees the lock on this peer and notifies whoever was promoted.
    fn free_here(&self, identity: &LockIdentity) {
        let promoted = self
            .shared
            .buckets
            .get(identity.key_bucket())
            .and_then(|b| b.adjunct_if_present::<GlobalLocks>())
            .and_then(|globals| globals.free(identity));
        if let Some(next) = promoted {
            self.spawn_notify(next);
        }
    }

    fn spawn_notify(&self, next: LockIdentity) {
        let Some(manager) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move { manager.notify_promoted(next).await });
    }

    /// Tells a promoted waiter's requester side that it now holds the lock.
    /// If the requester no longer knows the attempt, the lock is freed
    /// again.
    async fn notify_promoted(&self, next: LockIdentity) {
        let config = self.config().clone();
        for attempt in 1..=config.notify_attempts {
            match self.mark_locked_at_owner(&next, config.forward_ttl).await {
                Ok(true) => {
                    debug!("lock {}: promoted", next);
                    return;
                }
                Ok(false) => {
                    info!("lock {}: requester is gone, freeing", next);
                    self.free_here(&next);
                    return;
                }
                Err(e) => {
                    debug!("lock {}: promotion notice attempt {} failed: {}", next, attempt, e);
                    tokio::time::sleep(config.notify_retry).await;
                }
            }
        }
        warn!(
            "lock {}: requester never acknowledged promotion, leaving it to the audit",
            next
        );
    }

    async fn mark_locked_at_owner(&self, identity: &LockIdentity, ttl: u32) -> Result<bool, ClusterError> {
        match self.shared.destination(identity.home_bucket())? {
            Destination::Local => Ok(self.mark_locked(identity)),
            Destination::Remote(peer) => {
                let request = identity.request(paths::LOCK_LOCKED, ttl);
                let reply = self.shared.outbound.post(&peer, request).await?;
                Ok(reply.first() == Some(&1))
            }
        }
    }

    /// Moves the requester-side record to active. Returns false if there
    /// is no such record.
    fn mark_locked(&self, identity: &LockIdentity) -> bool {
        let Some(locals) = self
            .shared
            .buckets
            .get(identity.home_bucket())
            .and_then(|b| b.adjunct_if_present::<LocalLocks>())
        else {
            return false;
        };
        match locals.advance(&identity.uuid, LockState::Active) {
            Some(handle) => {
                if let Some(inner) = handle.upgrade() {
                    inner.advance(LockState::Active);
                }
                true
            }
            None => false,
        }
    }

    /// Marks an attempt lost and forgets it on the requester side.
    fn mark_lost(&self, identity: &LockIdentity) {
        if let Some(record) = self
            .shared
            .buckets
            .get(identity.home_bucket())
            .and_then(|b| b.adjunct_if_present::<LocalLocks>())
            .and_then(|locals| locals.remove(&identity.uuid))
        {
            if let Some(inner) = record.handle() {
                inner.lose();
            }
        }
    }

    /// Attaches a new handle to a requester-side record that arrived with a
    /// migrated bucket. Returns `None` if there is no such record or it
    /// already has a live handle.
    pub fn adopt(
        &self,
        identity: &LockIdentity,
        callback: Option<Arc<dyn LockCallback>>,
    ) -> Option<Lock> {
        let locals = self
            .shared
            .buckets
            .get(identity.home_bucket())?
            .adjunct_if_present::<LocalLocks>()?;
        locals.attach(&identity.uuid, |state| {
            LockInner::new(
                identity.clone(),
                state,
                callback,
                self.me.clone(),
                self.cleanup.clone(),
            )
        })
        .map(Lock::from_inner)
    }

    /// Requester-side records with no live handle, e.g. after migration.
    pub fn detached(&self) -> Vec<(LockIdentity, LockState)> {
        self.shared
            .buckets
            .iter()
            .filter_map(|b| b.adjunct_if_present::<LocalLocks>())
            .flat_map(|locals| locals.detached())
            .collect()
    }

    /// Current holder of `key`, if this peer owns the key's bucket.
    pub fn holder(&self, key: &str) -> Option<LockIdentity> {
        self.shared
            .buckets
            .for_key(key.as_bytes())
            .adjunct_if_present::<GlobalLocks>()
            .and_then(|globals| globals.holder(key))
    }

    /// Handles `lock/lock?key&owner&uuid&wait&ttl`.
    pub(crate) async fn handle_lock(&self, request: &PeerRequest) -> Result<Bytes, ClusterError> {
        let identity = LockIdentity::from_request(request)?;
        let wait: bool = request.require("wait")?;
        let ttl: u32 = request.require("ttl")?;
        match self.shared.destination(identity.key_bucket())? {
            Destination::Local => Ok(self.lock_here(&identity, wait).encode()),
            Destination::Remote(_) => {
                let ttl = ttl.checked_sub(1).ok_or(ClusterError::TtlExpired)?;
                Ok(self.request_lock(&identity, wait, ttl).await?.encode())
            }
        }
    }

    /// Handles `lock/free?key&owner&uuid&ttl`.
    pub(crate) async fn handle_free(&self, request: &PeerRequest) -> Result<Bytes, ClusterError> {
        let identity = LockIdentity::from_request(request)?;
        let ttl: u32 = request.require("ttl")?;
        match self.shared.destination(identity.key_bucket())? {
            Destination::Local => self.free_here(&identity),
            Destination::Remote(_) => {
                let ttl = ttl.checked_sub(1).ok_or(ClusterError::TtlExpired)?;
                self.free_at_owner(&identity, ttl).await?;
            }
        }
        Ok(Bytes::new())
    }

    /// Handles `lock/locked?key&owner&uuid&ttl`. Replies `[1]` if the
    /// requester-side record exists, `[0]` if not.
    pub(crate) async fn handle_locked(&self, request: &PeerRequest) -> Result<Bytes, ClusterError> {
        let identity = LockIdentity::from_request(request)?;
        let ttl: u32 = request.require("ttl")?;
        let present = match self.shared.destination(identity.home_bucket())? {
            Destination::Local => self.mark_locked(&identity),
            Destination::Remote(_) => {
                let ttl = ttl.checked_sub(1).ok_or(ClusterError::TtlExpired)?;
                self.mark_locked_at_owner(&identity, ttl).await?
            }
        };
        Ok(Bytes::copy_from_slice(&[present as u8]))
    }

    /// Handles `lock/audit?server&ttl`. Replies with the identities this
    /// peer could not confirm.
    pub(crate) async fn handle_audit(&self, request: &PeerRequest) -> Result<Bytes, ClusterError> {
        let server = PeerId(request.require("server")?);
        let ttl: u32 = request.require("ttl")?;
        if server == self.shared.local_id() {
            let data = AuditData::decode(&request.body)?;
            return Ok(self.check(&data).encode());
        }
        let ttl = ttl.checked_sub(1).ok_or(ClusterError::TtlExpired)?;
        let peer = self
            .shared
            .view()
            .peer(&server)
            .ok_or(ClusterError::UnknownPeer(server))?;
        let forwarded = PeerRequest::new(paths::LOCK_AUDIT)
            .param("server", server.0)
            .param("ttl", ttl)
            .with_body(request.body.clone());
        self.shared.outbound.post(&peer, forwarded).await
    }
}

/// Releases locks whose handles were dropped while still waiting or held.
async fn run_cleanup(
    manager: Weak<LockManager>,
    mut dropped: mpsc::UnboundedReceiver<LockIdentity>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            item = dropped.recv() => {
                let Some(identity) = item else { break };
                let Some(manager) = manager.upgrade() else { break };
                debug!("lock {}: handle dropped, releasing", identity);
                if let Err(e) = manager.release(&identity).await {
                    warn!("lock {}: releasing abandoned lock failed: {}", identity, e);
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
