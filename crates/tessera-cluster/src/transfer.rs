//! Bucket ownership handoff.
//!
//! When a bucket changes owner, both sides run a short-lived transfer:
//!
//! 1. The old owner enters `OldOwner`, forwards new traffic for the bucket
//!    to the new owner, gathers the bucket's state from every registered
//!    [`Backup`](crate::Backup), and posts it as `bucket/sessionData`.
//! 2. The new owner enters `NewOwner` and queues traffic for the bucket
//!    until that data arrives (or it gives up waiting), restores it, then
//!    drains the queue in arrival order.
//!
//! A `NewOwner` entered because we inferred a promotion from a failure is
//! *unconfirmed* until the leader's update names us owner. Unconfirmed
//! handoffs wait less and abort if nothing arrives.
//!
//! A transfer only acts on the bucket while it is still the bucket's current
//! state. Anything that replaces it hands the queued messages back to be
//! routed again.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::capability::Message;
use crate::message::Snapshot;
use crate::node::{self, Shared};
use crate::transport::{paths, PeerRequest};
use crate::{ClusterError, PeerId};

/// Handoff timing.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// How long a confirmed new owner waits for the old owner's data.
    pub confirmed_timeout: Duration,
    /// How long an unconfirmed new owner waits for data or confirmation.
    pub unconfirmed_timeout: Duration,
    /// Extra time an unconfirmed new owner holds its state after restoring,
    /// in case confirmation is still on the way.
    pub unconfirmed_grace: Duration,
    /// How often a waiting new owner checks that the old owner is alive.
    pub liveness_poll: Duration,
    /// Hop limit for forwarded session data.
    pub forward_ttl: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            confirmed_timeout: Duration::from_secs(30),
            unconfirmed_timeout: Duration::from_secs(10),
            unconfirmed_grace: Duration::from_secs(10),
            liveness_poll: Duration::from_secs(1),
            forward_ttl: 5,
        }
    }
}

/// Identifies a transfer in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId(pub u64);

impl TransferId {
    fn new(bucket: u16) -> Self {
        use rand::Rng;
        let noise: u64 = rand::rng().random();
        Self((noise << 10) | bucket as u64)
    }
}

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

pub(crate) struct Transfer {
    pub(crate) id: TransferId,
    pub(crate) bucket: u16,
    pub(crate) kind: TransferKind,
}

pub(crate) enum TransferKind {
    OldOwner { new_owner: PeerId },
    NewOwner(NewOwner),
}

impl Transfer {
    pub(crate) fn old_owner(bucket: u16, new_owner: PeerId) -> Arc<Self> {
        Arc::new(Self {
            id: TransferId::new(bucket),
            bucket,
            kind: TransferKind::OldOwner { new_owner },
        })
    }

    pub(crate) fn new_owner(
        bucket: u16,
        old_owner: Option<PeerId>,
        confirmed: bool,
        data: Option<Vec<Snapshot>>,
        config: &TransferConfig,
    ) -> Arc<Self> {
        let wait = if confirmed {
            config.confirmed_timeout
        } else {
            config.unconfirmed_timeout
        };
        Arc::new(Self {
            id: TransferId::new(bucket),
            bucket,
            kind: TransferKind::NewOwner(NewOwner {
                old_owner,
                inner: Mutex::new(NewOwnerInner {
                    confirmed,
                    cancelled: false,
                    deadline: Instant::now() + wait,
                    data,
                    queue: VecDeque::new(),
                }),
                wake: Notify::new(),
            }),
        })
    }
}

pub(crate) struct NewOwner {
    pub(crate) old_owner: Option<PeerId>,
    inner: Mutex<NewOwnerInner>,
    wake: Notify,
}

struct NewOwnerInner {
    confirmed: bool,
    cancelled: bool,
    deadline: Instant,
    data: Option<Vec<Snapshot>>,
    queue: VecDeque<Box<dyn Message>>,
}

impl NewOwner {
    fn lock(&self) -> MutexGuard<'_, NewOwnerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn is_confirmed(&self) -> bool {
        self.lock().confirmed
    }

    /// Marks the handoff confirmed by the leader. The wait deadline grows by
    /// the difference between the confirmed and unconfirmed timeouts.
    pub(crate) fn confirm(&self, config: &TransferConfig) {
        let mut inner = self.lock();
        if inner.confirmed {
            return;
        }
        inner.confirmed = true;
        inner.deadline += config
            .confirmed_timeout
            .saturating_sub(config.unconfirmed_timeout);
        drop(inner);
        self.wake.notify_one();
    }

    pub(crate) fn enqueue(&self, message: Box<dyn Message>) {
        self.lock().queue.push_back(message);
        self.wake.notify_one();
    }

    /// Stores the old owner's data. Returns false if data already arrived.
    pub(crate) fn deliver(&self, items: Vec<Snapshot>) -> bool {
        let mut inner = self.lock();
        if inner.data.is_some() {
            return false;
        }
        inner.data = Some(items);
        drop(inner);
        self.wake.notify_one();
        true
    }

    /// Stops the handoff and returns whatever was queued.
    pub(crate) fn cancel(&self) -> Vec<Box<dyn Message>> {
        let mut inner = self.lock();
        inner.cancelled = true;
        let queued = inner.queue.drain(..).collect();
        drop(inner);
        self.wake.notify_one();
        queued
    }

    fn pop(&self) -> Option<Box<dyn Message>> {
        self.lock().queue.pop_front()
    }
}

enum Arrival {
    Data(Vec<Snapshot>),
    Empty,
    Abort,
    Cancelled,
}

/// Starts the driver task for a transfer.
pub(crate) fn spawn(shared: &Arc<Shared>, transfer: Arc<Transfer>) {
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        match &transfer.kind {
            TransferKind::OldOwner { new_owner } => {
                run_old_owner(&shared, &transfer, *new_owner).await
            }
            TransferKind::NewOwner(state) => run_new_owner(&shared, &transfer, state).await,
        }
    });
}

fn is_current(shared: &Shared, transfer: &Arc<Transfer>) -> bool {
    shared
        .buckets
        .get(transfer.bucket)
        .is_some_and(|b| b.lock_slot().is_current(transfer))
}

fn clear_if_current(shared: &Shared, transfer: &Arc<Transfer>) {
    if let Some(bucket) = shared.buckets.get(transfer.bucket) {
        let mut slot = bucket.lock_slot();
        if slot.is_current(transfer) {
            slot.state = None;
        }
    }
}

async fn run_old_owner(shared: &Arc<Shared>, transfer: &Arc<Transfer>, new_owner: PeerId) {
    let bucket = transfer.bucket;
    let items = shared.capabilities.generate(bucket);
    if !is_current(shared, transfer) {
        debug!("transfer {} superseded before sending", transfer.id);
        return;
    }

    match shared.view().peer(&new_owner) {
        Some(peer) => {
            let request = PeerRequest::new(paths::SESSION_DATA)
                .param("bucket", bucket)
                .param("dest", new_owner.0)
                .param("ttl", shared.config.transfer.forward_ttl)
                .with_body(Snapshot::encode_batch(&items));
            match shared.outbound.post(&peer, request).await {
                Ok(_) => debug!(
                    "bucket {}: sent {} state items to {}",
                    bucket,
                    items.len(),
                    new_owner
                ),
                Err(e) => warn!("bucket {}: sending state to {} failed: {}", bucket, new_owner, e),
            }
        }
        None => warn!("bucket {}: new owner {} is not a known peer", bucket, new_owner),
    }
    clear_if_current(shared, transfer);
}

async fn wait_for_data(shared: &Shared, state: &NewOwner, poll: Duration) -> Arrival {
    loop {
        let (confirmed, deadline) = {
            let mut inner = state.lock();
            if inner.cancelled {
                return Arrival::Cancelled;
            }
            if let Some(data) = inner.data.take() {
                return Arrival::Data(data);
            }
            (inner.confirmed, inner.deadline)
        };

        let now = Instant::now();
        if now >= deadline {
            return if confirmed { Arrival::Empty } else { Arrival::Abort };
        }
        // a dead old owner will never send anything
        let old_alive = state
            .old_owner
            .is_some_and(|old| shared.view().is_active(&old));
        if confirmed && !old_alive {
            return Arrival::Empty;
        }

        let wait = (deadline - now).min(poll);
        let _ = tokio::time::timeout(wait, state.wake.notified()).await;
    }
}

async fn run_new_owner(shared: &Arc<Shared>, transfer: &Arc<Transfer>, state: &NewOwner) {
    let bucket = transfer.bucket;
    let config = &shared.config.transfer;

    let items = match wait_for_data(shared, state, config.liveness_poll).await {
        Arrival::Cancelled => return,
        Arrival::Data(items) => items,
        Arrival::Empty => {
            info!("bucket {}: no state received, starting empty", bucket);
            Vec::new()
        }
        Arrival::Abort => {
            let queued = {
                let Some(b) = shared.buckets.get(bucket) else {
                    return;
                };
                let mut slot = b.lock_slot();
                if !slot.is_current(transfer) {
                    return;
                }
                slot.state = None;
                state.cancel()
            };
            info!(
                "bucket {}: unconfirmed handoff abandoned, rerouting {} messages",
                bucket,
                queued.len()
            );
            for message in queued {
                node::dispatch(shared, bucket, message);
            }
            return;
        }
    };

    shared.capabilities.restore(bucket, &items);
    let grace_end = Instant::now() + config.unconfirmed_grace;

    loop {
        while let Some(message) = state.pop() {
            message.process();
        }

        if !state.is_confirmed() && Instant::now() < grace_end {
            let _ = tokio::time::timeout_at(grace_end, state.wake.notified()).await;
            continue;
        }

        // the queue must be empty at the moment the state is cleared, or a
        // message pushed after the last pop would be stranded
        let Some(b) = shared.buckets.get(bucket) else {
            return;
        };
        let mut slot = b.lock_slot();
        if !slot.is_current(transfer) {
            return;
        }
        if state.lock().queue.is_empty() {
            slot.state = None;
            debug!("bucket {}: handoff {} complete", bucket, transfer.id);
            return;
        }
    }
}

/// Handles `bucket/sessionData?bucket&dest&ttl`.
///
/// The data goes to a pending handoff if there is one. If it arrived before
/// the ownership update, an unconfirmed handoff is started that already
/// holds it. Otherwise it is forwarded to whoever owns the bucket now.
pub(crate) fn receive_session_data(
    shared: &Arc<Shared>,
    request: &PeerRequest,
) -> Result<Bytes, ClusterError> {
    let bucket: u16 = request.require("bucket")?;
    let dest = PeerId(request.require("dest")?);
    let ttl: u32 = request.require("ttl")?;
    let local = shared.local_id();
    let config = &shared.config.transfer;
    let b = shared
        .buckets
        .get(bucket)
        .ok_or_else(|| ClusterError::Protocol(format!("bucket {bucket} out of range")))?;

    let decoded = Snapshot::decode_batch(&request.body);
    if let Some(e) = decoded.error {
        return Err(e.into());
    }
    let items = decoded.items;

    let forward_to = {
        let mut slot = b.lock_slot();
        let pending = match slot.state.as_deref().map(|t| &t.kind) {
            Some(TransferKind::NewOwner(n)) => {
                if !n.deliver(items.clone()) {
                    debug!("bucket {}: duplicate state ignored", bucket);
                }
                true
            }
            _ => false,
        };
        if pending {
            return Ok(Bytes::new());
        }

        let owner = slot.assignment.owner;
        if dest == local || owner == Some(local) {
            let confirmed = owner == Some(local);
            let t = Transfer::new_owner(bucket, None, confirmed, Some(items), config);
            slot.state = Some(t.clone());
            drop(slot);
            debug!("bucket {}: state arrived ahead of the ownership update", bucket);
            spawn(shared, t);
            return Ok(Bytes::new());
        }
        match slot.state.as_deref().map(|t| &t.kind) {
            Some(TransferKind::OldOwner { new_owner }) => Some(*new_owner),
            _ => owner,
        }
    };

    let Some(target) = forward_to else {
        warn!("bucket {}: state for {} has nowhere to go", bucket, dest);
        return Ok(Bytes::new());
    };
    if ttl == 0 {
        warn!("bucket {}: dropping state for {}, ttl exhausted", bucket, dest);
        return Err(ClusterError::TtlExpired);
    }
    let peer = shared
        .view()
        .peer(&target)
        .ok_or(ClusterError::UnknownPeer(target))?;
    debug!("bucket {}: forwarding state to {}", bucket, target);
    let forwarded = PeerRequest::new(paths::SESSION_DATA)
        .param("bucket", bucket)
        .param("dest", target.0)
        .param("ttl", ttl - 1)
        .with_body(request.body.clone());
    shared.outbound.spawn_post(peer, forwarded);
    Ok(Bytes::new())
}
