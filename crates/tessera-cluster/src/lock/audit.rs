//! Cross-peer lock audit.
//!
//! Each peer sends every counterpart the identities it believes are live
//! on the other side: its requester-side attempts go to the owner of the
//! lock key, its lock-side holders and waiters to the owner of the
//! requester key. The counterpart answers with the ones it does not know.
//! Those are checked once more after a short delay, then corrected.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::client::LocalLocks;
use super::server::GlobalLocks;
use super::{LockIdentity, LockManager};
use crate::message::AuditData;
use crate::node::Destination;
use crate::transport::{paths, PeerRequest};
use crate::{ClusterError, PeerId};

/// Runs the audit every period, at a per-peer offset so audits are spread
/// over the pool. A membership change pushes the next run to after the
/// grace delay.
pub(super) async fn run(
    manager: Weak<LockManager>,
    reschedule: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    let Some(mut delay) = manager.upgrade().map(|m| m.offset()) else {
        return;
    };
    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                let Some(m) = manager.upgrade() else { break };
                m.audit().await;
                delay = m.config().audit_period;
            }
            _ = reschedule.notified() => {
                let Some(m) = manager.upgrade() else { break };
                delay = m.config().audit_grace + m.offset();
                debug!("membership changed, next lock audit in {:?}", delay);
            }
            _ = shutdown.changed() => break,
        }
    }
}

impl LockManager {
    /// `period * index / count`, where `index` is this peer's position in
    /// the sorted active list.
    fn offset(&self) -> Duration {
        let view = self.shared.view();
        let index = view.index_of(&self.shared.local_id()).unwrap_or(0) as u32;
        let count = view.len().max(1) as u32;
        self.config().audit_period * index / count
    }

    /// Groups local bookkeeping by the peer that should confirm it.
    pub fn gather(&self) -> BTreeMap<PeerId, AuditData> {
        let mut out: BTreeMap<PeerId, AuditData> = BTreeMap::new();
        for bucket in self.shared.buckets.iter() {
            if let Some(locals) = bucket.adjunct_if_present::<LocalLocks>() {
                for id in locals.live() {
                    let peer = self.shared.owner_or_local(id.key_bucket());
                    out.entry(peer).or_default().client.push(id);
                }
            }
            if let Some(globals) = bucket.adjunct_if_present::<GlobalLocks>() {
                for id in globals.identities() {
                    let peer = self.shared.owner_or_local(id.home_bucket());
                    out.entry(peer).or_default().server.push(id);
                }
            }
        }
        out
    }

    /// Returns the identities in `data` this peer cannot confirm.
    ///
    /// Identities in buckets this peer does not own outright (including
    /// buckets mid-handoff) count as confirmed, since there is nothing here
    /// to compare against.
    pub fn check(&self, data: &AuditData) -> AuditData {
        let owned = |bucket: u16| matches!(self.shared.destination(bucket), Ok(Destination::Local));
        let client = data
            .client
            .iter()
            .filter(|id| owned(id.key_bucket()))
            .filter(|id| {
                !self
                    .shared
                    .buckets
                    .get(id.key_bucket())
                    .and_then(|b| b.adjunct_if_present::<GlobalLocks>())
                    .is_some_and(|g| g.confirms(id))
            })
            .cloned()
            .collect();
        let server = data
            .server
            .iter()
            .filter(|id| owned(id.home_bucket()))
            .filter(|id| {
                !self
                    .shared
                    .buckets
                    .get(id.home_bucket())
                    .and_then(|b| b.adjunct_if_present::<LocalLocks>())
                    .is_some_and(|l| l.confirms(id))
            })
            .cloned()
            .collect();
        AuditData { client, server }
    }

    /// One audit pass over every counterpart, run concurrently.
    pub async fn audit(self: &Arc<Self>) {
        let outgoing = self.gather();
        if outgoing.is_empty() {
            return;
        }
        debug!("lock audit: {} counterparts", outgoing.len());
        let mut exchanges = JoinSet::new();
        for (peer, data) in outgoing {
            let manager = Arc::clone(self);
            exchanges.spawn(async move { manager.audit_peer(peer, data).await });
        }
        while exchanges.join_next().await.is_some() {}
    }

    async fn audit_peer(&self, peer: PeerId, data: AuditData) {
        let unconfirmed = match self.exchange(peer, &data).await {
            Ok(u) if u.is_empty() => return,
            Ok(u) => u,
            Err(e) => {
                debug!("lock audit with {} failed: {}", peer, e);
                return;
            }
        };
        debug!(
            "lock audit with {}: {} unconfirmed, rechecking",
            peer,
            unconfirmed.client.len() + unconfirmed.server.len()
        );
        tokio::time::sleep(self.config().audit_retry).await;

        // anything resolved in the meantime is no longer ours to report
        let still_live = self.still_live(&unconfirmed);
        if still_live.is_empty() {
            return;
        }
        match self.exchange(peer, &still_live).await {
            Ok(confirmed_missing) => self.correct(peer, &confirmed_missing),
            Err(e) => debug!("lock audit recheck with {} failed: {}", peer, e),
        }
    }

    async fn exchange(&self, peer: PeerId, data: &AuditData) -> Result<AuditData, ClusterError> {
        if peer == self.shared.local_id() {
            return Ok(self.check(data));
        }
        let info = self
            .shared
            .view()
            .peer(&peer)
            .ok_or(ClusterError::UnknownPeer(peer))?;
        let request = PeerRequest::new(paths::LOCK_AUDIT)
            .param("server", peer.0)
            .param("ttl", self.config().forward_ttl)
            .with_body(data.encode());
        let reply = self.shared.outbound.post(&info, request).await?;
        Ok(AuditData::decode(&reply)?)
    }

    /// Drops identities this peer no longer tracks itself.
    fn still_live(&self, data: &AuditData) -> AuditData {
        let client_live = |id: &&LockIdentity| {
            self.shared
                .buckets
                .get(id.home_bucket())
                .and_then(|b| b.adjunct_if_present::<LocalLocks>())
                .is_some_and(|l| l.confirms(id))
        };
        let server_live = |id: &&LockIdentity| {
            self.shared
                .buckets
                .get(id.key_bucket())
                .and_then(|b| b.adjunct_if_present::<GlobalLocks>())
                .is_some_and(|g| g.confirms(id))
        };
        AuditData {
            client: data.client.iter().filter(client_live).cloned().collect(),
            server: data.server.iter().filter(server_live).cloned().collect(),
        }
    }

    fn correct(&self, peer: PeerId, missing: &AuditData) {
        for id in &missing.client {
            warn!("lock audit: {} unknown to {}, marking lost", id, peer);
            self.mark_lost(id);
        }
        for id in &missing.server {
            warn!("lock audit: requester of {} unknown to {}, freeing", id, peer);
            self.free_here(id);
        }
        if !missing.is_empty() {
            info!(
                "lock audit with {}: corrected {} records",
                peer,
                missing.client.len() + missing.server.len()
            );
        }
    }
}

