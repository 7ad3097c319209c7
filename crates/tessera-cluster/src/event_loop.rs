//! The serializing event loop.
//!
//! Membership, election and bucket table updates all happen here. Other
//! tasks never touch that state directly; they submit closures through
//! [`MainLoop`] and the loop runs them between its periodic cycles.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::bucket::{Applied, Assignment};
use crate::election::{Decision, Election};
use crate::events::ClusterEvent;
use crate::membership::Membership;
use crate::message::{Ballot, BucketRecord, PeerDescriptor};
use crate::node::{self, ClusterView, Shared};
use crate::transport::{paths, PeerRequest};
use crate::{rebalance, transfer, ClusterError, PeerId};

type Work = Box<dyn FnOnce(&mut Core) + Send>;

/// Handle for submitting work to the event loop.
#[derive(Clone)]
pub(crate) struct MainLoop {
    tx: mpsc::UnboundedSender<Work>,
}

impl MainLoop {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<Work>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queues `work` to run on the loop.
    pub(crate) fn submit(&self, work: impl FnOnce(&mut Core) + Send + 'static) -> Result<(), ClusterError> {
        self.tx
            .send(Box::new(work))
            .map_err(|_| ClusterError::Shutdown)
    }

    /// Runs `work` on the loop and waits for its result.
    pub(crate) async fn call<R, F>(&self, work: F) -> Result<R, ClusterError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Core) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(move |core| {
            let _ = tx.send(work(core));
        })?;
        rx.await.map_err(|_| ClusterError::Shutdown)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// State owned by the event loop.
pub(crate) struct Core {
    shared: Arc<Shared>,
    membership: Membership,
    election: Election,
    /// Whether this peer still publishes its gossip payload to discovery.
    discovering: bool,
}

impl Core {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        let membership = Membership::new(shared.local, shared.config.membership.clone());
        let election = Election::new(shared.local.id, shared.config.election.clone());
        Self {
            shared,
            membership,
            election,
            discovering: true,
        }
    }

    /// Runs until the work channel closes or shutdown is signalled.
    pub(crate) async fn run(
        mut self,
        mut work: mpsc::UnboundedReceiver<Work>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.shared.config.membership.cycle);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.publish_view();

        loop {
            tokio::select! {
                _ = ticker.tick() => self.cycle(),
                item = work.recv() => match item {
                    Some(job) => job(&mut self),
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("event loop for {} stopped", self.shared.local.id);
    }

    /// One periodic cycle: liveness, failure detection, gossip, election.
    fn cycle(&mut self) {
        let now = Instant::now();
        self.membership.advance();

        for failed in self.membership.detect_failures(now) {
            self.server_failed(failed);
        }

        let notify = self.membership.notify_list();
        let payload = PeerDescriptor::encode_batch(&self.membership.descriptors());
        for peer in &notify {
            let request = PeerRequest::new(paths::ADMIN).with_body(payload.clone());
            self.shared.outbound.spawn_post(*peer, request);
        }
        if self.discovering {
            if let Some(discovery) = self.shared.discovery() {
                discovery.publish(payload);
            }
        }

        let active = self.membership.active_ids();
        let tick = self.election.tick(&active, now_millis());
        if !tick.ballots.is_empty() {
            let body = Ballot::encode_batch(&tick.ballots);
            for peer in &notify {
                let request = PeerRequest::new(paths::VOTE).with_body(body.clone());
                self.shared.outbound.spawn_post(*peer, request);
            }
        }
        if let Some(decision) = tick.decision {
            self.decided(decision);
        }
    }

    fn publish_view(&self) {
        self.shared.publish_view(ClusterView::new(
            self.shared.local.id,
            self.membership.active_infos(),
            self.election.leader(),
        ));
    }

    /// Merges a gossip batch from `admin` or discovery.
    pub(crate) fn merge(&mut self, descriptors: &[PeerDescriptor]) {
        let outcome = self.membership.merge(descriptors, Instant::now());
        if outcome.joined.is_empty() {
            return;
        }
        self.publish_view();
        self.election.membership_changed(&self.membership.active_ids());
        if self.is_leader() {
            self.send_table_to(&outcome.joined);
        }
        for id in outcome.joined {
            self.shared.observers.emit(ClusterEvent::NewServer(id));
        }
    }

    /// Brings newcomers up to date so they never plan from an empty table.
    fn send_table_to(&self, peers: &[PeerId]) {
        let body = BucketRecord::encode_batch(&self.shared.buckets.records());
        for id in peers {
            if let Some(peer) = self.membership.get(id) {
                let request = PeerRequest::new(paths::BUCKET_UPDATE).with_body(body.clone());
                self.shared.outbound.spawn_post(peer.info, request);
            }
        }
    }

    pub(crate) fn receive_ballots(&mut self, ballots: &[Ballot]) {
        self.election.receive(ballots, &self.membership.active_ids());
    }

    fn server_failed(&mut self, id: PeerId) {
        let active = self.membership.active_ids();
        self.election.membership_changed(&active);
        self.publish_view();

        let applied = self.shared.buckets.peer_failed(
            id,
            self.shared.local.id,
            &self.shared.config.transfer,
        );
        self.carry_out(applied);
        self.shared.outbound.forget(id);
        self.shared.observers.emit(ClusterEvent::ServerFailed(id));
        self.start_rebalance();
    }

    fn decided(&mut self, decision: Decision) {
        self.publish_view();
        let local = self.shared.local.id;
        self.discovering = decision.leader == local;
        if decision.is_new_leader() {
            info!("new leader: {}", decision.leader);
            self.shared
                .observers
                .emit(ClusterEvent::NewLeader(decision.leader));
        }
        self.shared
            .observers
            .emit(ClusterEvent::LeaderConfirmed(decision.leader));
        self.start_rebalance();
    }

    fn is_leader(&self) -> bool {
        self.election.leader() == Some(self.shared.local.id)
    }

    /// Plans a new bucket layout off the loop. Only the leader does this.
    fn start_rebalance(&mut self) {
        if !self.is_leader() {
            return;
        }
        let generation = self
            .shared
            .rebalance_generation
            .fetch_add(1, Ordering::SeqCst)
            + 1;
        let snapshot = self.shared.buckets.snapshot();
        let peers = self.membership.active_infos();
        let main_loop = self.shared.main_loop.clone();

        tokio::spawn(async move {
            let planned =
                tokio::task::spawn_blocking(move || rebalance::plan(&snapshot, &peers)).await;
            match planned {
                Ok(table) => {
                    let _ = main_loop.submit(move |core| core.finish_rebalance(generation, table));
                }
                Err(e) => warn!("rebalance planning failed: {}", e),
            }
        });
    }

    fn finish_rebalance(&mut self, generation: u64, table: Vec<Assignment>) {
        let latest = self.shared.rebalance_generation.load(Ordering::SeqCst);
        if generation != latest {
            debug!("discarding rebalance {} (latest is {})", generation, latest);
            return;
        }
        if !self.is_leader() {
            return;
        }
        let records: Vec<BucketRecord> = table
            .iter()
            .enumerate()
            .map(|(i, a)| BucketRecord::full(i as u16, a.owner, a.primary, a.secondary))
            .collect();
        let body = BucketRecord::encode_batch(&records);
        let applied = self.shared.buckets.apply(
            &records,
            self.shared.local.id,
            &self.shared.config.transfer,
        );
        info!(
            "rebalance {} applied ({} buckets changing owner locally)",
            generation,
            applied.started.len()
        );
        self.carry_out(applied);
        self.send_to_notify_list(paths::BUCKET_UPDATE, body);
    }

    /// Applies a `bucket/update` body and passes it on if it changed
    /// anything here.
    pub(crate) fn receive_update(&mut self, body: Bytes) {
        let decoded = BucketRecord::decode_batch(&body);
        if let Some(e) = &decoded.error {
            warn!(
                "bucket update: {} (applying {} records that parsed)",
                e,
                decoded.items.len()
            );
        }
        let applied = self.shared.buckets.apply(
            &decoded.items,
            self.shared.local.id,
            &self.shared.config.transfer,
        );
        if applied.changed {
            self.carry_out(applied);
            self.send_to_notify_list(paths::BUCKET_UPDATE, body);
        }
    }

    fn send_to_notify_list(&self, path: &str, body: Bytes) {
        for peer in self.membership.notify_list() {
            let request = PeerRequest::new(path).with_body(body.clone());
            self.shared.outbound.spawn_post(peer, request);
        }
    }

    /// Starts transfer tasks and re-routes messages left behind by
    /// superseded transfers.
    fn carry_out(&self, applied: Applied) {
        for transfer in applied.started {
            transfer::spawn(&self.shared, transfer);
        }
        for (bucket, message) in applied.orphaned {
            node::dispatch(&self.shared, bucket, message);
        }
    }
}
