//! Pool lifecycle notifications.
//!
//! Observers are called from the event loop, in registration order. The
//! same events are also published on a broadcast channel for consumers
//! that prefer to poll.

use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;

use crate::PeerId;

/// Callbacks for membership and leadership changes. All methods default to
/// doing nothing.
pub trait ClusterObserver: Send + Sync + 'static {
    /// A peer joined, or came back after being marked failed.
    fn new_server(&self, _peer: PeerId) {}

    /// A peer stopped sending liveness updates.
    fn server_failed(&self, _peer: PeerId) {}

    /// An election moved leadership to a different peer.
    fn new_leader(&self, _leader: PeerId) {}

    /// An election finished. Fires after every decision, after
    /// `new_leader` when leadership changed.
    fn leader_confirmed(&self, _leader: PeerId) {}
}

/// Events as published on [`crate::Node::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterEvent {
    NewServer(PeerId),
    ServerFailed(PeerId),
    NewLeader(PeerId),
    LeaderConfirmed(PeerId),
}

pub(crate) struct Observers {
    list: RwLock<Vec<Arc<dyn ClusterObserver>>>,
    events: broadcast::Sender<ClusterEvent>,
}

impl Default for Observers {
    fn default() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            list: RwLock::new(Vec::new()),
            events,
        }
    }
}

impl Observers {
    pub(crate) fn add(&self, observer: Arc<dyn ClusterObserver>) {
        let mut list = self.list.write().unwrap_or_else(|e| e.into_inner());
        list.push(observer);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: ClusterEvent) {
        let list = self
            .list
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for observer in &list {
            match event {
                ClusterEvent::NewServer(p) => observer.new_server(p),
                ClusterEvent::ServerFailed(p) => observer.server_failed(p),
                ClusterEvent::NewLeader(p) => observer.new_leader(p),
                ClusterEvent::LeaderConfirmed(p) => observer.leader_confirmed(p),
            }
        }
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}
