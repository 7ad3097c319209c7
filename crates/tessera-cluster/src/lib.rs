//! tessera-cluster: a bucket-partitioned server pool.
//!
//! Every key hashes to one of 1024 buckets. Each bucket has an owner and up
//! to two backups, assigned by an elected leader and moved between peers as
//! the pool grows and shrinks.
//!
//! # Architecture
//!
//! Each peer runs one [`Node`], which handles:
//!
//! - **Membership**: gossip with adaptive per-peer failure timeouts
//! - **Election**: a vote among active peers picks the leader
//! - **Bucket table**: owner, same-site primary backup and cross-site
//!   secondary backup for every bucket
//! - **Rebalance**: the leader evens out ownership and backups
//! - **Ownership transfer**: state migrates to the new owner while traffic
//!   for the bucket is queued, so nothing is processed out of order
//! - **Locks**: distributed locks kept consistent by a periodic audit
//!
//! The node does no networking of its own. It sends through a
//! [`PeerTransport`] and serves whatever the transport delivers to
//! [`Node::handle_request`].
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use tessera_cluster::{ClusterConfig, Node, PeerId, PeerInfo};
//!
//! let local = PeerInfo { id: PeerId::new(), addr: "127.0.0.1:7400".parse()?, site: None };
//! let node = Node::start(local, ClusterConfig::default(), transport)?;
//!
//! let lock = node.locks().acquire("orders/17", "session-4", true, None).await?;
//! lock.wait_for_grant().await;
//! lock.free().await?;
//! ```

mod bucket;
mod capability;
mod config;
mod election;
mod error;
mod event_loop;
mod events;
mod lock;
mod membership;
mod message;
mod node;
mod peer;
mod rebalance;
mod transfer;
mod transport;

pub use bucket::{bucket_number, Assignment, Bucket, BucketTable, BUCKET_COUNT};
pub use capability::{Backup, Message, RemotePeer, RequestHandler};
pub use config::ClusterConfig;
pub use election::{Decision, Election, ElectionConfig, ElectionTick, Phase};
pub use error::ClusterError;
pub use events::{ClusterEvent, ClusterObserver};
pub use lock::{Lock, LockCallback, LockConfig, LockIdentity, LockManager, LockState};
pub use membership::{adjust_gap, Membership, MembershipConfig, MergeOutcome};
pub use message::{
    AuditData, Ballot, BucketChange, BucketRecord, Decoded, LockReply, PeerDescriptor, Snapshot,
};
pub use node::{ClusterView, Node, Routed};
pub use peer::{Peer, PeerId, PeerInfo};
pub use rebalance::{owner_loads, plan};
pub use transfer::{TransferConfig, TransferId};
pub use transport::{
    paths, BoxFuture, Discovery, Outbound, OutboundConfig, PeerRequest, PeerTransport,
};
