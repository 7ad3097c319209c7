//! Bucket table: key hashing and per-bucket ownership.
//!
//! Keys hash into 1024 buckets. Each bucket has an owner plus a primary
//! backup (same site as the owner) and a secondary backup (another site).
//! A bucket with no owner is treated as local by every peer, which keeps a
//! single-node pool working before the first rebalance.
//!
//! All routing decisions for a bucket are made under its slot lock, so a
//! message is either queued behind a transfer or sent to the owner the
//! transfer left behind, never both.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::capability::Message;
use crate::message::{BucketChange, BucketRecord};
use crate::transfer::{Transfer, TransferConfig, TransferKind};
use crate::PeerId;

/// Number of buckets in the pool.
pub const BUCKET_COUNT: usize = 1024;

/// Maps a key to its bucket.
///
/// Takes the top 10 bits of the first 128 bits of the key's SHA-256
/// digest, so every peer agrees without coordination.
pub fn bucket_number(key: &[u8]) -> u16 {
    let digest = Sha256::digest(key);
    u16::from_be_bytes([digest[0], digest[1]]) >> 6
}

/// Owner and backups of one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Assignment {
    pub owner: Option<PeerId>,
    pub primary: Option<PeerId>,
    pub secondary: Option<PeerId>,
}

impl Assignment {
    fn record(&self, bucket: u16) -> BucketRecord {
        BucketRecord::full(bucket, self.owner, self.primary, self.secondary)
    }
}

#[derive(Default)]
pub(crate) struct Slot {
    pub(crate) assignment: Assignment,
    /// Ownership transfer in progress, if any.
    pub(crate) state: Option<Arc<Transfer>>,
}

impl Slot {
    /// Returns true if `transfer` is still the bucket's current state.
    pub(crate) fn is_current(&self, transfer: &Arc<Transfer>) -> bool {
        self.state.as_ref().is_some_and(|s| Arc::ptr_eq(s, transfer))
    }

    /// Replaces the transfer state, handing back messages queued on the
    /// state being dropped.
    fn replace_state(&mut self, next: Option<Arc<Transfer>>, applied: &mut Applied) {
        if let Some(prev) = std::mem::replace(&mut self.state, next) {
            if let TransferKind::NewOwner(n) = &prev.kind {
                let queued = n.cancel();
                applied
                    .orphaned
                    .extend(queued.into_iter().map(|m| (prev.bucket, m)));
            }
        }
    }
}

type Adjuncts = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

/// One of the 1024 buckets.
pub struct Bucket {
    index: u16,
    slot: Mutex<Slot>,
    adjuncts: Mutex<Adjuncts>,
}

impl Bucket {
    fn new(index: u16) -> Self {
        Self {
            index,
            slot: Mutex::new(Slot::default()),
            adjuncts: Mutex::new(HashMap::new()),
        }
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn assignment(&self) -> Assignment {
        self.lock_slot().assignment
    }

    pub fn owner(&self) -> Option<PeerId> {
        self.lock_slot().assignment.owner
    }

    /// Returns true while an ownership transfer is running.
    pub fn in_transition(&self) -> bool {
        self.lock_slot().state.is_some()
    }

    pub(crate) fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_adjuncts(&self) -> MutexGuard<'_, Adjuncts> {
        self.adjuncts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the adjunct of type `T`, creating it on first use.
    pub fn adjunct<T: Any + Send + Sync + Default>(&self) -> Arc<T> {
        let mut adjuncts = self.lock_adjuncts();
        let entry = adjuncts
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Arc::new(T::default()));
        match Arc::clone(entry).downcast::<T>() {
            Ok(found) => found,
            // the map is keyed by TypeId, so this only happens if the entry
            // was replaced behind our back
            Err(_) => {
                let fresh = Arc::new(T::default());
                *entry = fresh.clone();
                fresh
            }
        }
    }

    /// Returns the adjunct of type `T` if one exists.
    pub fn adjunct_if_present<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let adjuncts = self.lock_adjuncts();
        adjuncts
            .get(&TypeId::of::<T>())
            .and_then(|a| Arc::clone(a).downcast::<T>().ok())
    }

    /// Detaches and returns the adjunct of type `T`.
    pub fn remove_adjunct<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let mut adjuncts = self.lock_adjuncts();
        adjuncts
            .remove(&TypeId::of::<T>())
            .and_then(|a| a.downcast::<T>().ok())
    }
}

/// Where a message for a bucket should go.
pub(crate) enum Route {
    Local(Box<dyn Message>),
    Remote(PeerId, Box<dyn Message>),
    /// Held by an incoming transfer until the bucket's data is restored.
    Queued,
}

/// Side effects of a table update, to be carried out after the slot locks
/// are released.
#[derive(Default)]
pub(crate) struct Applied {
    pub(crate) changed: bool,
    /// Transfers that need a driver task.
    pub(crate) started: Vec<Arc<Transfer>>,
    /// Messages that were queued on a superseded transfer, to be routed
    /// again.
    pub(crate) orphaned: Vec<(u16, Box<dyn Message>)>,
}

/// The full set of buckets.
pub struct BucketTable {
    buckets: Box<[Bucket]>,
}

impl Default for BucketTable {
    fn default() -> Self {
        Self::new()
    }
}

impl BucketTable {
    pub fn new() -> Self {
        let buckets = (0..BUCKET_COUNT as u16).map(Bucket::new).collect();
        Self { buckets }
    }

    /// Returns the bucket at `index`, or `None` if it is out of range.
    pub fn get(&self, index: u16) -> Option<&Bucket> {
        self.buckets.get(index as usize)
    }

    /// Returns the bucket a key hashes to.
    pub fn for_key(&self, key: &[u8]) -> &Bucket {
        &self.buckets[bucket_number(key) as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bucket> {
        self.buckets.iter()
    }

    pub fn owner(&self, index: u16) -> Option<PeerId> {
        self.get(index).and_then(|b| b.owner())
    }

    /// Copies the current assignment of every bucket.
    pub fn snapshot(&self) -> Vec<Assignment> {
        self.buckets.iter().map(|b| b.assignment()).collect()
    }

    /// Number of buckets owned by `peer`.
    pub fn owned_by(&self, peer: PeerId) -> usize {
        self.buckets
            .iter()
            .filter(|b| b.owner() == Some(peer))
            .count()
    }

    /// Full-table records for every bucket, as sent by the leader.
    pub fn records(&self) -> Vec<BucketRecord> {
        self.buckets
            .iter()
            .map(|b| b.assignment().record(b.index))
            .collect()
    }

    /// Applies a batch of update records.
    pub(crate) fn apply(
        &self,
        records: &[BucketRecord],
        local: PeerId,
        config: &TransferConfig,
    ) -> Applied {
        let mut applied = Applied::default();
        for record in records {
            if let Some(bucket) = self.get(record.bucket) {
                apply_record(bucket, record, local, config, &mut applied);
            }
        }
        applied
    }

    /// Infers the effect of a peer failure on every bucket it touched.
    ///
    /// Owned buckets fall to the primary backup, or the secondary if there
    /// is no primary. Backup slots naming the failed peer are cleared.
    pub(crate) fn peer_failed(
        &self,
        failed: PeerId,
        local: PeerId,
        config: &TransferConfig,
    ) -> Applied {
        let mut applied = Applied::default();
        let mut promoted = 0usize;
        for bucket in self.buckets.iter() {
            let mut slot = bucket.lock_slot();
            let a = &mut slot.assignment;
            let before = *a;

            if a.owner == Some(failed) {
                if a.primary.is_some() {
                    a.owner = a.primary.take();
                } else {
                    a.owner = a.secondary.take();
                }
                promoted += 1;
            }
            if a.primary == Some(failed) {
                a.primary = None;
            }
            if a.secondary == Some(failed) {
                a.secondary = None;
            }
            if *a == before {
                continue;
            }
            applied.changed = true;
            let owner = a.owner;

            let handing_to_failed = matches!(
                slot.state.as_deref().map(|t| &t.kind),
                Some(TransferKind::OldOwner { new_owner }) if *new_owner == failed
            );
            if before.owner == Some(failed) && owner == Some(local) {
                let t = Transfer::new_owner(bucket.index, Some(failed), false, None, config);
                slot.replace_state(Some(t.clone()), &mut applied);
                applied.started.push(t);
            } else if handing_to_failed {
                slot.replace_state(None, &mut applied);
            }
        }
        if promoted > 0 {
            info!("peer {} failed: {} buckets promoted to backups", failed, promoted);
        }
        applied
    }

    /// Decides where a message for `index` goes.
    ///
    /// A queued message is pushed while the slot lock is held, so it
    /// cannot slip past a transfer that is about to finish.
    pub(crate) fn route(&self, index: u16, local: PeerId, message: Box<dyn Message>) -> Route {
        let Some(bucket) = self.get(index) else {
            return Route::Local(message);
        };
        let slot = bucket.lock_slot();
        match slot.state.as_deref().map(|t| &t.kind) {
            Some(TransferKind::NewOwner(n)) => {
                n.enqueue(message);
                return Route::Queued;
            }
            Some(TransferKind::OldOwner { new_owner }) => {
                return Route::Remote(*new_owner, message);
            }
            None => {}
        }
        match slot.assignment.owner {
            Some(owner) if owner != local => Route::Remote(owner, message),
            _ => Route::Local(message),
        }
    }
}

fn apply_record(
    bucket: &Bucket,
    record: &BucketRecord,
    local: PeerId,
    config: &TransferConfig,
    applied: &mut Applied,
) {
    let mut slot = bucket.lock_slot();
    let before = slot.assignment;
    for change in &record.changes {
        match *change {
            BucketChange::Owner(p) => slot.assignment.owner = p,
            BucketChange::Primary(p) => slot.assignment.primary = p,
            BucketChange::Secondary(p) => slot.assignment.secondary = p,
        }
    }
    let after = slot.assignment;
    // any record naming us owner confirms a pending handoff, whatever it
    // does to the backups
    let pending = after.owner == Some(local)
        && match slot.state.as_deref().map(|t| &t.kind) {
            Some(TransferKind::NewOwner(n)) => {
                n.confirm(config);
                true
            }
            _ => false,
        };
    if after == before {
        return;
    }
    applied.changed = true;
    if after.owner == before.owner {
        return;
    }

    debug!(
        "bucket {} owner {:?} -> {:?}",
        bucket.index, before.owner, after.owner
    );
    if after.owner == Some(local) {
        if !pending {
            match before.owner {
                Some(previous) => {
                    let t = Transfer::new_owner(bucket.index, Some(previous), true, None, config);
                    slot.replace_state(Some(t.clone()), applied);
                    applied.started.push(t);
                }
                // nobody held the bucket, so there is nothing to wait for
                None => slot.replace_state(None, applied),
            }
        }
    } else if before.owner == Some(local) {
        match after.owner {
            Some(new_owner) => {
                let t = Transfer::old_owner(bucket.index, new_owner);
                slot.replace_state(Some(t.clone()), applied);
                applied.started.push(t);
            }
            None => slot.replace_state(None, applied),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counted(Arc<AtomicUsize>);

    impl Message for Counted {
        fn process(self: Box<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }

        fn send_to_peer(self: Box<Self>, _peer: crate::capability::RemotePeer, _bucket: u16) {}
    }

    fn message() -> Box<dyn Message> {
        Box::new(Counted(Arc::new(AtomicUsize::new(0))))
    }

    fn owner_record(bucket: u16, owner: PeerId) -> BucketRecord {
        BucketRecord {
            bucket,
            changes: vec![BucketChange::Owner(Some(owner))],
        }
    }

    #[test]
    fn bucket_number_in_range_and_stable() {
        for key in ["", "a", "user:42", "some longer key with spaces"] {
            let b = bucket_number(key.as_bytes());
            assert!((b as usize) < BUCKET_COUNT);
            assert_eq!(b, bucket_number(key.as_bytes()));
        }
    }

    #[test]
    fn bucket_number_spreads_keys() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..5000 {
            seen.insert(bucket_number(format!("key-{i}").as_bytes()));
        }
        assert!(seen.len() > 900, "only {} distinct buckets", seen.len());
    }

    #[test]
    fn unowned_bucket_routes_locally() {
        let table = BucketTable::new();
        let local = PeerId::new();
        assert!(matches!(table.route(7, local, message()), Route::Local(_)));
    }

    #[test]
    fn first_assignment_starts_no_transfer() {
        let table = BucketTable::new();
        let local = PeerId::new();
        let applied = table.apply(&[owner_record(3, local)], local, &TransferConfig::default());
        assert!(applied.changed);
        assert!(applied.started.is_empty());
        assert_eq!(table.owner(3), Some(local));
    }

    #[test]
    fn remote_owner_routes_remote() {
        let table = BucketTable::new();
        let local = PeerId::new();
        let other = PeerId::new();
        table.apply(&[owner_record(3, other)], local, &TransferConfig::default());
        match table.route(3, local, message()) {
            Route::Remote(p, _) => assert_eq!(p, other),
            _ => panic!("expected remote route"),
        }
    }

    #[test]
    fn losing_ownership_starts_old_owner_and_forwards() {
        let table = BucketTable::new();
        let local = PeerId::new();
        let other = PeerId::new();
        let config = TransferConfig::default();
        table.apply(&[owner_record(5, local)], local, &config);
        let applied = table.apply(&[owner_record(5, other)], local, &config);
        assert_eq!(applied.started.len(), 1);
        assert!(matches!(
            applied.started[0].kind,
            TransferKind::OldOwner { new_owner } if new_owner == other
        ));
        assert!(table.get(5).unwrap().in_transition());
        assert!(matches!(table.route(5, local, message()), Route::Remote(p, _) if p == other));
    }

    #[test]
    fn gaining_ownership_queues_messages() {
        let table = BucketTable::new();
        let local = PeerId::new();
        let other = PeerId::new();
        let config = TransferConfig::default();
        table.apply(&[owner_record(9, other)], local, &config);
        let applied = table.apply(&[owner_record(9, local)], local, &config);
        assert_eq!(applied.started.len(), 1);
        assert!(matches!(table.route(9, local, message()), Route::Queued));
    }

    #[test]
    fn failure_promotes_primary_then_secondary() {
        let table = BucketTable::new();
        let local = PeerId::new();
        let dead = PeerId::new();
        let backup = PeerId::new();
        let config = TransferConfig::default();
        table.apply(
            &[
                BucketRecord::full(0, Some(dead), Some(local), Some(backup)),
                BucketRecord::full(1, Some(dead), None, Some(backup)),
                BucketRecord::full(2, Some(backup), Some(dead), Some(dead)),
            ],
            local,
            &config,
        );

        let applied = table.peer_failed(dead, local, &config);
        assert!(applied.changed);
        assert_eq!(
            table.get(0).unwrap().assignment(),
            Assignment {
                owner: Some(local),
                primary: None,
                secondary: Some(backup)
            }
        );
        assert_eq!(table.owner(1), Some(backup));
        assert_eq!(
            table.get(2).unwrap().assignment(),
            Assignment {
                owner: Some(backup),
                primary: None,
                secondary: None
            }
        );
        // only the locally promoted bucket starts an unconfirmed handoff
        assert_eq!(applied.started.len(), 1);
        match &applied.started[0].kind {
            TransferKind::NewOwner(n) => assert!(!n.is_confirmed()),
            _ => panic!("expected new owner state"),
        }
    }

    #[test]
    fn confirming_record_confirms_pending_handoff() {
        let table = BucketTable::new();
        let local = PeerId::new();
        let dead = PeerId::new();
        let config = TransferConfig::default();
        table.apply(
            &[BucketRecord::full(4, Some(dead), Some(local), None)],
            local,
            &config,
        );
        let applied = table.peer_failed(dead, local, &config);
        let t = applied.started[0].clone();
        table.apply(&[BucketRecord::full(4, Some(local), None, None)], local, &config);
        match &t.kind {
            TransferKind::NewOwner(n) => assert!(n.is_confirmed()),
            _ => unreachable!(),
        }
        assert!(table.get(4).unwrap().lock_slot().is_current(&t));
    }

    #[test]
    fn owner_record_with_new_backup_confirms_inferred_handoff() {
        let table = BucketTable::new();
        let local = PeerId::new();
        let dead = PeerId::new();
        let third = PeerId::new();
        let config = TransferConfig::default();
        table.apply(
            &[BucketRecord::full(4, Some(dead), Some(local), None)],
            local,
            &config,
        );
        let t = table.peer_failed(dead, local, &config).started[0].clone();

        // the rebalance after a failure names a fresh primary
        let applied = table.apply(
            &[BucketRecord::full(4, Some(local), Some(third), None)],
            local,
            &config,
        );
        assert!(applied.changed);
        assert!(applied.started.is_empty());
        match &t.kind {
            TransferKind::NewOwner(n) => assert!(n.is_confirmed()),
            _ => unreachable!(),
        }
        assert!(table.get(4).unwrap().lock_slot().is_current(&t));
        assert_eq!(table.get(4).unwrap().assignment().primary, Some(third));
    }

    #[test]
    fn superseded_handoff_returns_queued_messages() {
        let table = BucketTable::new();
        let local = PeerId::new();
        let a = PeerId::new();
        let b = PeerId::new();
        let config = TransferConfig::default();
        table.apply(&[owner_record(8, a)], local, &config);
        table.apply(&[owner_record(8, local)], local, &config);
        assert!(matches!(table.route(8, local, message()), Route::Queued));
        assert!(matches!(table.route(8, local, message()), Route::Queued));

        let applied = table.apply(&[owner_record(8, b)], local, &config);
        assert_eq!(applied.orphaned.len(), 2);
        assert!(applied.orphaned.iter().all(|(bucket, _)| *bucket == 8));
    }

    #[test]
    fn adjuncts_are_per_type() {
        #[derive(Default)]
        struct Counter(AtomicUsize);

        let table = BucketTable::new();
        let bucket = table.get(1).unwrap();
        assert!(bucket.adjunct_if_present::<Counter>().is_none());
        bucket.adjunct::<Counter>().0.fetch_add(2, Ordering::SeqCst);
        assert_eq!(bucket.adjunct::<Counter>().0.load(Ordering::SeqCst), 2);
        assert!(bucket.remove_adjunct::<Counter>().is_some());
        assert!(bucket.adjunct_if_present::<Counter>().is_none());
    }

    #[test]
    fn records_cover_every_bucket() {
        let table = BucketTable::new();
        let records = table.records();
        assert_eq!(records.len(), BUCKET_COUNT);
        assert_eq!(records[17].bucket, 17);
    }
}
