//! Requester side: lock handles and the per-bucket table of attempts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::{LockCallback, LockIdentity, LockManager, LockState};
use crate::ClusterError;

pub(crate) struct LockInner {
    identity: LockIdentity,
    state: watch::Sender<LockState>,
    callback: Option<Arc<dyn LockCallback>>,
    manager: Weak<LockManager>,
    cleanup: mpsc::UnboundedSender<LockIdentity>,
}

impl LockInner {
    pub(crate) fn new(
        identity: LockIdentity,
        state: LockState,
        callback: Option<Arc<dyn LockCallback>>,
        manager: Weak<LockManager>,
        cleanup: mpsc::UnboundedSender<LockIdentity>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(state);
        Arc::new(Self {
            identity,
            state,
            callback,
            manager,
            cleanup,
        })
    }

    pub(crate) fn state(&self) -> LockState {
        *self.state.borrow()
    }

    pub(crate) fn callback(&self) -> Option<&Arc<dyn LockCallback>> {
        self.callback.as_ref()
    }

    /// Moves the handle to `next` if that is a forward step. Fires
    /// `lock_available` on the step to active.
    pub(crate) fn advance(&self, next: LockState) -> bool {
        let moved = self.state.send_if_modified(|current| {
            if current.can_become(next) {
                *current = next;
                true
            } else {
                false
            }
        });
        if moved && next == LockState::Active {
            if let Some(cb) = &self.callback {
                cb.lock_available(&self.identity);
            }
        }
        moved
    }

    /// Moves the handle to lost and fires `lock_unavailable` if it was
    /// still live.
    pub(crate) fn lose(&self) {
        if self.advance(LockState::Lost) {
            if let Some(cb) = &self.callback {
                cb.lock_unavailable(&self.identity);
            }
        }
    }
}

impl Drop for LockInner {
    fn drop(&mut self) {
        if !self.state().is_final() {
            let _ = self.cleanup.send(self.identity.clone());
        }
    }
}

/// Handle to one lock attempt.
///
/// Dropping the last clone of a handle that is still waiting or active
/// releases the lock in the background.
#[derive(Clone)]
pub struct Lock {
    inner: Arc<LockInner>,
}

impl Lock {
    pub(crate) fn from_inner(inner: Arc<LockInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<LockInner> {
        &self.inner
    }

    pub fn identity(&self) -> &LockIdentity {
        &self.inner.identity
    }

    pub fn state(&self) -> LockState {
        self.inner.state()
    }

    pub fn is_active(&self) -> bool {
        self.state() == LockState::Active
    }

    /// Waits until the attempt stops waiting and returns the state it
    /// reached.
    pub async fn wait_for_grant(&self) -> LockState {
        let mut rx = self.inner.state.subscribe();
        let state = match rx.wait_for(|s| *s != LockState::Waiting).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }

    /// Releases the lock, or gives up waiting for it.
    pub async fn free(&self) -> Result<(), ClusterError> {
        if self.state().is_final() {
            return Ok(());
        }
        let manager = self.inner.manager.upgrade().ok_or(ClusterError::Shutdown)?;
        let result = manager.release(&self.inner.identity).await;
        self.inner.advance(LockState::Free);
        result
    }

    /// Lease renewal. Locks do not expire, so there is nothing to renew.
    pub fn extend(&self) {}
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("identity", &self.inner.identity)
            .field("state", &self.state())
            .finish()
    }
}

/// Requester-side record of one attempt.
pub(crate) struct ClientRecord {
    identity: LockIdentity,
    state: LockState,
    /// The caller's handle. Dead for records that arrived by migration.
    handle: Weak<LockInner>,
}

impl ClientRecord {
    pub(crate) fn attached(inner: &Arc<LockInner>) -> Self {
        Self {
            identity: inner.identity.clone(),
            state: inner.state(),
            handle: Arc::downgrade(inner),
        }
    }

    pub(crate) fn detached(identity: LockIdentity, state: LockState) -> Self {
        Self {
            identity,
            state,
            handle: Weak::new(),
        }
    }

    pub(crate) fn identity(&self) -> &LockIdentity {
        &self.identity
    }

    pub(crate) fn state(&self) -> LockState {
        self.state
    }

    pub(crate) fn handle(&self) -> Option<Arc<LockInner>> {
        self.handle.upgrade()
    }
}

/// Requester-side records kept in the bucket of the requester key.
#[derive(Default)]
pub(crate) struct LocalLocks {
    records: Mutex<HashMap<Uuid, ClientRecord>>,
}

impl LocalLocks {
    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, ClientRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn insert(&self, record: ClientRecord) {
        self.lock().insert(record.identity.uuid, record);
    }

    pub(crate) fn remove(&self, uuid: &Uuid) -> Option<ClientRecord> {
        self.lock().remove(uuid)
    }

    /// Moves a record forward. Returns its handle, or `None` if there is
    /// no such record.
    pub(crate) fn advance(&self, uuid: &Uuid, next: LockState) -> Option<Weak<LockInner>> {
        let mut records = self.lock();
        let record = records.get_mut(uuid)?;
        if record.state.can_become(next) {
            record.state = next;
        }
        Some(record.handle.clone())
    }

    /// Returns true if the attempt is recorded as waiting or active.
    pub(crate) fn confirms(&self, identity: &LockIdentity) -> bool {
        self.lock()
            .get(&identity.uuid)
            .is_some_and(|r| !r.state.is_final())
    }

    /// Attempts this peer believes are waiting or active.
    pub(crate) fn live(&self) -> Vec<LockIdentity> {
        self.lock()
            .values()
            .filter(|r| !r.state.is_final())
            .map(|r| r.identity.clone())
            .collect()
    }

    pub(crate) fn detached(&self) -> Vec<(LockIdentity, LockState)> {
        self.lock()
            .values()
            .filter(|r| r.handle.strong_count() == 0)
            .map(|r| (r.identity.clone(), r.state))
            .collect()
    }

    /// Gives a handle-less record a new handle built by `make`.
    pub(crate) fn attach(
        &self,
        uuid: &Uuid,
        make: impl FnOnce(LockState) -> Arc<LockInner>,
    ) -> Option<Arc<LockInner>> {
        let mut records = self.lock();
        let record = records.get_mut(uuid)?;
        if record.handle.strong_count() > 0 {
            return None;
        }
        let inner = make(record.state);
        record.handle = Arc::downgrade(&inner);
        Some(inner)
    }

    /// Removes every record, for migration.
    pub(crate) fn drain(&self) -> Vec<ClientRecord> {
        self.lock().drain().map(|(_, r)| r).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn handle(state: LockState) -> (Arc<LockInner>, mpsc::UnboundedReceiver<LockIdentity>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = LockInner::new(LockIdentity::new("k", "o"), state, None, Weak::new(), tx);
        (inner, rx)
    }

    #[test]
    fn dropping_a_live_handle_requests_cleanup() {
        let (inner, mut rx) = handle(LockState::Active);
        let identity = inner.identity.clone();
        drop(Lock::from_inner(inner));
        assert_eq!(rx.try_recv().unwrap(), identity);
    }

    #[test]
    fn dropping_a_freed_handle_is_quiet() {
        let (inner, mut rx) = handle(LockState::Waiting);
        inner.advance(LockState::Free);
        drop(inner);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn handle_state_never_moves_back() {
        let (inner, _rx) = handle(LockState::Waiting);
        assert!(inner.advance(LockState::Active));
        assert!(!inner.advance(LockState::Waiting));
        assert!(inner.advance(LockState::Lost));
        assert!(!inner.advance(LockState::Active));
        assert_eq!(inner.state(), LockState::Lost);
    }

    #[test]
    fn grant_fires_callback_once() {
        struct Counter(AtomicUsize);
        impl LockCallback for Counter {
            fn lock_available(&self, _identity: &LockIdentity) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let (tx, _rx) = mpsc::unbounded_channel();
        let inner = LockInner::new(
            LockIdentity::new("k", "o"),
            LockState::Waiting,
            Some(counter.clone()),
            Weak::new(),
            tx,
        );
        inner.advance(LockState::Active);
        inner.advance(LockState::Active);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        inner.advance(LockState::Free);
    }

    #[test]
    fn losing_fires_unavailable_only_for_live_handles() {
        struct Counter(AtomicUsize);
        impl LockCallback for Counter {
            fn lock_unavailable(&self, _identity: &LockIdentity) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let inner = LockInner::new(
            LockIdentity::new("k", "o"),
            LockState::Waiting,
            Some(counter.clone()),
            Weak::new(),
            tx,
        );
        inner.lose();
        inner.lose();
        assert_eq!(inner.state(), LockState::Lost);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        drop(inner);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn wait_for_grant_returns_on_promotion() {
        let (inner, _rx) = handle(LockState::Waiting);
        let lock = Lock::from_inner(inner.clone());
        let waiter = tokio::spawn(async move { lock.wait_for_grant().await });
        tokio::task::yield_now().await;
        inner.advance(LockState::Active);
        assert_eq!(waiter.await.unwrap(), LockState::Active);
        inner.advance(LockState::Free);
    }

    #[test]
    fn records_track_handles() {
        let locals = LocalLocks::default();
        let (inner, _rx) = handle(LockState::Waiting);
        let identity = inner.identity.clone();
        locals.insert(ClientRecord::attached(&inner));
        assert!(locals.confirms(&identity));
        assert!(locals.detached().is_empty());

        assert!(locals.advance(&identity.uuid, LockState::Active).is_some());
        assert_eq!(locals.live(), vec![identity.clone()]);

        inner.advance(LockState::Free);
        drop(inner);
        assert_eq!(locals.detached(), vec![(identity.clone(), LockState::Active)]);
        assert!(locals.advance(&Uuid::new_v4(), LockState::Active).is_none());
    }

    #[test]
    fn attach_only_to_detached_records() {
        let locals = LocalLocks::default();
        let identity = LockIdentity::new("k", "o");
        locals.insert(ClientRecord::detached(identity.clone(), LockState::Active));
        let (tx, _rx) = mpsc::unbounded_channel();
        let make = |state| LockInner::new(identity.clone(), state, None, Weak::new(), tx.clone());
        let attached = locals.attach(&identity.uuid, make).unwrap();
        assert_eq!(attached.state(), LockState::Active);
        assert!(locals.attach(&identity.uuid, make).is_none());
        attached.advance(LockState::Free);
    }
}
