//! Lock side: holders and wait queues, kept in the bucket of the lock key.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use super::LockIdentity;
use crate::message::LockReply;

pub(crate) struct Entry {
    pub(crate) holder: LockIdentity,
    pub(crate) waiters: VecDeque<LockIdentity>,
}

impl Entry {
    fn tracks(&self, identity: &LockIdentity) -> bool {
        self.holder.uuid == identity.uuid || self.waiters.iter().any(|w| w.uuid == identity.uuid)
    }
}

#[derive(Default)]
pub(crate) struct GlobalLocks {
    entries: Mutex<HashMap<String, Entry>>,
}

impl GlobalLocks {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Grants the lock if it is free, queues the attempt if `wait` is set,
    /// refuses it otherwise. Repeated requests for the same attempt get the
    /// same answer.
    pub(crate) fn lock(&self, identity: &LockIdentity, wait: bool) -> LockReply {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(&identity.key) else {
            entries.insert(
                identity.key.clone(),
                Entry {
                    holder: identity.clone(),
                    waiters: VecDeque::new(),
                },
            );
            return LockReply::Active;
        };
        if entry.holder.uuid == identity.uuid {
            LockReply::Active
        } else if entry.waiters.iter().any(|w| w.uuid == identity.uuid) {
            LockReply::Waiting
        } else if wait {
            entry.waiters.push_back(identity.clone());
            LockReply::Waiting
        } else {
            LockReply::Unavailable
        }
    }

    /// Removes the attempt. If it held the lock, the first waiter becomes
    /// holder and is returned.
    pub(crate) fn free(&self, identity: &LockIdentity) -> Option<LockIdentity> {
        let mut entries = self.entries();
        let entry = entries.get_mut(&identity.key)?;
        if entry.holder.uuid != identity.uuid {
            entry.waiters.retain(|w| w.uuid != identity.uuid);
            return None;
        }
        match entry.waiters.pop_front() {
            Some(next) => {
                entry.holder = next.clone();
                Some(next)
            }
            None => {
                entries.remove(&identity.key);
                None
            }
        }
    }

    pub(crate) fn holder(&self, key: &str) -> Option<LockIdentity> {
        self.entries().get(key).map(|e| e.holder.clone())
    }

    /// Returns true if the attempt is the holder or queued.
    pub(crate) fn confirms(&self, identity: &LockIdentity) -> bool {
        self.entries()
            .get(&identity.key)
            .is_some_and(|e| e.tracks(identity))
    }

    /// Every holder and waiter.
    pub(crate) fn identities(&self) -> Vec<LockIdentity> {
        self.entries()
            .values()
            .flat_map(|e| std::iter::once(e.holder.clone()).chain(e.waiters.iter().cloned()))
            .collect()
    }

    /// Removes every entry, for migration.
    pub(crate) fn drain(&self) -> Vec<Entry> {
        self.entries().drain().map(|(_, e)| e).collect()
    }

    /// Adds a migrated entry. If the key is already tracked here, the
    /// migrated holder and waiters queue behind the local ones.
    pub(crate) fn merge(&self, incoming: Entry) {
        let mut entries = self.entries();
        match entries.get_mut(&incoming.holder.key) {
            None => {
                entries.insert(incoming.holder.key.clone(), incoming);
            }
            Some(existing) => {
                for id in std::iter::once(incoming.holder).chain(incoming.waiters) {
                    if !existing.tracks(&id) {
                        existing.waiters.push_back(id);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_lock_is_granted_and_busy_lock_refused() {
        let table = GlobalLocks::default();
        let a = LockIdentity::new("X", "A");
        let b = LockIdentity::new("X", "B");
        assert_eq!(table.lock(&a, false), LockReply::Active);
        assert_eq!(table.lock(&b, false), LockReply::Unavailable);
        assert_eq!(table.holder("X"), Some(a));
    }

    #[test]
    fn release_promotes_waiters_in_order() {
        let table = GlobalLocks::default();
        let a = LockIdentity::new("X", "A");
        let b = LockIdentity::new("X", "B");
        let c = LockIdentity::new("X", "C");
        table.lock(&a, false);
        assert_eq!(table.lock(&b, true), LockReply::Waiting);
        assert_eq!(table.lock(&c, true), LockReply::Waiting);

        assert_eq!(table.free(&a), Some(b.clone()));
        assert_eq!(table.holder("X"), Some(b.clone()));
        assert_eq!(table.free(&b), Some(c.clone()));
        assert_eq!(table.free(&c), None);
        assert_eq!(table.holder("X"), None);
    }

    #[test]
    fn freeing_a_waiter_only_dequeues_it() {
        let table = GlobalLocks::default();
        let a = LockIdentity::new("X", "A");
        let b = LockIdentity::new("X", "B");
        table.lock(&a, false);
        table.lock(&b, true);
        assert_eq!(table.free(&b), None);
        assert!(!table.confirms(&b));
        assert_eq!(table.free(&a), None);
    }

    #[test]
    fn repeated_request_is_idempotent() {
        let table = GlobalLocks::default();
        let a = LockIdentity::new("X", "A");
        let b = LockIdentity::new("X", "B");
        table.lock(&a, false);
        table.lock(&b, true);
        assert_eq!(table.lock(&a, false), LockReply::Active);
        assert_eq!(table.lock(&b, true), LockReply::Waiting);
        assert_eq!(table.identities().len(), 2);
    }

    #[test]
    fn merge_queues_behind_existing_holder() {
        let table = GlobalLocks::default();
        let a = LockIdentity::new("X", "A");
        let b = LockIdentity::new("X", "B");
        table.lock(&a, false);
        table.merge(Entry {
            holder: b.clone(),
            waiters: VecDeque::from([a.clone()]),
        });
        assert_eq!(table.holder("X"), Some(a.clone()));
        assert_eq!(table.free(&a), Some(b));
    }
}
