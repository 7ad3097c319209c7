//! Migration of lock tables with their bucket.
//!
//! Payload: a tag stream of `{1, identity, state byte}` for each
//! requester-side record and `{2, holder, u32 count, waiters..}` for each
//! lock-side entry, closed by tag 0.

use std::collections::VecDeque;
use std::sync::Weak;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use super::client::{ClientRecord, LocalLocks};
use super::server::{Entry, GlobalLocks};
use super::{LockManager, LockState};
use crate::message::{decode_identity, encode_identity, safe_get_u32, safe_get_u8, unknown_tag};
use crate::{Backup, ClusterError};

const END: u8 = 0;
const CLIENT: u8 = 1;
const SERVER: u8 = 2;

pub(super) struct LockBackup {
    manager: Weak<LockManager>,
}

impl LockBackup {
    pub(super) fn new(manager: Weak<LockManager>) -> Self {
        Self { manager }
    }
}

impl Backup for LockBackup {
    fn kind(&self) -> &str {
        "lock"
    }

    fn generate(&self, bucket: u16) -> Option<Bytes> {
        let manager = self.manager.upgrade()?;
        let b = manager.shared.buckets.get(bucket)?;
        let clients = b
            .remove_adjunct::<LocalLocks>()
            .map(|locals| locals.drain())
            .unwrap_or_default();
        let entries = b
            .remove_adjunct::<GlobalLocks>()
            .map(|globals| globals.drain())
            .unwrap_or_default();
        if clients.is_empty() && entries.is_empty() {
            return None;
        }
        // the attempts live on with the bucket; handles left here stop
        // tracking them
        for record in &clients {
            if let Some(inner) = record.handle() {
                inner.lose();
            }
        }
        debug!(
            "bucket {}: migrating {} lock records and {} held locks",
            bucket,
            clients.len(),
            entries.len()
        );
        Some(encode(&clients, &entries))
    }

    fn restore(&self, bucket: u16, data: &[u8]) -> Result<(), ClusterError> {
        let manager = self.manager.upgrade().ok_or(ClusterError::Shutdown)?;
        let b = manager
            .shared
            .buckets
            .get(bucket)
            .ok_or_else(|| ClusterError::Protocol(format!("bucket {bucket} out of range")))?;
        let (clients, entries) = decode(data)?;
        if !clients.is_empty() {
            let locals = b.adjunct::<LocalLocks>();
            for record in clients {
                locals.insert(record);
            }
        }
        if !entries.is_empty() {
            let globals = b.adjunct::<GlobalLocks>();
            for entry in entries {
                globals.merge(entry);
            }
        }
        Ok(())
    }
}

fn encode(clients: &[ClientRecord], entries: &[Entry]) -> Bytes {
    let mut buf = BytesMut::new();
    for record in clients {
        buf.put_u8(CLIENT);
        encode_identity(&mut buf, record.identity());
        buf.put_u8(record.state().to_byte());
    }
    for entry in entries {
        buf.put_u8(SERVER);
        encode_identity(&mut buf, &entry.holder);
        buf.put_u32(entry.waiters.len() as u32);
        for waiter in &entry.waiters {
            encode_identity(&mut buf, waiter);
        }
    }
    buf.put_u8(END);
    buf.freeze()
}

fn decode(mut buf: &[u8]) -> std::io::Result<(Vec<ClientRecord>, Vec<Entry>)> {
    let mut clients = Vec::new();
    let mut entries = Vec::new();
    loop {
        match safe_get_u8(&mut buf)? {
            END => return Ok((clients, entries)),
            CLIENT => {
                let identity = decode_identity(&mut buf)?;
                let raw = safe_get_u8(&mut buf)?;
                let state =
                    LockState::from_byte(raw).ok_or_else(|| unknown_tag("lock state", raw))?;
                // records arrive without a handle; see LockManager::adopt
                clients.push(ClientRecord::detached(identity, state));
            }
            SERVER => {
                let holder = decode_identity(&mut buf)?;
                let count = safe_get_u32(&mut buf)?;
                let mut waiters = VecDeque::new();
                for _ in 0..count {
                    waiters.push_back(decode_identity(&mut buf)?);
                }
                entries.push(Entry { holder, waiters });
            }
            other => return Err(unknown_tag("lock migration", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockIdentity;

    #[test]
    fn tables_survive_migration_encoding() {
        let a = LockIdentity::new("X", "A");
        let b = LockIdentity::new("X", "B");
        let clients = vec![ClientRecord::detached(a.clone(), LockState::Active)];
        let entries = vec![Entry {
            holder: a.clone(),
            waiters: VecDeque::from([b.clone()]),
        }];

        let (clients, entries) = decode(&encode(&clients, &entries)).unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].identity(), &a);
        assert_eq!(clients[0].state(), LockState::Active);
        assert!(clients[0].handle().is_none());
        assert_eq!(entries[0].holder, a);
        assert_eq!(entries[0].waiters, VecDeque::from([b]));
    }

    #[test]
    fn bad_state_byte_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(CLIENT);
        encode_identity(&mut buf, &LockIdentity::new("X", "A"));
        buf.put_u8(9);
        buf.put_u8(END);
        let Err(err) = decode(&buf) else {
            panic!("unknown state byte decoded");
        };
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_waiter_list_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(SERVER);
        encode_identity(&mut buf, &LockIdentity::new("X", "A"));
        buf.put_u32(3);
        assert!(decode(&buf).is_err());
    }
}
