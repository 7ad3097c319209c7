//! Binary wire formats for peer-to-peer payloads.
//!
//! Every payload is a length-free stream: UUIDs are written as two
//! big-endian u64 halves, counters are fixed width, and optional fields are
//! `{tag, payload}` pairs closed by tag 0. Multi-byte integers are
//! big-endian throughout.
//!
//! A stream cannot be resynchronised after an unknown tag, so decoders keep
//! every record that parsed before the failure and report the error
//! alongside them. Callers apply what they got and log the rest.

use std::io;
use std::net::SocketAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::lock::LockIdentity;
use crate::{ClusterError, PeerId};

/// Upper bound on any length prefix. Prevents allocation bombs from crafted
/// payloads.
const MAX_BLOB_LEN: usize = 64 * 1024 * 1024;

const END: u8 = 0;

// descriptor tags
const DESC_ADDR: u8 = 1;
const DESC_SITE: u8 = 2;

// bucket update tags
const OWNER_SET: u8 = 1;
const OWNER_NULL: u8 = 2;
const PRIMARY_SET: u8 = 3;
const PRIMARY_NULL: u8 = 4;
const SECONDARY_SET: u8 = 5;
const SECONDARY_NULL: u8 = 6;

// session data tags
const SESSION_ITEM: u8 = 1;

// audit tags
const AUDIT_CLIENT: u8 = 1;
const AUDIT_SERVER: u8 = 2;

// lock reply codes
const REPLY_ACTIVE: u8 = 1;
const REPLY_WAITING: u8 = 2;
const REPLY_UNAVAILABLE: u8 = 3;

// Safe read helpers that return io::Error instead of panicking on truncated input.

pub(crate) fn safe_get_u8(buf: &mut &[u8]) -> io::Result<u8> {
    if buf.is_empty() {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "need 1 byte"));
    }
    Ok(buf.get_u8())
}

fn safe_get_u16(buf: &mut &[u8]) -> io::Result<u16> {
    if buf.len() < 2 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "need 2 bytes"));
    }
    Ok(buf.get_u16())
}

pub(crate) fn safe_get_u32(buf: &mut &[u8]) -> io::Result<u32> {
    if buf.len() < 4 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "need 4 bytes"));
    }
    Ok(buf.get_u32())
}

fn safe_get_u64(buf: &mut &[u8]) -> io::Result<u64> {
    if buf.len() < 8 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "need 8 bytes"));
    }
    Ok(buf.get_u64())
}

pub(crate) fn unknown_tag(what: &str, tag: u8) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unknown {what} tag: {tag}"),
    )
}

/// Records decoded from a stream, plus the error that stopped decoding early.
#[derive(Debug)]
pub struct Decoded<T> {
    pub items: Vec<T>,
    pub error: Option<io::Error>,
}

impl<T> Decoded<T> {
    fn decode_all(
        mut buf: &[u8],
        mut one: impl FnMut(&mut &[u8]) -> io::Result<T>,
    ) -> Self {
        let mut items = Vec::new();
        while !buf.is_empty() {
            match one(&mut buf) {
                Ok(item) => items.push(item),
                Err(e) => {
                    return Self {
                        items,
                        error: Some(e),
                    }
                }
            }
        }
        Self { items, error: None }
    }
}

pub(crate) fn encode_uuid(buf: &mut BytesMut, id: &Uuid) {
    let (msb, lsb) = id.as_u64_pair();
    buf.put_u64(msb);
    buf.put_u64(lsb);
}

pub(crate) fn decode_uuid(buf: &mut &[u8]) -> io::Result<Uuid> {
    let msb = safe_get_u64(buf)?;
    let lsb = safe_get_u64(buf)?;
    Ok(Uuid::from_u64_pair(msb, lsb))
}

pub(crate) fn encode_peer_id(buf: &mut BytesMut, id: &PeerId) {
    encode_uuid(buf, &id.0);
}

pub(crate) fn decode_peer_id(buf: &mut &[u8]) -> io::Result<PeerId> {
    decode_uuid(buf).map(PeerId)
}

fn encode_socket_addr(buf: &mut BytesMut, addr: &SocketAddr) {
    match addr {
        SocketAddr::V4(v4) => {
            buf.put_u8(4);
            buf.put_slice(&v4.ip().octets());
            buf.put_u16(v4.port());
        }
        SocketAddr::V6(v6) => {
            buf.put_u8(6);
            buf.put_slice(&v6.ip().octets());
            buf.put_u16(v6.port());
        }
    }
}

fn decode_socket_addr(buf: &mut &[u8]) -> io::Result<SocketAddr> {
    match safe_get_u8(buf)? {
        4 => {
            if buf.len() < 6 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "not enough bytes for ipv4 address",
                ));
            }
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            let port = buf.get_u16();
            Ok(SocketAddr::from((octets, port)))
        }
        6 => {
            if buf.len() < 18 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "not enough bytes for ipv6 address",
                ));
            }
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            let port = buf.get_u16();
            Ok(SocketAddr::from((octets, port)))
        }
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown address type: {other}"),
        )),
    }
}

/// Longest string the wire format carries.
pub(crate) const MAX_STR_LEN: usize = u16::MAX as usize;

/// Rejects strings too long for a u16 length prefix.
pub(crate) fn check_str_len(s: &str) -> Result<(), ClusterError> {
    if s.len() > MAX_STR_LEN {
        return Err(ClusterError::TooLong(s.len()));
    }
    Ok(())
}

/// Callers keep `s` within [`MAX_STR_LEN`] with [`check_str_len`].
pub(crate) fn encode_str(buf: &mut BytesMut, s: &str) {
    debug_assert!(s.len() <= MAX_STR_LEN, "unchecked {} byte string", s.len());
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

pub(crate) fn decode_str(buf: &mut &[u8]) -> io::Result<String> {
    let len = safe_get_u16(buf)? as usize;
    if buf.len() < len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "not enough bytes for string",
        ));
    }
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        .to_owned();
    buf.advance(len);
    Ok(s)
}

fn encode_blob(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

fn decode_blob(buf: &mut &[u8]) -> io::Result<Bytes> {
    let len = safe_get_u32(buf)? as usize;
    if len > MAX_BLOB_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("blob length {len} exceeds limit"),
        ));
    }
    if buf.len() < len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "not enough bytes for blob",
        ));
    }
    let data = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(data)
}

// -- peer descriptors (admin) --

/// One peer's entry in an `admin` gossip batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDescriptor {
    pub id: PeerId,
    pub count: u32,
    pub addr: SocketAddr,
    pub site: Option<SocketAddr>,
}

impl PeerDescriptor {
    pub fn encode_into(&self, buf: &mut BytesMut) {
        encode_peer_id(buf, &self.id);
        buf.put_u32(self.count);
        buf.put_u8(DESC_ADDR);
        encode_socket_addr(buf, &self.addr);
        if let Some(site) = &self.site {
            buf.put_u8(DESC_SITE);
            encode_socket_addr(buf, site);
        }
        buf.put_u8(END);
    }

    fn decode_one(buf: &mut &[u8]) -> io::Result<Self> {
        let id = decode_peer_id(buf)?;
        let count = safe_get_u32(buf)?;
        let mut addr = None;
        let mut site = None;
        loop {
            match safe_get_u8(buf)? {
                END => break,
                DESC_ADDR => addr = Some(decode_socket_addr(buf)?),
                DESC_SITE => site = Some(decode_socket_addr(buf)?),
                other => return Err(unknown_tag("descriptor", other)),
            }
        }
        let addr = addr.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "descriptor without address")
        })?;
        Ok(Self {
            id,
            count,
            addr,
            site,
        })
    }

    /// Encodes a batch of descriptors back to back.
    pub fn encode_batch(descriptors: &[PeerDescriptor]) -> Bytes {
        let mut buf = BytesMut::with_capacity(descriptors.len() * 48);
        for d in descriptors {
            d.encode_into(&mut buf);
        }
        buf.freeze()
    }

    pub fn decode_batch(buf: &[u8]) -> Decoded<PeerDescriptor> {
        Decoded::decode_all(buf, Self::decode_one)
    }
}

// -- ballots (vote) --

/// A single voter's current choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ballot {
    pub voter: PeerId,
    pub candidate: PeerId,
    /// Milliseconds since the epoch, strictly increasing per voter.
    pub timestamp: u64,
}

impl Ballot {
    pub fn encode_batch(ballots: &[Ballot]) -> Bytes {
        let mut buf = BytesMut::with_capacity(ballots.len() * 40);
        for b in ballots {
            encode_peer_id(&mut buf, &b.voter);
            encode_peer_id(&mut buf, &b.candidate);
            buf.put_u64(b.timestamp);
        }
        buf.freeze()
    }

    pub fn decode_batch(buf: &[u8]) -> Decoded<Ballot> {
        Decoded::decode_all(buf, |buf| {
            Ok(Ballot {
                voter: decode_peer_id(buf)?,
                candidate: decode_peer_id(buf)?,
                timestamp: safe_get_u64(buf)?,
            })
        })
    }
}

// -- bucket updates (bucket/update) --

/// One field change inside a bucket record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketChange {
    Owner(Option<PeerId>),
    Primary(Option<PeerId>),
    Secondary(Option<PeerId>),
}

/// All changes for a single bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketRecord {
    pub bucket: u16,
    pub changes: Vec<BucketChange>,
}

impl BucketRecord {
    /// A record that states owner and both backups outright.
    pub fn full(
        bucket: u16,
        owner: Option<PeerId>,
        primary: Option<PeerId>,
        secondary: Option<PeerId>,
    ) -> Self {
        Self {
            bucket,
            changes: vec![
                BucketChange::Owner(owner),
                BucketChange::Primary(primary),
                BucketChange::Secondary(secondary),
            ],
        }
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u16(self.bucket);
        for change in &self.changes {
            let (set_tag, null_tag, value) = match change {
                BucketChange::Owner(v) => (OWNER_SET, OWNER_NULL, v),
                BucketChange::Primary(v) => (PRIMARY_SET, PRIMARY_NULL, v),
                BucketChange::Secondary(v) => (SECONDARY_SET, SECONDARY_NULL, v),
            };
            match value {
                Some(id) => {
                    buf.put_u8(set_tag);
                    encode_peer_id(buf, id);
                }
                None => buf.put_u8(null_tag),
            }
        }
        buf.put_u8(END);
    }

    fn decode_one(buf: &mut &[u8]) -> io::Result<Self> {
        let bucket = safe_get_u16(buf)?;
        let mut changes = Vec::with_capacity(3);
        loop {
            let change = match safe_get_u8(buf)? {
                END => break,
                OWNER_SET => BucketChange::Owner(Some(decode_peer_id(buf)?)),
                OWNER_NULL => BucketChange::Owner(None),
                PRIMARY_SET => BucketChange::Primary(Some(decode_peer_id(buf)?)),
                PRIMARY_NULL => BucketChange::Primary(None),
                SECONDARY_SET => BucketChange::Secondary(Some(decode_peer_id(buf)?)),
                SECONDARY_NULL => BucketChange::Secondary(None),
                other => return Err(unknown_tag("bucket update", other)),
            };
            changes.push(change);
        }
        Ok(Self { bucket, changes })
    }

    pub fn encode_batch(records: &[BucketRecord]) -> Bytes {
        let mut buf = BytesMut::with_capacity(records.len() * 56);
        for r in records {
            r.encode_into(&mut buf);
        }
        buf.freeze()
    }

    pub fn decode_batch(buf: &[u8]) -> Decoded<BucketRecord> {
        Decoded::decode_all(buf, Self::decode_one)
    }
}

// -- session data (bucket/sessionData) --

/// One backup provider's snapshot of a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Which registered provider produced it, and will restore it.
    pub kind: String,
    pub data: Bytes,
}

impl Snapshot {
    pub fn encode_batch(items: &[Snapshot]) -> Bytes {
        let mut buf = BytesMut::new();
        for item in items {
            buf.put_u8(SESSION_ITEM);
            encode_str(&mut buf, &item.kind);
            encode_blob(&mut buf, &item.data);
        }
        buf.put_u8(END);
        buf.freeze()
    }

    fn decode_item(buf: &mut &[u8]) -> io::Result<Self> {
        let kind = decode_str(buf)?;
        let data = decode_blob(buf)?;
        Ok(Self { kind, data })
    }

    pub fn decode_batch(mut buf: &[u8]) -> Decoded<Snapshot> {
        let mut items = Vec::new();
        loop {
            let tag = match safe_get_u8(&mut buf) {
                Ok(tag) => tag,
                Err(e) => {
                    return Decoded {
                        items,
                        error: Some(e),
                    }
                }
            };
            let item = match tag {
                END => return Decoded { items, error: None },
                SESSION_ITEM => Self::decode_item(&mut buf),
                other => Err(unknown_tag("session data", other)),
            };
            match item {
                Ok(item) => items.push(item),
                Err(e) => {
                    return Decoded {
                        items,
                        error: Some(e),
                    }
                }
            }
        }
    }
}

// -- lock identities --

pub(crate) fn encode_identity(buf: &mut BytesMut, id: &LockIdentity) {
    encode_uuid(buf, &id.uuid);
    encode_str(buf, &id.key);
    encode_str(buf, &id.owner_key);
}

pub(crate) fn decode_identity(buf: &mut &[u8]) -> io::Result<LockIdentity> {
    let uuid = decode_uuid(buf)?;
    let key = decode_str(buf)?;
    let owner_key = decode_str(buf)?;
    Ok(LockIdentity {
        key,
        owner_key,
        uuid,
    })
}

/// Lock identities exchanged by the audit, split by which table they came
/// from on the sender.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditData {
    /// Requester-side records the sender believes are live.
    pub client: Vec<LockIdentity>,
    /// Lock-key-side entries (holders and waiters) the sender tracks.
    pub server: Vec<LockIdentity>,
}

impl AuditData {
    pub fn is_empty(&self) -> bool {
        self.client.is_empty() && self.server.is_empty()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        for id in &self.client {
            buf.put_u8(AUDIT_CLIENT);
            encode_identity(&mut buf, id);
        }
        for id in &self.server {
            buf.put_u8(AUDIT_SERVER);
            encode_identity(&mut buf, id);
        }
        buf.put_u8(END);
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> io::Result<Self> {
        let mut data = AuditData::default();
        loop {
            match safe_get_u8(&mut buf)? {
                END => return Ok(data),
                AUDIT_CLIENT => data.client.push(decode_identity(&mut buf)?),
                AUDIT_SERVER => data.server.push(decode_identity(&mut buf)?),
                other => return Err(unknown_tag("audit", other)),
            }
        }
    }
}

/// Outcome of a lock request as seen by the lock key's owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockReply {
    /// The requester now holds the lock.
    Active,
    /// The requester is queued behind the current holder.
    Waiting,
    /// The lock is held and the requester did not want to wait.
    Unavailable,
}

impl LockReply {
    pub fn encode(self) -> Bytes {
        let code = match self {
            LockReply::Active => REPLY_ACTIVE,
            LockReply::Waiting => REPLY_WAITING,
            LockReply::Unavailable => REPLY_UNAVAILABLE,
        };
        Bytes::copy_from_slice(&[code])
    }

    pub fn decode(mut buf: &[u8]) -> io::Result<Self> {
        match safe_get_u8(&mut buf)? {
            REPLY_ACTIVE => Ok(LockReply::Active),
            REPLY_WAITING => Ok(LockReply::Waiting),
            REPLY_UNAVAILABLE => Ok(LockReply::Unavailable),
            other => Err(unknown_tag("lock reply", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn uuid_is_big_endian_pair() {
        let id = Uuid::from_u64_pair(0x0102030405060708, 0x090a0b0c0d0e0f10);
        let mut buf = BytesMut::new();
        encode_uuid(&mut buf, &id);
        assert_eq!(&buf[..], &(1u8..=16).collect::<Vec<_>>()[..]);
    }

    #[test]
    fn descriptor_batch_with_and_without_site() {
        let a = PeerDescriptor {
            id: PeerId::new(),
            count: 7,
            addr: addr(9000),
            site: None,
        };
        let b = PeerDescriptor {
            id: PeerId::new(),
            count: 1,
            addr: SocketAddr::from(([0u16, 0, 0, 0, 0, 0, 0, 1], 9001)),
            site: Some(addr(80)),
        };
        let bytes = PeerDescriptor::encode_batch(&[a.clone(), b.clone()]);
        let decoded = PeerDescriptor::decode_batch(&bytes);
        assert!(decoded.error.is_none());
        assert_eq!(decoded.items, vec![a, b]);
    }

    #[test]
    fn unknown_descriptor_tag_keeps_earlier_records() {
        let good = PeerDescriptor {
            id: PeerId::new(),
            count: 3,
            addr: addr(9000),
            site: None,
        };
        let mut buf = BytesMut::new();
        good.encode_into(&mut buf);
        encode_peer_id(&mut buf, &PeerId::new());
        buf.put_u32(1);
        buf.put_u8(99); // unknown tag

        let decoded = PeerDescriptor::decode_batch(&buf);
        assert_eq!(decoded.items, vec![good]);
        assert!(decoded.error.is_some());
    }

    #[test]
    fn bucket_record_null_and_set_tags() {
        let owner = PeerId::new();
        let rec = BucketRecord::full(1023, Some(owner), None, None);
        let mut buf = BytesMut::new();
        rec.encode_into(&mut buf);
        // 2 index + (1 + 16) owner + 1 primary null + 1 secondary null + end
        assert_eq!(buf.len(), 2 + 17 + 1 + 1 + 1);
        assert_eq!(buf[buf.len() - 1], END);

        let decoded = BucketRecord::decode_batch(&buf);
        assert_eq!(decoded.items, vec![rec]);
    }

    #[test]
    fn truncated_bucket_update_is_reported() {
        let rec = BucketRecord::full(5, Some(PeerId::new()), None, None);
        let bytes = BucketRecord::encode_batch(&[rec.clone(), rec.clone()]);
        let decoded = BucketRecord::decode_batch(&bytes[..bytes.len() - 3]);
        assert_eq!(decoded.items.len(), 1);
        assert!(decoded.error.is_some());
    }

    #[test]
    fn session_data_empty_and_populated() {
        let empty = Snapshot::encode_batch(&[]);
        assert_eq!(&empty[..], &[END]);
        let decoded = Snapshot::decode_batch(&empty);
        assert!(decoded.items.is_empty() && decoded.error.is_none());

        let items = vec![Snapshot {
            kind: "lock".into(),
            data: Bytes::from_static(b"abc"),
        }];
        let decoded = Snapshot::decode_batch(&Snapshot::encode_batch(&items));
        assert_eq!(decoded.items, items);
    }

    #[test]
    fn string_length_limit() {
        assert!(check_str_len(&"k".repeat(MAX_STR_LEN)).is_ok());
        let err = check_str_len(&"é".repeat(MAX_STR_LEN / 2 + 1)).unwrap_err();
        assert!(matches!(err, ClusterError::TooLong(n) if n == MAX_STR_LEN + 1));
    }

    #[test]
    fn oversized_blob_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(SESSION_ITEM);
        encode_str(&mut buf, "x");
        buf.put_u32(u32::MAX);
        let decoded = Snapshot::decode_batch(&buf);
        assert!(decoded.items.is_empty());
        assert!(decoded.error.is_some());
    }

    #[test]
    fn audit_data_keeps_sides_apart() {
        let id = LockIdentity::new("k", "o");
        let data = AuditData {
            client: vec![id.clone()],
            server: vec![],
        };
        let decoded = AuditData::decode(&data.encode()).unwrap();
        assert_eq!(decoded.client, vec![id]);
        assert!(decoded.server.is_empty());
        assert!(AuditData::decode(&AuditData::default().encode())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn lock_reply_codes() {
        for reply in [LockReply::Active, LockReply::Waiting, LockReply::Unavailable] {
            assert_eq!(LockReply::decode(&reply.encode()).unwrap(), reply);
        }
        assert!(LockReply::decode(&[42]).is_err());
        assert!(LockReply::decode(&[]).is_err());
    }
}
