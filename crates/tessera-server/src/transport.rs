//! TCP carriage for peer requests.
//!
//! Each request opens a connection, writes one frame, and reads one frame
//! back. A frame is a 4-byte big-endian length followed by the payload and,
//! when a [`ClusterSecret`] is configured, a 32-byte HMAC tag inside the
//! length.
//!
//! Request payload: `[u16 path len][path][u16 param count]` then per param
//! `[u16 len][name][u16 len][value]`, then the body to the end.
//!
//! Reply payload: a status byte, `0` followed by the reply body or `1`
//! followed by a UTF-8 error message.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tessera_cluster::{BoxFuture, ClusterError, Node, PeerRequest, PeerTransport};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::auth::{ClusterSecret, TAG_LEN};

/// Largest frame accepted from a peer. Bucket state for a busy bucket can
/// be sizeable, but anything past this is treated as garbage.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const STATUS_OK: u8 = 0;
const STATUS_ERR: u8 = 1;

pub async fn write_frame<W>(w: &mut W, payload: &[u8], secret: Option<&ClusterSecret>) -> io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let tag = secret.map(|s| s.sign(payload));
    let total = payload.len() + tag.map_or(0, |t| t.len());
    if total > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame size {total} exceeds limit {MAX_FRAME_SIZE}"),
        ));
    }
    w.write_all(&(total as u32).to_be_bytes()).await?;
    w.write_all(payload).await?;
    if let Some(tag) = tag {
        w.write_all(&tag).await?;
    }
    w.flush().await
}

/// Reads one frame, verifying its tag when `secret` is set.
pub async fn read_frame<R>(r: &mut R, secret: Option<&ClusterSecret>) -> io::Result<Bytes>
where
    R: AsyncReadExt + Unpin,
{
    let len = r.read_u32().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame size {len} exceeds limit {MAX_FRAME_SIZE}"),
        ));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;

    let Some(secret) = secret else {
        return Ok(Bytes::from(buf));
    };
    if len < TAG_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame too short for auth tag",
        ));
    }
    let (payload, tag) = buf.split_at(len - TAG_LEN);
    if !secret.verify(payload, tag) {
        return Err(io::Error::new(io::ErrorKind::PermissionDenied, "peer auth failed"));
    }
    buf.truncate(len - TAG_LEN);
    Ok(Bytes::from(buf))
}

fn put_str(buf: &mut BytesMut, s: &str) -> io::Result<()> {
    let len = u16::try_from(s.len()).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "string field longer than 65535 bytes")
    })?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn get_str(buf: &mut &[u8]) -> io::Result<String> {
    let short = || io::Error::new(io::ErrorKind::UnexpectedEof, "truncated request");
    if buf.remaining() < 2 {
        return Err(short());
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(short());
    }
    let (head, rest) = buf.split_at(len);
    let s = std::str::from_utf8(head)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        .to_string();
    *buf = rest;
    Ok(s)
}

pub fn encode_request(request: &PeerRequest) -> io::Result<Bytes> {
    let mut buf = BytesMut::with_capacity(64 + request.body.len());
    put_str(&mut buf, &request.path)?;
    let count = u16::try_from(request.query.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too many query parameters"))?;
    buf.put_u16(count);
    for (name, value) in &request.query {
        put_str(&mut buf, name)?;
        put_str(&mut buf, value)?;
    }
    buf.put_slice(&request.body);
    Ok(buf.freeze())
}

pub fn decode_request(payload: Bytes) -> io::Result<PeerRequest> {
    let mut cursor: &[u8] = &payload;
    let mut request = PeerRequest::new(get_str(&mut cursor)?);
    if cursor.remaining() < 2 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated request"));
    }
    let count = cursor.get_u16();
    for _ in 0..count {
        let name = get_str(&mut cursor)?;
        let value = get_str(&mut cursor)?;
        request = request.param(&name, value);
    }
    let consumed = payload.len() - cursor.len();
    Ok(request.with_body(payload.slice(consumed..)))
}

fn encode_reply(result: &Result<Bytes, ClusterError>) -> Bytes {
    let mut buf = BytesMut::new();
    match result {
        Ok(body) => {
            buf.put_u8(STATUS_OK);
            buf.put_slice(body);
        }
        Err(e) => {
            buf.put_u8(STATUS_ERR);
            buf.put_slice(e.to_string().as_bytes());
        }
    }
    buf.freeze()
}

fn decode_reply(mut payload: Bytes) -> Result<Bytes, ClusterError> {
    if payload.is_empty() {
        return Err(ClusterError::Protocol("empty reply".into()));
    }
    match payload.get_u8() {
        STATUS_OK => Ok(payload),
        STATUS_ERR => Err(ClusterError::Remote(
            String::from_utf8_lossy(&payload).into_owned(),
        )),
        other => Err(ClusterError::Protocol(format!("unknown reply status {other}"))),
    }
}

fn network(e: io::Error) -> ClusterError {
    match e.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::PermissionDenied => {
            ClusterError::Protocol(e.to_string())
        }
        _ => ClusterError::Network(e.to_string()),
    }
}

/// Sends peer requests over TCP.
#[derive(Debug, Default)]
pub struct TcpTransport {
    secret: Option<Arc<ClusterSecret>>,
}

impl TcpTransport {
    pub fn new(secret: Option<Arc<ClusterSecret>>) -> Self {
        Self { secret }
    }

    async fn exchange(
        secret: Option<Arc<ClusterSecret>>,
        addr: SocketAddr,
        request: PeerRequest,
    ) -> Result<Bytes, ClusterError> {
        let payload = encode_request(&request).map_err(network)?;
        let mut stream = TcpStream::connect(addr).await.map_err(network)?;
        stream.set_nodelay(true).map_err(network)?;
        write_frame(&mut stream, &payload, secret.as_deref())
            .await
            .map_err(network)?;
        let reply = read_frame(&mut stream, secret.as_deref())
            .await
            .map_err(network)?;
        decode_reply(reply)
    }
}

impl PeerTransport for TcpTransport {
    fn post(&self, addr: SocketAddr, request: PeerRequest) -> BoxFuture<'static, Result<Bytes, ClusterError>> {
        Box::pin(Self::exchange(self.secret.clone(), addr, request))
    }
}

/// Accepts peer connections and hands each request to `node` until
/// `shutdown` flips to true.
pub async fn serve(
    listener: TcpListener,
    node: Arc<Node>,
    secret: Option<Arc<ClusterSecret>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, from)) => {
                    let node = Arc::clone(&node);
                    let secret = secret.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, node, secret).await {
                            debug!("connection from {} closed: {}", from, e);
                        }
                    });
                }
                Err(e) => warn!("accept failed: {}", e),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// Serves frames from one connection until the peer hangs up.
async fn handle_connection(
    mut stream: TcpStream,
    node: Arc<Node>,
    secret: Option<Arc<ClusterSecret>>,
) -> io::Result<()> {
    stream.set_nodelay(true)?;
    loop {
        let payload = match read_frame(&mut stream, secret.as_deref()).await {
            Ok(p) => p,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        let result = match decode_request(payload) {
            Ok(request) => node.handle_request(request).await,
            Err(e) => Err(ClusterError::from(e)),
        };
        if let Err(e) = &result {
            debug!("request failed: {}", e);
        }
        write_frame(&mut stream, &encode_reply(&result), secret.as_deref()).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tessera_cluster::{paths, ClusterConfig, PeerId, PeerInfo};

    use crate::discovery::SeedDiscovery;

    #[test]
    fn request_survives_the_wire() {
        let request = PeerRequest::new(paths::LOCK_LOCK)
            .param("key", "orders/17")
            .param("ttl", 5)
            .with_body(Bytes::from_static(b"\x00\x01body"));
        let decoded = decode_request(encode_request(&request).unwrap()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn truncated_request_rejected() {
        let encoded = encode_request(&PeerRequest::new("lock/free").param("uuid", "x")).unwrap();
        let err = decode_request(encoded.slice(..encoded.len() - 1)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn error_reply_becomes_remote() {
        let reply = encode_reply(&Err(ClusterError::TtlExpired));
        match decode_reply(reply) {
            Err(ClusterError::Remote(msg)) => assert!(msg.contains("ttl")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            decode_reply(encode_reply(&Ok(Bytes::from_static(b"ok")))).unwrap(),
            Bytes::from_static(b"ok")
        );
    }

    #[tokio::test]
    async fn authenticated_frame_round_trip() {
        let secret = ClusterSecret::from_password("s").unwrap();
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"payload", Some(&secret)).await.unwrap();
        let got = read_frame(&mut b, Some(&secret)).await.unwrap();
        assert_eq!(&got[..], b"payload");
    }

    #[tokio::test]
    async fn wrong_secret_rejected() {
        let ours = ClusterSecret::from_password("ours").unwrap();
        let theirs = ClusterSecret::from_password("theirs").unwrap();
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"payload", Some(&theirs)).await.unwrap();
        let err = read_frame(&mut b, Some(&ours)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes())
            .await
            .unwrap();
        let err = read_frame(&mut b, None).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    async fn tcp_node(
        secret: Option<Arc<ClusterSecret>>,
        seed: Option<SocketAddr>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Node> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut config = ClusterConfig::default();
        config.membership.cycle = Duration::from_millis(50);
        config.outbound.request_timeout = Duration::from_secs(2);

        let transport = Arc::new(TcpTransport::new(secret.clone()));
        let local = PeerInfo {
            id: PeerId::new(),
            addr,
            site: None,
        };
        let node = Node::start(local, config, transport.clone()).unwrap();
        let seeds = seed.into_iter().collect();
        node.set_discovery(Arc::new(SeedDiscovery::new(seeds, addr, transport)));
        tokio::spawn(serve(listener, Arc::clone(&node), secret, shutdown));
        node
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn nodes_meet_over_tcp() {
        let secret = Some(Arc::new(ClusterSecret::from_password("pool").unwrap()));
        let (stop, shutdown) = watch::channel(false);
        let first = tcp_node(secret.clone(), None, shutdown.clone()).await;
        let second = tcp_node(secret, Some(first.local().addr), shutdown).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let leader = first.leader();
            if first.view().len() == 2
                && second.view().len() == 2
                && leader.is_some()
                && second.leader() == leader
            {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "nodes never met");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let _ = stop.send(true);
        first.shutdown();
        second.shutdown();
    }

    #[tokio::test]
    async fn unknown_path_comes_back_as_remote_error() {
        let (_stop, shutdown) = watch::channel(false);
        let node = tcp_node(None, None, shutdown).await;
        let transport = TcpTransport::new(None);
        let err = transport
            .post(node.local().addr, PeerRequest::new("no/such/path"))
            .await
            .unwrap_err();
        match err {
            ClusterError::Remote(msg) => assert!(msg.contains("no/such/path")),
            other => panic!("unexpected {other:?}"),
        }
        node.shutdown();
    }
}
