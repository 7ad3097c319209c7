//! Ownership handoff: state moves with the bucket and queued traffic keeps
//! its order.

mod common;

use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use common::{eventually, pool, MemoryNetwork};
use tessera_cluster::{
    paths, Backup, BucketRecord, ClusterError, Message, PeerRequest, RemotePeer, Routed,
    BUCKET_COUNT,
};

type Log = Arc<Mutex<Vec<String>>>;

/// Application state for one bucket. With a gate, `generate` blocks until
/// the test lets it go.
struct Notes {
    bucket: u16,
    log: Log,
    gate: Option<Mutex<mpsc::Receiver<()>>>,
}

impl Backup for Notes {
    fn kind(&self) -> &str {
        "notes"
    }

    fn generate(&self, bucket: u16) -> Option<Bytes> {
        if bucket != self.bucket {
            return None;
        }
        if let Some(gate) = &self.gate {
            let _ = gate.lock().unwrap().recv_timeout(Duration::from_secs(5));
        }
        Some(Bytes::from_static(b"state"))
    }

    fn restore(&self, _bucket: u16, data: &[u8]) -> Result<(), ClusterError> {
        let text = String::from_utf8_lossy(data).into_owned();
        self.log.lock().unwrap().push(format!("restored {text}"));
        Ok(())
    }
}

struct Append {
    seq: u32,
    log: Log,
}

impl Message for Append {
    fn process(self: Box<Self>) {
        self.log.lock().unwrap().push(format!("m{}", self.seq));
    }

    fn send_to_peer(self: Box<Self>, peer: RemotePeer, _bucket: u16) {
        self.log
            .lock()
            .unwrap()
            .push(format!("m{} sent to {}", self.seq, peer.id()));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queued_messages_run_in_order_after_restore() {
    let net = MemoryNetwork::new();
    let nodes = pool(&net, 2).await;
    let (gaining, losing) = (&nodes[0], &nodes[1]);

    let bucket = (0..BUCKET_COUNT as u16)
        .find(|&b| gaining.bucket_owner(b) == Some(losing.local_id()))
        .unwrap();
    let log: Log = Arc::default();
    let (open, gate) = mpsc::channel();
    gaining.register_backup(Arc::new(Notes {
        bucket,
        log: log.clone(),
        gate: None,
    }));
    losing.register_backup(Arc::new(Notes {
        bucket,
        log: log.clone(),
        gate: Some(Mutex::new(gate)),
    }));

    // the gaining side passes the update on; the losing side's state is
    // held back until traffic has queued up
    let update = BucketRecord::encode_batch(&[BucketRecord::full(
        bucket,
        Some(gaining.local_id()),
        Some(losing.local_id()),
        None,
    )]);
    gaining
        .handle_request(PeerRequest::new(paths::BUCKET_UPDATE).with_body(update))
        .await
        .unwrap();
    gaining.flush().await.unwrap();
    assert!(gaining.buckets().get(bucket).unwrap().in_transition());

    for seq in 1..=3 {
        let routed = gaining
            .route(bucket, Box::new(Append { seq, log: log.clone() }))
            .unwrap();
        assert!(matches!(routed, Routed::Queued), "m{seq} was {routed:?}");
    }
    open.send(()).unwrap();

    let done = eventually(Duration::from_secs(5), || {
        let log = log.clone();
        async move { log.lock().unwrap().len() >= 4 }
    })
    .await;
    assert!(done, "handoff never completed: {:?}", log.lock().unwrap());
    assert_eq!(
        *log.lock().unwrap(),
        vec!["restored state", "m1", "m2", "m3"]
    );

    let settled = eventually(Duration::from_secs(5), || {
        let gaining = gaining.clone();
        async move { !gaining.buckets().get(bucket).unwrap().in_transition() }
    })
    .await;
    assert!(settled);
    gaining
        .route_or_handle(bucket, Box::new(Append { seq: 4, log: log.clone() }))
        .unwrap();
    assert_eq!(log.lock().unwrap().last().map(String::as_str), Some("m4"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn old_owner_forwards_during_handoff() {
    let net = MemoryNetwork::new();
    let nodes = pool(&net, 2).await;
    let (gaining, losing) = (&nodes[0], &nodes[1]);
    let bucket = (0..BUCKET_COUNT as u16)
        .find(|&b| losing.bucket_owner(b) == Some(losing.local_id()))
        .unwrap();

    let update = BucketRecord::encode_batch(&[BucketRecord::full(
        bucket,
        Some(gaining.local_id()),
        None,
        None,
    )]);
    losing
        .handle_request(PeerRequest::new(paths::BUCKET_UPDATE).with_body(update))
        .await
        .unwrap();
    losing.flush().await.unwrap();

    let log: Log = Arc::default();
    match losing.route(bucket, Box::new(Append { seq: 1, log: log.clone() })) {
        Ok(Routed::Remote(peer)) => assert_eq!(peer, gaining.local_id()),
        other => panic!("expected forwarding, got {other:?}"),
    }
    assert_eq!(log.lock().unwrap().len(), 1);
}
