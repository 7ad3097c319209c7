//! Membership, election and rebalance across several in-process nodes.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use common::{eventually, pool, pool_with, settled, skew, test_config, MemoryNetwork};
use tessera_cluster::{ClusterEvent, PeerId, TransferConfig, BUCKET_COUNT};
use tokio::sync::broadcast;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_peers_split_buckets_evenly() {
    let net = MemoryNetwork::new();
    let nodes = pool(&net, 3).await;

    let table = nodes[0].buckets().snapshot();
    let leader = nodes[0].leader().unwrap();
    assert!(nodes.iter().any(|n| n.local_id() == leader));
    assert!(skew(&nodes) <= 1);

    let total: usize = nodes
        .iter()
        .map(|n| nodes[0].buckets().owned_by(n.local_id()))
        .sum();
    assert_eq!(total, BUCKET_COUNT);

    // one site: primaries share it, secondaries have nowhere to go
    for a in &table {
        assert!(a.primary.is_some());
        assert_ne!(a.primary, a.owner);
        assert!(a.secondary.is_none());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_peer_buckets_move_to_backups() {
    let net = MemoryNetwork::new();
    let nodes = pool(&net, 3).await;

    let victim = nodes[2].clone();
    let dead = victim.local_id();
    let before = nodes[0].buckets().snapshot();
    let orphaned: Vec<usize> = (0..BUCKET_COUNT)
        .filter(|&i| before[i].owner == Some(dead))
        .collect();
    assert!(!orphaned.is_empty());

    let mut failures = nodes[0].subscribe();
    net.kill(&victim);
    let survivors = vec![nodes[0].clone(), nodes[1].clone()];

    let seen = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(ClusterEvent::ServerFailed(id)) = failures.recv().await {
                if id == dead {
                    return;
                }
            }
        }
    })
    .await;
    assert!(seen.is_ok(), "failure was never detected");

    let ok = eventually(Duration::from_secs(15), || {
        let survivors = survivors.clone();
        async move { settled(&survivors) }
    })
    .await;
    assert!(ok, "survivors did not settle");

    let after = survivors[0].buckets().snapshot();
    assert!(after.iter().all(|a| a.owner.is_some() && a.owner != Some(dead)));
    assert!(after
        .iter()
        .all(|a| a.primary != Some(dead) && a.secondary != Some(dead)));

    // promotion put each orphan on its primary; evening out moves at most
    // a couple of them again
    let kept = orphaned
        .iter()
        .filter(|&&i| after[i].owner == before[i].primary)
        .count();
    assert!(
        kept + 2 >= orphaned.len(),
        "only {kept} of {} orphaned buckets stayed on their primary backup",
        orphaned.len()
    );
    assert!(skew(&survivors) <= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failover_handoff_finishes_without_waiting_out_the_timeout() {
    let mut config = test_config();
    config.transfer = TransferConfig::default();
    let limit = config.transfer.unconfirmed_timeout / 2;

    let net = MemoryNetwork::new();
    let nodes = pool_with(&net, 3, config).await;
    let leader = nodes[0].leader().unwrap();
    let victim = nodes
        .iter()
        .find(|n| n.local_id() != leader)
        .unwrap()
        .clone();
    let dead = victim.local_id();
    let survivors: Vec<_> = nodes
        .iter()
        .filter(|n| n.local_id() != dead)
        .cloned()
        .collect();

    let mut failures = survivors[0].subscribe();
    net.kill(&victim);
    let seen = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(ClusterEvent::ServerFailed(id)) = failures.recv().await {
                if id == dead {
                    return;
                }
            }
        }
    })
    .await;
    assert!(seen.is_ok(), "failure was never detected");

    // the leader's update both confirms the promotion and names a new
    // backup; the promoted buckets must not sit queued until they time out
    let ok = eventually(limit, || {
        let survivors = survivors.clone();
        async move { settled(&survivors) }
    })
    .await;
    assert!(ok, "survivors still had buckets in transition after {limit:?}");
    let table = survivors[0].buckets().snapshot();
    assert!(table.iter().all(|a| a.owner.is_some() && a.primary.is_some()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn joining_peer_takes_a_fair_share() {
    let net = MemoryNetwork::new();
    let mut nodes = pool(&net, 2).await;
    let before = nodes[0].buckets().snapshot();

    nodes.push(net.start(7600, None));
    let ok = eventually(Duration::from_secs(15), || {
        let nodes = nodes.clone();
        async move { settled(&nodes) }
    })
    .await;
    assert!(ok, "pool did not settle after a join");

    let after = nodes[0].buckets().snapshot();
    let moved = (0..BUCKET_COUNT)
        .filter(|&i| after[i].owner != before[i].owner)
        .count();
    // the newcomer gets about a third and nothing else moves
    let share = nodes[0].buckets().owned_by(nodes[2].local_id());
    assert_eq!(moved, share);
    assert!((341..=342).contains(&share));
}

async fn confirmations(mut rx: broadcast::Receiver<ClusterEvent>, window: Duration) -> Vec<PeerId> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        if let ClusterEvent::LeaderConfirmed(leader) = event {
            seen.push(leader);
        }
    }
    seen
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn five_peers_elect_one_leader_once() {
    let net = MemoryNetwork::new();
    let nodes: Vec<_> = (0..5).map(|i| net.start(7700 + i, None)).collect();
    let watchers: Vec<_> = nodes
        .iter()
        .map(|n| tokio::spawn(confirmations(n.subscribe(), Duration::from_secs(4))))
        .collect();

    let mut per_node: HashMap<usize, Vec<PeerId>> = HashMap::new();
    for (i, w) in watchers.into_iter().enumerate() {
        per_node.insert(i, w.await.unwrap());
    }

    let lowest = nodes.iter().map(|n| n.local_id()).min().unwrap();
    for (i, seen) in &per_node {
        assert_eq!(seen, &vec![lowest], "node {i} confirmed {seen:?}");
    }
    let leaders: Vec<_> = nodes.iter().map(|n| n.leader()).collect();
    assert!(leaders.iter().all(|l| *l == Some(lowest)));
    for n in &nodes {
        n.shutdown();
    }
}
