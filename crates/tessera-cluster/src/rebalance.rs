//! Bucket assignment planning, run by the leader.
//!
//! [`plan`] works on a copy of the bucket table and the active peer list and
//! returns the full new table. It is pure so it can run off the event loop.
//!
//! The passes, in order:
//!
//! 1. Owners. Orphaned buckets go to the least-loaded peer, then buckets
//!    move from the most-loaded to the least-loaded peer until no two
//!    peers differ by more than one bucket.
//! 2. Site correction. A primary backup must share the owner's site and a
//!    secondary backup must not.
//! 3. Primary backups. For each peer, pretend it failed and spread its
//!    buckets over the remaining same-site peers so the survivors end up
//!    evenly loaded.
//! 4. Secondary backups. The same, drawing on peers from other sites.

use std::collections::{BTreeMap, HashMap};

use crate::bucket::Assignment;
use crate::{PeerId, PeerInfo};

/// Computes a new assignment for every bucket.
///
/// `peers` is the active peer set including the leader itself. Backups that
/// are still valid are kept; only empty slots are filled.
pub fn plan(current: &[Assignment], peers: &[PeerInfo]) -> Vec<Assignment> {
    let mut table = current.to_vec();
    if peers.is_empty() {
        return table;
    }
    let sites: HashMap<PeerId, PeerInfo> = peers.iter().map(|p| (p.id, *p)).collect();

    drop_inactive(&mut table, &sites);
    assign_owners(&mut table, peers);
    correct_sites(&mut table, &sites);
    let mut counts = BackupCounts::default();
    assign_primaries(&mut table, peers, &mut counts);
    assign_secondaries(&mut table, peers, &mut counts);
    table
}

/// Number of buckets each peer owns. Every active peer has an entry.
pub fn owner_loads(table: &[Assignment], peers: &[PeerInfo]) -> BTreeMap<PeerId, usize> {
    let mut loads: BTreeMap<PeerId, usize> = peers.iter().map(|p| (p.id, 0)).collect();
    for a in table {
        if let Some(id) = a.owner {
            if let Some(load) = loads.get_mut(&id) {
                *load += 1;
            }
        }
    }
    loads
}

fn drop_inactive(table: &mut [Assignment], active: &HashMap<PeerId, PeerInfo>) {
    let gone = |p: &mut Option<PeerId>| {
        if p.is_some_and(|id| !active.contains_key(&id)) {
            *p = None;
        }
    };
    for a in table.iter_mut() {
        gone(&mut a.owner);
        gone(&mut a.primary);
        gone(&mut a.secondary);
    }
}

fn set_owner(a: &mut Assignment, owner: PeerId) {
    a.owner = Some(owner);
    if a.primary == Some(owner) {
        a.primary = None;
    }
    if a.secondary == Some(owner) {
        a.secondary = None;
    }
}

/// Least-loaded peer, lowest id on ties.
fn least_loaded(loads: &BTreeMap<PeerId, usize>) -> Option<PeerId> {
    loads
        .iter()
        .min_by(|(a_id, a), (b_id, b)| a.cmp(b).then(a_id.cmp(b_id)))
        .map(|(id, _)| *id)
}

/// Most-loaded peer, lowest id on ties.
fn most_loaded(loads: &BTreeMap<PeerId, usize>) -> Option<PeerId> {
    loads
        .iter()
        .max_by(|(a_id, a), (b_id, b)| a.cmp(b).then(b_id.cmp(a_id)))
        .map(|(id, _)| *id)
}

fn assign_owners(table: &mut [Assignment], peers: &[PeerInfo]) {
    let mut loads = owner_loads(table, peers);

    for a in table.iter_mut().filter(|a| a.owner.is_none()) {
        let Some(target) = least_loaded(&loads) else {
            return;
        };
        set_owner(a, target);
        *loads.entry(target).or_insert(0) += 1;
    }

    loop {
        let (Some(from), Some(to)) = (most_loaded(&loads), least_loaded(&loads)) else {
            return;
        };
        if loads[&from] <= loads[&to] + 1 {
            return;
        }
        // a bucket whose backup is already `to` moves with the least data
        // shipped around later
        let owned = |a: &Assignment| a.owner == Some(from);
        let pick = table
            .iter()
            .rposition(|a| owned(a) && a.primary == Some(to))
            .or_else(|| table.iter().rposition(|a| owned(a) && a.secondary == Some(to)))
            .or_else(|| table.iter().rposition(owned));
        let Some(index) = pick else {
            return;
        };
        set_owner(&mut table[index], to);
        *loads.entry(from).or_insert(1) -= 1;
        *loads.entry(to).or_insert(0) += 1;
    }
}

fn correct_sites(table: &mut [Assignment], peers: &HashMap<PeerId, PeerInfo>) {
    for a in table.iter_mut() {
        let Some(owner) = a.owner.and_then(|o| peers.get(&o)) else {
            a.primary = None;
            a.secondary = None;
            continue;
        };
        let same_site = |p: Option<PeerId>| {
            p.and_then(|id| peers.get(&id))
                .is_some_and(|info| info.same_site(owner))
        };

        if a.primary.is_some() && !same_site(a.primary) {
            if a.secondary.is_some() && same_site(a.secondary) {
                std::mem::swap(&mut a.primary, &mut a.secondary);
            } else {
                a.primary = None;
            }
        }
        if a.secondary.is_some() && same_site(a.secondary) {
            if a.primary.is_none() {
                a.primary = a.secondary.take();
            } else {
                a.secondary = None;
            }
        }
        if a.primary == a.owner {
            a.primary = None;
        }
        if a.secondary == a.owner || a.secondary == a.primary {
            a.secondary = None;
        }
    }
}

/// Running tally of backup slots held per peer. Only ever incremented; it
/// steers ties, nothing depends on it being exact.
#[derive(Default)]
struct BackupCounts {
    primary: HashMap<PeerId, usize>,
    secondary: HashMap<PeerId, usize>,
}

fn assign_primaries(table: &mut [Assignment], peers: &[PeerInfo], counts: &mut BackupCounts) {
    let loads = owner_loads(table, peers);
    for a in table.iter() {
        if let Some(p) = a.primary {
            *counts.primary.entry(p).or_insert(0) += 1;
        }
    }

    for failing in peers {
        let candidates: Vec<PeerId> = peers
            .iter()
            .filter(|q| q.id != failing.id && q.same_site(failing))
            .map(|q| q.id)
            .collect();
        if candidates.is_empty() {
            continue;
        }
        // load each candidate would carry if `failing` went down now
        let mut simulated: BTreeMap<PeerId, usize> = candidates
            .iter()
            .map(|q| (*q, loads.get(q).copied().unwrap_or(0)))
            .collect();
        for a in table.iter().filter(|a| a.owner == Some(failing.id)) {
            if let Some(id) = a.primary {
                if let Some(load) = simulated.get_mut(&id) {
                    *load += 1;
                }
            }
        }

        for a in table
            .iter_mut()
            .filter(|a| a.owner == Some(failing.id) && a.primary.is_none())
        {
            let Some(pick) = pick_backup(&simulated, &counts.primary, |q| a.secondary != Some(q))
            else {
                break;
            };
            a.primary = Some(pick);
            *simulated.entry(pick).or_insert(0) += 1;
            *counts.primary.entry(pick).or_insert(0) += 1;
        }
    }
}

fn assign_secondaries(table: &mut [Assignment], peers: &[PeerInfo], counts: &mut BackupCounts) {
    let loads = owner_loads(table, peers);
    for a in table.iter() {
        if let Some(s) = a.secondary {
            *counts.secondary.entry(s).or_insert(0) += 1;
        }
    }

    for failing in peers {
        let candidates: Vec<PeerId> = peers
            .iter()
            .filter(|q| !q.same_site(failing))
            .map(|q| q.id)
            .collect();
        if candidates.is_empty() {
            continue;
        }
        // the owner and its primary are both gone, so the secondary inherits
        let mut simulated: BTreeMap<PeerId, usize> = candidates
            .iter()
            .map(|q| (*q, loads.get(q).copied().unwrap_or(0)))
            .collect();
        for a in table.iter().filter(|a| a.owner == Some(failing.id)) {
            if let Some(id) = a.secondary {
                if let Some(load) = simulated.get_mut(&id) {
                    *load += 1;
                }
            }
        }

        for a in table
            .iter_mut()
            .filter(|a| a.owner == Some(failing.id) && a.secondary.is_none())
        {
            let Some(pick) = pick_backup(&simulated, &counts.secondary, |q| a.primary != Some(q))
            else {
                break;
            };
            a.secondary = Some(pick);
            *simulated.entry(pick).or_insert(0) += 1;
            *counts.secondary.entry(pick).or_insert(0) += 1;
        }
    }
}

/// Lowest simulated load, then fewest backups, then lowest id.
fn pick_backup(
    simulated: &BTreeMap<PeerId, usize>,
    counts: &HashMap<PeerId, usize>,
    allowed: impl Fn(PeerId) -> bool,
) -> Option<PeerId> {
    simulated
        .iter()
        .filter(|(q, _)| allowed(**q))
        .min_by_key(|(q, load)| (**load, counts.get(*q).copied().unwrap_or(0), **q))
        .map(|(q, _)| *q)
}
