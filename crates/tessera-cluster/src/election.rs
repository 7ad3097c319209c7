//! Leader election by ballot gossip.
//!
//! Any membership change restarts the election. A peer first waits out a
//! startup window so membership can settle, then casts a ballot and keeps
//! re-sending its whole ballot table over the notify list every cycle.
//! Once the table has gone unchanged for the stability window the peer
//! decides on the candidate with the most votes (ties go to the lowest id).
//!
//! Ballots carry a strictly increasing timestamp chosen by the voter. The
//! newest timestamp seen from each voter is remembered across elections, so
//! tables re-sent by slower peers after a decision do not restart voting.
//! Only a genuinely new ballot does.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info};

use crate::message::Ballot;
use crate::PeerId;

/// Election timing, counted in event loop cycles.
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Cycles to wait after a membership change before voting.
    pub startup_cycles: u32,
    /// Cycles without any vote change before deciding.
    pub stable_cycles: u32,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            startup_cycles: 5,
            stable_cycles: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No election running.
    Idle,
    /// Waiting for membership to settle.
    Startup { remaining: u32 },
    /// Ballots are being exchanged; `stable` counts quiet cycles.
    Voting { stable: u32 },
}

/// A finished election.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub leader: PeerId,
    pub previous: Option<PeerId>,
}

impl Decision {
    /// True if the decision moved leadership to a different peer.
    pub fn is_new_leader(&self) -> bool {
        self.previous != Some(self.leader)
    }
}

/// Output of one election cycle.
#[derive(Debug, Default)]
pub struct ElectionTick {
    /// Ballot table to send to the notify list. Empty when not voting.
    pub ballots: Vec<Ballot>,
    pub decision: Option<Decision>,
}

pub struct Election {
    local: PeerId,
    config: ElectionConfig,
    phase: Phase,
    leader: Option<PeerId>,
    /// Current ballot per voter.
    votes: BTreeMap<PeerId, Ballot>,
    /// Newest ballot timestamp seen per voter.
    last_seen: HashMap<PeerId, u64>,
    /// A vote changed since the last tick.
    changed: bool,
    /// Last timestamp we issued.
    clock: u64,
}

impl Election {
    /// Creates an election state that starts in the startup window.
    pub fn new(local: PeerId, config: ElectionConfig) -> Self {
        let phase = Phase::Startup {
            remaining: config.startup_cycles,
        };
        Self {
            local,
            config,
            phase,
            leader: None,
            votes: BTreeMap::new(),
            last_seen: HashMap::new(),
            changed: false,
            clock: 0,
        }
    }

    pub fn leader(&self) -> Option<PeerId> {
        self.leader
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_running(&self) -> bool {
        self.phase != Phase::Idle
    }

    /// Restarts the election after a join or failure.
    ///
    /// `active` is the sorted id list including ourselves.
    pub fn membership_changed(&mut self, active: &[PeerId]) {
        if let Some(leader) = self.leader {
            if active.binary_search(&leader).is_err() {
                info!("leader {} is gone", leader);
                self.leader = None;
            }
        }
        self.phase = Phase::Startup {
            remaining: self.config.startup_cycles,
        };
        self.votes.clear();
        self.last_seen.clear();
        self.changed = false;
    }

    /// Folds a received ballot table into ours.
    pub fn receive(&mut self, ballots: &[Ballot], active: &[PeerId]) {
        for ballot in ballots {
            if ballot.voter == self.local {
                continue;
            }
            if active.binary_search(&ballot.voter).is_err()
                || active.binary_search(&ballot.candidate).is_err()
            {
                continue;
            }
            let seen = self.last_seen.entry(ballot.voter).or_insert(0);
            if ballot.timestamp <= *seen {
                continue;
            }
            *seen = ballot.timestamp;

            if self.phase == Phase::Idle {
                debug!("ballot from {} starts a new election", ballot.voter);
                self.phase = Phase::Voting { stable: 0 };
            }
            let previous = self.votes.insert(ballot.voter, *ballot);
            if previous.map(|b| b.candidate) != Some(ballot.candidate) {
                self.changed = true;
            }
        }
    }

    /// Advances the election by one cycle.
    ///
    /// `now_ms` is wall-clock time in milliseconds, used for ballot
    /// timestamps.
    pub fn tick(&mut self, active: &[PeerId], now_ms: u64) -> ElectionTick {
        let stable = match self.phase {
            Phase::Idle => return ElectionTick::default(),
            Phase::Startup { remaining } if remaining > 1 => {
                self.phase = Phase::Startup {
                    remaining: remaining - 1,
                };
                return ElectionTick::default();
            }
            Phase::Startup { .. } => 0,
            Phase::Voting { stable } => stable,
        };

        // drop ballots from or for peers that have since left
        self.votes.retain(|voter, b| {
            active.binary_search(voter).is_ok() && active.binary_search(&b.candidate).is_ok()
        });

        if let Some(candidate) = self.preferred(active) {
            let current = self.votes.get(&self.local).map(|b| b.candidate);
            if current != Some(candidate) {
                let timestamp = self.next_timestamp(now_ms);
                debug!("voting for {}", candidate);
                self.votes.insert(
                    self.local,
                    Ballot {
                        voter: self.local,
                        candidate,
                        timestamp,
                    },
                );
                self.changed = true;
            }
        }

        let stable = if self.changed { 0 } else { stable + 1 };
        self.changed = false;
        let ballots: Vec<Ballot> = self.votes.values().copied().collect();

        if stable < self.config.stable_cycles {
            self.phase = Phase::Voting { stable };
            return ElectionTick {
                ballots,
                decision: None,
            };
        }

        let decision = self.most_popular(active).map(|leader| {
            let previous = self.leader.replace(leader);
            info!("election decided: leader is {}", leader);
            Decision { leader, previous }
        });
        self.phase = Phase::Idle;
        self.votes.clear();
        ElectionTick { ballots, decision }
    }

    /// The candidate we should be voting for right now.
    fn preferred(&self, active: &[PeerId]) -> Option<PeerId> {
        if self.votes.len() * 2 >= active.len() {
            if let Some(popular) = self.most_popular(active) {
                return Some(popular);
            }
        }
        self.leader
            .filter(|l| active.binary_search(l).is_ok())
            .or_else(|| active.first().copied())
    }

    /// Candidate with the most votes, lowest id on ties.
    fn most_popular(&self, active: &[PeerId]) -> Option<PeerId> {
        let mut tally: BTreeMap<PeerId, usize> = BTreeMap::new();
        for b in self.votes.values() {
            if active.binary_search(&b.candidate).is_ok() {
                *tally.entry(b.candidate).or_insert(0) += 1;
            }
        }
        // BTreeMap iterates in id order, so the first maximum wins ties
        let mut best: Option<(PeerId, usize)> = None;
        for (candidate, count) in tally {
            if best.map_or(true, |(_, n)| count > n) {
                best = Some((candidate, count));
            }
        }
        best.map(|(c, _)| c)
    }

    fn next_timestamp(&mut self, now_ms: u64) -> u64 {
        self.clock = now_ms.max(self.clock + 1);
        self.clock
    }
}
