//! Global leader election.
//!
//! Highest id wins. There is no voting round: each node compares its own
//! id with the ids currently online, and a bounded fail counter forces
//! leadership when no leader shows up for long enough. Ids come from
//! hardware identity, so two distinct nodes never tie.

use serde::Serialize;

use lumen_common::types::ControllerId;

/// Per-scope election state. Volatile, never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ElectionState {
    pub is_leader: bool,
    /// A remote leader advertised itself since the last reset.
    pub leader_detected: bool,
    pub fail_counter: u32,
}

/// Outcome of one leadership check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Already leader; nothing to decide.
    AlreadyLeader,
    /// Another node leads; stay follower.
    Follow,
    /// Take leadership. `failsafe` is set when the fail counter forced it.
    BecomeLeader { failsafe: bool },
    /// Not highest and no leader seen yet; check again later.
    Retry,
}

/// True when `own` is at least every id in `others`, ignoring itself.
/// An empty set yields true.
pub fn has_highest_id<I>(own: ControllerId, others: I) -> bool
where
    I: IntoIterator<Item = ControllerId>,
{
    others.into_iter().filter(|id| *id != own).all(|id| own >= id)
}

#[derive(Debug)]
pub struct GlobalElection {
    own_id: ControllerId,
    max_fail_count: u32,
    state: ElectionState,
}

impl GlobalElection {
    pub fn new(own_id: ControllerId, max_fail_count: u32) -> Self {
        Self {
            own_id,
            max_fail_count: max_fail_count.max(1),
            state: ElectionState::default(),
        }
    }

    pub fn state(&self) -> ElectionState {
        self.state
    }

    pub fn is_leader(&self) -> bool {
        self.state.is_leader
    }

    pub fn note_leader_seen(&mut self) {
        self.state.leader_detected = true;
    }

    /// Start a new detection cycle.
    pub fn reset_detection(&mut self) {
        self.state.leader_detected = false;
    }

    /// Decide leadership against the currently online ids.
    pub fn check_for_leadership(&mut self, online: &[ControllerId]) -> Decision {
        if self.state.is_leader {
            return Decision::AlreadyLeader;
        }
        if self.state.leader_detected {
            self.state.fail_counter = 0;
            return Decision::Follow;
        }

        self.state.fail_counter += 1;
        let highest = has_highest_id(self.own_id, online.iter().copied());
        let exhausted = self.state.fail_counter >= self.max_fail_count;

        if highest || exhausted {
            self.state.is_leader = true;
            self.state.fail_counter = 0;
            return Decision::BecomeLeader {
                failsafe: !highest,
            };
        }
        Decision::Retry
    }

    /// Step down. Returns false when not leader.
    pub fn relinquish(&mut self) -> bool {
        if !self.state.is_leader {
            return false;
        }
        self.state.is_leader = false;
        self.state.leader_detected = false;
        self.state.fail_counter = 0;
        true
    }
}
