//! Pure quorum-aggregation state machine - no I/O, no async.
//!
//! [`PaxosLearner`] tracks two independent per-instance vote tracks: the
//! phase-1 promise track, which promotes a quorum of promises into a
//! phase-2a accept, and the phase-2 acceptance track, which turns a quorum
//! of accepted-value reports into a decision. Everything here is synchronous
//! so the transition logic can be tested exhaustively without a runtime.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::btree_map::Entry;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::messages::{MessageKind, PaxosMessage, SELF_NODE_ID, SELF_REQUEST_ID};

/// Quorum threshold for a given acceptor-set size: `ceil((n + 1) / 2)`.
#[must_use]
pub fn majority(num_acceptors: usize) -> usize {
    (num_acceptors + 1).div_ceil(2)
}

/// Phase-1 negotiation state for one instance.
#[derive(Debug)]
struct PromiseState {
    /// Round under negotiation.
    crnd: u8,
    /// Acceptors that promised in this round.
    nids: BTreeSet<u64>,
    /// Highest accepted round reported among the promises.
    hvrnd: u8,
    /// Value carried by the highest-round promise; ties go to the most
    /// recently seen.
    hval: Bytes,
    finished: bool,
}

impl PromiseState {
    fn new(crnd: u8) -> Self {
        Self {
            crnd,
            nids: BTreeSet::new(),
            hvrnd: 0,
            hval: Bytes::new(),
            finished: false,
        }
    }
}

/// Phase-2 vote state for one instance.
#[derive(Debug)]
struct AcceptState {
    crnd: u8,
    nids: BTreeSet<u64>,
    /// First value reported for the round. Later reports in the same round
    /// carry the same value by protocol construction, so no comparison is
    /// needed here.
    value: Option<Bytes>,
    finished: bool,
}

impl AcceptState {
    fn new(crnd: u8) -> Self {
        Self {
            crnd,
            nids: BTreeSet::new(),
            value: None,
            finished: false,
        }
    }
}

/// Aggregates promises and accepted-value reports into decisions.
///
/// Decisions are written once to the instance log and never change; replays
/// of an already-decided instance return the logged pair again.
pub struct PaxosLearner {
    majority: usize,
    promises: BTreeMap<u16, PromiseState>,
    accepts: BTreeMap<u16, AcceptState>,
    decisions: BTreeMap<u16, Bytes>,
}

impl PaxosLearner {
    #[must_use]
    pub fn new(num_acceptors: usize) -> Self {
        let majority = majority(num_acceptors);
        debug!(num_acceptors, majority, "creating learner state");
        Self {
            majority,
            promises: BTreeMap::new(),
            accepts: BTreeMap::new(),
            decisions: BTreeMap::new(),
        }
    }

    /// Quorum threshold this learner requires.
    #[must_use]
    pub fn majority(&self) -> usize {
        self.majority
    }

    /// Decided value for an instance, if any.
    #[must_use]
    pub fn decision(&self, inst: u16) -> Option<&Bytes> {
        self.decisions.get(&inst)
    }

    /// Consume a phase-1b promise.
    ///
    /// Returns the phase-2a accept to broadcast once a quorum of promises
    /// for the instance's round has been collected, `None` otherwise.
    /// Duplicate node ids and promises for a round other than the tracked
    /// one are ignored; a strictly higher round reopens negotiation only
    /// after the previous one finished.
    pub fn handle_promise(&mut self, msg: &PaxosMessage) -> Option<PaxosMessage> {
        let state = match self.promises.entry(msg.inst) {
            Entry::Vacant(slot) => slot.insert(PromiseState::new(msg.crnd)),
            Entry::Occupied(slot) => {
                let state = slot.into_mut();
                if state.finished {
                    if msg.crnd <= state.crnd {
                        trace!(inst = msg.inst, crnd = msg.crnd, "promise for settled round");
                        return None;
                    }
                    *state = PromiseState::new(msg.crnd);
                }
                state
            }
        };

        if state.crnd != msg.crnd {
            trace!(
                inst = msg.inst,
                crnd = msg.crnd,
                tracked = state.crnd,
                "promise for a different round"
            );
            return None;
        }
        if !state.nids.insert(msg.nid) {
            trace!(inst = msg.inst, nid = msg.nid, "duplicate promise");
            return None;
        }
        if msg.vrnd >= state.hvrnd {
            state.hvrnd = msg.vrnd;
            state.hval = msg.value.clone();
        }

        if state.nids.len() < self.majority {
            return None;
        }
        state.finished = true;
        debug!(
            inst = msg.inst,
            crnd = state.crnd,
            "promise quorum reached, promoting to accept"
        );
        Some(PaxosMessage {
            kind: MessageKind::Accept,
            inst: msg.inst,
            crnd: state.crnd,
            vrnd: state.hvrnd,
            nid: SELF_NODE_ID,
            req_id: SELF_REQUEST_ID,
            value: state.hval.clone(),
        })
    }

    /// Consume a phase-2b accepted-value report.
    ///
    /// Returns the decided `(instance, value)` pair once a quorum of
    /// acceptors has reported the instance's round; replays after the
    /// decision return the logged pair again. A strictly higher round
    /// discards an unfinished lower-round attempt, an equal round
    /// accumulates votes, a lower round is ignored.
    pub fn handle_accepted(&mut self, msg: &PaxosMessage) -> Option<(u16, Bytes)> {
        let state = match self.accepts.entry(msg.inst) {
            Entry::Vacant(slot) => slot.insert(AcceptState::new(msg.crnd)),
            Entry::Occupied(slot) => slot.into_mut(),
        };

        if state.finished {
            let value = self.decisions.get(&msg.inst)?.clone();
            trace!(inst = msg.inst, "replaying decided instance");
            return Some((msg.inst, value));
        }

        if msg.crnd > state.crnd {
            trace!(
                inst = msg.inst,
                old = state.crnd,
                new = msg.crnd,
                "higher round supersedes vote state"
            );
            *state = AcceptState::new(msg.crnd);
        } else if msg.crnd < state.crnd {
            trace!(inst = msg.inst, crnd = msg.crnd, "vote for a stale round");
            return None;
        }

        if state.nids.insert(msg.nid) && state.value.is_none() {
            state.value = Some(msg.value.clone());
        }

        if state.nids.len() < self.majority {
            return None;
        }
        state.finished = true;
        let value = state.value.clone().unwrap_or_default();
        self.decisions.insert(msg.inst, value.clone());
        debug!(inst = msg.inst, crnd = state.crnd, "instance decided");
        Some((msg.inst, value))
    }
}
