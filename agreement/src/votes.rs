// Copyright © Palisade Contributors
// SPDX-License-Identifier: Apache-2.0

//! Weighted vote aggregation for one round.
//!
//! The tracker is owned and mutated only by the player. It tallies verified
//! votes per (period, step, value), rejects duplicates and equivocations,
//! and reports each quorum exactly once, whether the quorum was reached
//! vote by vote or arrived whole as a foreign bundle.

use crate::events::Quorum;
use palisade_agreement_types::{
    Address, Bundle, Committee, Period, ProposalValue, Round, Step, Vote,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Result of feeding one vote to the tracker.
#[derive(Debug)]
pub enum VoteOutcome {
    /// First vote from this voter at this position; may complete a quorum.
    Fresh(Option<Quorum>),
    /// Same voter, same position, same value.
    Duplicate,
    /// Same voter, same position, different value. The offender's weight
    /// stays with its first vote and later votes are ignored.
    Equivocation { previous: ProposalValue },
    /// Vote is not for the tracked round.
    WrongRound,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
enum VoterState {
    Voted(ProposalValue),
    Equivocated,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Tally {
    weight: u64,
    votes: Vec<Vote>,
    reported: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteTracker {
    round: Round,
    tallies: BTreeMap<(Period, Step, ProposalValue), Tally>,
    voters: BTreeMap<(Period, Step, Address), VoterState>,
}

impl VoteTracker {
    pub fn new(round: Round) -> VoteTracker {
        VoteTracker { round, tallies: BTreeMap::new(), voters: BTreeMap::new() }
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn observe(&mut self, vote: Vote) -> VoteOutcome {
        if vote.round() != self.round {
            return VoteOutcome::WrongRound;
        }
        debug_assert!(vote.step() != Step::PROPOSE, "propose votes are not tallied");

        let voter_key = (vote.period(), vote.step(), vote.sender());
        match self.voters.get(&voter_key) {
            Some(VoterState::Voted(previous)) if *previous == vote.proposal() => {
                return VoteOutcome::Duplicate;
            },
            Some(VoterState::Voted(previous)) => {
                let previous = *previous;
                warn!(
                    round = self.round,
                    period = vote.period(),
                    step = %vote.step(),
                    voter = %vote.sender(),
                    "voter equivocated"
                );
                self.voters.insert(voter_key, VoterState::Equivocated);
                return VoteOutcome::Equivocation { previous };
            },
            Some(VoterState::Equivocated) => return VoteOutcome::Duplicate,
            None => {},
        }
        self.voters.insert(voter_key, VoterState::Voted(vote.proposal()));

        let key = (vote.period(), vote.step(), vote.proposal());
        let tally = self.tallies.entry(key).or_default();
        tally.weight = tally.weight.saturating_add(vote.weight());
        tally.votes.push(vote);

        let quorum = Committee::for_vote(vote.step(), vote.proposal().is_bottom()).quorum;
        if tally.weight >= quorum && !tally.reported {
            tally.reported = true;
            let bundle = Bundle::from_votes(
                self.round,
                vote.period(),
                vote.step(),
                vote.proposal(),
                tally.votes.clone(),
            );
            return VoteOutcome::Fresh(Some(Quorum {
                period: vote.period(),
                step: vote.step(),
                value: vote.proposal(),
                bundle,
            }));
        }
        VoteOutcome::Fresh(None)
    }

    /// Records that a quorum arrived pre-assembled from a peer. Returns
    /// false if this position already reported a quorum, so the caller does
    /// not act twice.
    pub fn register_external_bundle(&mut self, bundle: &Bundle) -> bool {
        if bundle.round != self.round {
            return false;
        }
        let key = (bundle.period, bundle.step, bundle.proposal);
        let tally = self.tallies.entry(key).or_default();
        if tally.reported {
            return false;
        }
        tally.reported = true;
        true
    }

    /// Drops everything and re-keys the tracker for a new round.
    pub fn advance_round(&mut self, round: Round) {
        self.round = round;
        self.tallies.clear();
        self.voters.clear();
    }

    /// Garbage-collects superseded periods. Cert tallies stay for the whole
    /// round, since a certificate from any period commits the block; the
    /// immediately preceding period stays within the recovery horizon.
    pub fn prune_periods(&mut self, current: Period) {
        let keep = current.saturating_sub(1);
        self.tallies
            .retain(|(period, step, _), _| *step == Step::CERT || *period >= keep);
        self.voters
            .retain(|(period, step, _), _| *step == Step::CERT || *period >= keep);
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn tally_weight(&self, period: Period, step: Step, value: ProposalValue) -> u64 {
        self.tallies.get(&(period, step, value)).map(|t| t.weight).unwrap_or(0)
    }
}
