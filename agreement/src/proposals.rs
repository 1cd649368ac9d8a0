// Copyright © Palisade Contributors
// SPDX-License-Identifier: Apache-2.0

//! Proposal bookkeeping for one round: which values have been introduced by
//! propose-step votes, which payloads are in hand, which value each period
//! has staged behind a soft-quorum, and which value the round has pinned.

use palisade_agreement_types::{Digest, Period, Proposal, ProposalValue, Round, Vote};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::error;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProposalStore {
    round: Round,
    /// Candidate values per period, with the credential selector of the
    /// propose vote that introduced them. The period's default proposal is
    /// the candidate with the lowest selector.
    candidates: BTreeMap<Period, BTreeMap<ProposalValue, Digest>>,
    /// Validated payloads, keyed by value.
    payloads: BTreeMap<ProposalValue, Proposal>,
    /// Value each period endorses behind a soft-quorum.
    staged: BTreeMap<Period, ProposalValue>,
    /// Value the round pinned on its most recent value next-quorum; bottom
    /// when nothing is pinned.
    pinned: ProposalValue,
}

impl ProposalStore {
    pub fn new(round: Round) -> ProposalStore {
        ProposalStore {
            round,
            candidates: BTreeMap::new(),
            payloads: BTreeMap::new(),
            staged: BTreeMap::new(),
            pinned: ProposalValue::bottom(),
        }
    }

    /// Records a propose-step vote. Returns true when the candidate is new
    /// for its period (and should be relayed).
    pub fn observe_propose_vote(&mut self, vote: &Vote) -> bool {
        if vote.round() != self.round || vote.proposal().is_bottom() {
            return false;
        }
        self.candidates
            .entry(vote.period())
            .or_default()
            .insert(vote.proposal(), vote.selector())
            .is_none()
    }

    /// Stores a validated payload. Returns true when it is new.
    pub fn observe_payload(&mut self, proposal: Proposal) -> bool {
        if proposal.block.round != self.round {
            return false;
        }
        let value = proposal.value();
        if self.payloads.contains_key(&value) {
            return false;
        }
        self.payloads.insert(value, proposal);
        true
    }

    pub fn payload(&self, value: ProposalValue) -> Option<&Proposal> {
        self.payloads.get(&value)
    }

    /// The candidate with the lowest credential selector at a period.
    pub fn frozen_best(&self, period: Period) -> Option<ProposalValue> {
        self.candidates
            .get(&period)?
            .iter()
            .min_by_key(|(_, selector)| **selector)
            .map(|(value, _)| *value)
    }

    /// Endorses `value` at `period`. A second distinct soft-quorum at one
    /// period is a protocol assertion violation: the first endorsement
    /// stands and the conflict is reported, not acted on.
    pub fn stage(&mut self, period: Period, value: ProposalValue) {
        match self.staged.get(&period) {
            Some(previous) if *previous != value => {
                error!(
                    round = self.round,
                    period,
                    staged = ?previous,
                    conflicting = ?value,
                    "two soft-quorums observed at one period; keeping the first"
                );
            },
            Some(_) => {},
            None => {
                self.staged.insert(period, value);
            },
        }
    }

    pub fn staged(&self, period: Period) -> Option<ProposalValue> {
        self.staged.get(&period).copied()
    }

    /// Whether `period` has a staged value whose payload is in hand.
    pub fn committable(&self, period: Period) -> Option<ProposalValue> {
        let value = self.staged(period)?;
        self.payloads.contains_key(&value).then_some(value)
    }

    pub fn pin(&mut self, value: ProposalValue) {
        if !value.is_bottom() {
            self.pinned = value;
        }
    }

    pub fn pinned(&self) -> Option<ProposalValue> {
        (!self.pinned.is_bottom()).then_some(self.pinned)
    }

    /// Freshness policy for payload relay: a payload is worth passing on if
    /// its value is pinned, staged by some period, or a known candidate.
    pub fn relevant(&self, value: ProposalValue) -> bool {
        self.pinned == value
            || self.staged.values().any(|v| *v == value)
            || self.candidates.values().any(|c| c.contains_key(&value))
    }

    /// Drops everything for a new round.
    pub fn advance_round(&mut self, round: Round) {
        self.round = round;
        self.candidates.clear();
        self.payloads.clear();
        self.staged.clear();
        self.pinned = ProposalValue::bottom();
    }
}
