// Copyright © Palisade Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{
    committee::{Committee, Membership},
    common::{Address, Period, Round, Step},
    proposal::ProposalValue,
    vote::{UnauthenticatedVote, Vote, VoteError},
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("bundle for {step} is not a quorum step")]
    BadStep { step: Step },
    #[error("bundle vote at index {index} is for a different position")]
    PositionMismatch { index: usize },
    #[error("bundle vote at index {index} rejected: {source}")]
    BadVote { index: usize, source: VoteError },
    #[error("bundle contains duplicate voter {voter}")]
    DuplicateVoter { voter: Address },
    #[error("unknown voter {voter}")]
    UnknownVoter { voter: Address },
    #[error("bundle weight {got} is below the {step} quorum {want}")]
    BelowQuorum { step: Step, got: u64, want: u64 },
}

/// A set of votes for a common (round, period, step, value), claimed to
/// reach that step's quorum. A cert-step bundle is a block certificate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnauthenticatedBundle {
    pub round: Round,
    pub period: Period,
    pub step: Step,
    pub proposal: ProposalValue,
    pub votes: Vec<UnauthenticatedVote>,
}

impl UnauthenticatedBundle {
    /// Verifies every constituent vote and the quorum weight. `lookup`
    /// supplies the ledger's stake record for each voter at `round`.
    pub fn verify<F>(self, lookup: F) -> Result<Bundle, BundleError>
    where
        F: Fn(Address) -> Option<Membership>,
    {
        if self.step == Step::PROPOSE {
            return Err(BundleError::BadStep { step: self.step });
        }
        let quorum = Committee::for_vote(self.step, self.proposal.is_bottom()).quorum;

        let mut votes = Vec::with_capacity(self.votes.len());
        let mut seen = HashSet::new();
        let mut weight = 0u64;
        for (index, uv) in self.votes.into_iter().enumerate() {
            let position_ok = uv.raw.round == self.round
                && uv.raw.period == self.period
                && uv.raw.step == self.step
                && uv.raw.proposal == self.proposal;
            if !position_ok {
                return Err(BundleError::PositionMismatch { index });
            }
            if !seen.insert(uv.raw.sender) {
                return Err(BundleError::DuplicateVoter { voter: uv.raw.sender });
            }
            let membership = lookup(uv.raw.sender)
                .ok_or(BundleError::UnknownVoter { voter: uv.raw.sender })?;
            let vote = uv
                .verify(&membership)
                .map_err(|source| BundleError::BadVote { index, source })?;
            weight = weight.saturating_add(vote.weight());
            votes.push(vote);
        }

        if weight < quorum {
            return Err(BundleError::BelowQuorum { step: self.step, got: weight, want: quorum });
        }
        Ok(Bundle {
            round: self.round,
            period: self.period,
            step: self.step,
            proposal: self.proposal,
            votes,
        })
    }
}

/// A verified quorum of votes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    pub round: Round,
    pub period: Period,
    pub step: Step,
    pub proposal: ProposalValue,
    votes: Vec<Vote>,
}

impl Bundle {
    /// Assembles a bundle from locally verified votes. The caller (the vote
    /// tracker) guarantees the votes share one position and reach quorum.
    pub fn from_votes(
        round: Round,
        period: Period,
        step: Step,
        proposal: ProposalValue,
        votes: Vec<Vote>,
    ) -> Bundle {
        debug_assert!(votes
            .iter()
            .all(|v| v.round() == round
                && v.period() == period
                && v.step() == step
                && v.proposal() == proposal));
        Bundle { round, period, step, proposal, votes }
    }

    pub fn votes(&self) -> &[Vote] {
        &self.votes
    }

    pub fn weight(&self) -> u64 {
        self.votes.iter().map(Vote::weight).sum()
    }

    /// Strips the verification marker for transmission.
    pub fn unauthenticated(&self) -> UnauthenticatedBundle {
        UnauthenticatedBundle {
            round: self.round,
            period: self.period,
            step: self.step,
            proposal: self.proposal,
            votes: self.votes.iter().map(|v| *v.unauthenticated()).collect(),
        }
    }
}
