// Copyright © Palisade Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::common::{Address, Digest, Period, Round};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A candidate ledger entry. The agreement core never interprets the
/// payload; it hashes the whole block and hands it back to the ledger on
/// delivery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub round: Round,
    pub proposer: Address,
    /// Digest of the block this one extends.
    pub prev: Digest,
    /// Entropy contributed by the proposer, folded into future credentials
    /// by the ledger.
    pub seed: u64,
    pub payload: Bytes,
}

impl Block {
    pub fn digest(&self) -> Digest {
        let enc = bcs::to_bytes(self).unwrap_or_default();
        Digest::hash_of("PAL::BLK", &enc)
    }
}

/// Compact identifier of a candidate block: the digest plus the identity of
/// the proposal it originated from. Two reproposals of the same block in
/// different periods carry different proposal values.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ProposalValue {
    pub original_period: Period,
    pub original_proposer: Address,
    pub block_digest: Digest,
}

impl ProposalValue {
    /// The distinguished "no value" choice carried by next/down votes.
    pub fn bottom() -> ProposalValue {
        ProposalValue::default()
    }

    pub fn is_bottom(&self) -> bool {
        *self == ProposalValue::default()
    }
}

impl std::fmt::Debug for ProposalValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_bottom() {
            write!(f, "⊥")
        } else {
            write!(
                f,
                "{:?}@{}/{:?}",
                self.block_digest, self.original_period, self.original_proposer
            )
        }
    }
}

/// A full block dressed with its proposal identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub block: Block,
    pub original_period: Period,
    pub original_proposer: Address,
}

impl Proposal {
    pub fn value(&self) -> ProposalValue {
        ProposalValue {
            original_period: self.original_period,
            original_proposer: self.original_proposer,
            block_digest: self.block.digest(),
        }
    }
}

/// Wire form of a proposal payload: the proposal together with the
/// proposer's propose-step vote, so a single message both introduces the
/// value and justifies it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransmittedPayload {
    pub proposal: Proposal,
    pub prior_vote: crate::vote::UnauthenticatedVote,
}
