// Copyright © Palisade Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{
    committee::{Credential, CredentialError, Membership},
    common::{Address, Period, Round, Step},
    proposal::ProposalValue,
};
use ed25519_dalek::{Keypair, Signature, Signer, Verifier};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const VOTE_DOMAIN: &str = "PAL::VOTE";

#[derive(Debug, Error)]
pub enum VoteError {
    #[error("vote credential rejected: {0}")]
    Credential(#[from] CredentialError),
    #[error("vote signature rejected")]
    Signature,
    #[error("sender is not a valid public key")]
    BadSender,
    #[error("{step} vote must carry a value")]
    MissingValue { step: Step },
    #[error("{step} vote must carry bottom")]
    UnexpectedValue { step: Step },
    #[error("could not encode vote: {0}")]
    Encoding(String),
}

/// The signed portion of a vote.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawVote {
    pub sender: Address,
    pub round: Round,
    pub period: Period,
    pub step: Step,
    pub proposal: ProposalValue,
}

/// A vote as received from the network: not yet checked against the
/// ledger's view of the sender.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnauthenticatedVote {
    pub raw: RawVote,
    pub credential: Credential,
    pub signature: Signature,
}

impl UnauthenticatedVote {
    pub fn new_signed(
        raw: RawVote,
        membership: &Membership,
        keypair: &Keypair,
    ) -> Result<UnauthenticatedVote, VoteError> {
        check_value_shape(&raw)?;
        let credential = Credential::new(
            raw.round,
            raw.period,
            raw.step,
            raw.proposal.is_bottom(),
            membership,
        )?;
        let signature = keypair.sign(&signing_bytes(&raw)?);
        Ok(UnauthenticatedVote { raw, credential, signature })
    }

    /// Full verification: value shape, credential, and signature. The
    /// membership must be the ledger's record for `raw.sender` at
    /// `raw.round`.
    pub fn verify(self, membership: &Membership) -> Result<Vote, VoteError> {
        check_value_shape(&self.raw)?;
        if membership.address != self.raw.sender {
            return Err(VoteError::BadSender);
        }
        self.credential.verify(
            self.raw.round,
            self.raw.period,
            self.raw.step,
            self.raw.proposal.is_bottom(),
            membership,
        )?;
        let pk = self.raw.sender.public_key().map_err(|_| VoteError::BadSender)?;
        pk.verify(&signing_bytes(&self.raw)?, &self.signature)
            .map_err(|_| VoteError::Signature)?;
        Ok(Vote(self))
    }
}

/// A vote whose credential and signature have been verified.
///
/// Deserializing one re-admits it without verification; the only decoder is
/// the crash-state restore path, which replays this node's own view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote(UnauthenticatedVote);

impl Vote {
    pub fn unauthenticated(&self) -> &UnauthenticatedVote {
        &self.0
    }

    pub fn sender(&self) -> Address {
        self.0.raw.sender
    }

    pub fn round(&self) -> Round {
        self.0.raw.round
    }

    pub fn period(&self) -> Period {
        self.0.raw.period
    }

    pub fn step(&self) -> Step {
        self.0.raw.step
    }

    pub fn proposal(&self) -> ProposalValue {
        self.0.raw.proposal
    }

    pub fn weight(&self) -> u64 {
        self.0.credential.weight
    }

    pub fn selector(&self) -> crate::common::Digest {
        self.0.credential.selector
    }
}

/// Propose, soft, and cert votes commit to a concrete value; down votes
/// commit to bottom. The next and remaining recovery steps may carry
/// either.
fn check_value_shape(raw: &RawVote) -> Result<(), VoteError> {
    let bottom = raw.proposal.is_bottom();
    match raw.step {
        Step::PROPOSE | Step::SOFT | Step::CERT if bottom => {
            Err(VoteError::MissingValue { step: raw.step })
        },
        Step::DOWN if !bottom => Err(VoteError::UnexpectedValue { step: raw.step }),
        _ => Ok(()),
    }
}

fn signing_bytes(raw: &RawVote) -> Result<Vec<u8>, VoteError> {
    let mut buf = VOTE_DOMAIN.as_bytes().to_vec();
    let enc = bcs::to_bytes(raw).map_err(|e| VoteError::Encoding(e.to_string()))?;
    buf.extend_from_slice(&enc);
    Ok(buf)
}
