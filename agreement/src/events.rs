// Copyright © Palisade Contributors
// SPDX-License-Identifier: Apache-2.0

use palisade_agreement_types::{
    Bundle, PeerHandle, Period, Proposal, ProposalValue, Round, Step, Tag, Vote,
};
use std::time::Duration;

/// An input to the player. Every mutation of protocol state happens in
/// response to exactly one of these, on the player's thread.
#[derive(Clone, Debug)]
pub enum ExternalEvent {
    /// A clock deadline fired. `fast` distinguishes the partition recovery
    /// timer from the step timer.
    Timeout { offset: Duration, fast: bool },

    /// A vote that passed cryptographic validation.
    Vote { vote: Vote, source: Option<PeerHandle> },

    /// A proposal payload that passed validation, together with the
    /// verified propose-step vote that introduced it.
    Payload { proposal: Proposal, prior_vote: Vote, source: Option<PeerHandle> },

    /// A vote bundle that passed validation.
    Bundle { bundle: Bundle, source: Option<PeerHandle> },

    /// A message failed validation; its peer is cut off.
    VerificationFailed { tag: Tag, source: Option<PeerHandle>, reason: String },

    /// The ledger committed `round` from outside the player's own delivery
    /// path (or the player's delivery completed); the player must move on.
    RoundInterruption { round: Round },

    /// The persistence loop finished writing a checkpoint.
    Checkpointed {
        round: Round,
        period: Period,
        step: Step,
        result: Result<(), String>,
    },
}

impl ExternalEvent {
    /// Short label for traces.
    pub fn kind(&self) -> &'static str {
        match self {
            ExternalEvent::Timeout { fast: false, .. } => "timeout",
            ExternalEvent::Timeout { fast: true, .. } => "fast_timeout",
            ExternalEvent::Vote { .. } => "vote",
            ExternalEvent::Payload { .. } => "payload",
            ExternalEvent::Bundle { .. } => "bundle",
            ExternalEvent::VerificationFailed { .. } => "verification_failed",
            ExternalEvent::RoundInterruption { .. } => "round_interruption",
            ExternalEvent::Checkpointed { .. } => "checkpointed",
        }
    }
}

/// A quorum observed by the vote tracker, reported exactly once per
/// (period, step, value) position.
#[derive(Clone, Debug)]
pub struct Quorum {
    pub period: Period,
    pub step: Step,
    pub value: ProposalValue,
    pub bundle: Bundle,
}
