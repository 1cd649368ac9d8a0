// Copyright © Palisade Contributors
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use palisade_agreement_types::{
    Bundle, PeerHandle, Period, Proposal, ProposalValue, Round, Step, Tag,
};
use serde::{Deserialize, Serialize};

/// What the player asks the outside world to do. Actions are value types:
/// the service externalizes them, and persistent ones ride along in the
/// crash checkpoint until their externalization is safe.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Action {
    /// Reset the clock zero; entering a round or period.
    Rezero { round: Round },

    /// Ask the block factory for a proposal and have the pseudonode
    /// introduce it.
    Assemble { round: Round, period: Period },

    /// Have the pseudonode re-introduce an existing value.
    Repropose { round: Round, period: Period, value: ProposalValue },

    /// Have the pseudonode sign and inject votes at the given position.
    Attest { round: Round, period: Period, step: Step, proposal: ProposalValue },

    Broadcast { tag: Tag, data: Bytes },

    /// Forward a message onward, excluding its original sender.
    Relay { source: Option<PeerHandle>, tag: Tag, data: Bytes },

    Disconnect { peer: PeerHandle },

    /// Hand a certified block to the ledger.
    Deliver { proposal: Proposal, certificate: Bundle },
}

/// Explicit discriminant stored beside each serialized action so restore
/// can check the decoder against what was written.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ActionType {
    Rezero = 0,
    Assemble = 1,
    Repropose = 2,
    Attest = 3,
    Broadcast = 4,
    Relay = 5,
    Disconnect = 6,
    Deliver = 7,
}

impl Action {
    pub fn action_type(&self) -> ActionType {
        match self {
            Action::Rezero { .. } => ActionType::Rezero,
            Action::Assemble { .. } => ActionType::Assemble,
            Action::Repropose { .. } => ActionType::Repropose,
            Action::Attest { .. } => ActionType::Attest,
            Action::Broadcast { .. } => ActionType::Broadcast,
            Action::Relay { .. } => ActionType::Relay,
            Action::Disconnect { .. } => ActionType::Disconnect,
            Action::Deliver { .. } => ActionType::Deliver,
        }
    }

    /// Whether externalizing this action must wait for a committed
    /// checkpoint. Replaying a lost attestation could contradict an earlier
    /// one; replaying a lost delivery could fork the ledger.
    pub fn persistent(&self) -> bool {
        matches!(
            self,
            Action::Assemble { .. }
                | Action::Repropose { .. }
                | Action::Attest { .. }
                | Action::Deliver { .. }
        )
    }
}

pub fn any_persistent(actions: &[Action]) -> bool {
    actions.iter().any(Action::persistent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attestations_and_delivery_gate_on_the_checkpoint() {
        let attest = Action::Attest {
            round: 1,
            period: 0,
            step: Step::SOFT,
            proposal: ProposalValue::bottom(),
        };
        let relay = Action::Relay { source: None, tag: Tag::Vote, data: Bytes::new() };
        let rezero = Action::Rezero { round: 1 };

        assert!(attest.persistent());
        assert!(!relay.persistent());
        assert!(!rezero.persistent());
        assert!(any_persistent(&[rezero, relay, attest.clone()]));
        assert!(!any_persistent(&[Action::Disconnect { peer: 3 }]));
        assert_eq!(attest.action_type(), ActionType::Attest);
    }
}
