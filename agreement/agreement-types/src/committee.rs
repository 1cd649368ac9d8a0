// Copyright © Palisade Contributors
// SPDX-License-Identifier: Apache-2.0

//! Step committees and the credentials that prove membership in them.
//!
//! Every online account is a member of every step committee; its voting
//! weight is its share of the online stake scaled to the committee size.
//! Committees are keyed by step and, within the next series, by whether the
//! vote carries a value or bottom. The selector digest orders proposers
//! within a period (lowest wins) and binds a credential to its
//! (round, period, step, address) position.

use crate::common::{Address, Digest, Period, Round, Step};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential weight {got} does not match committee weight {want}")]
    WeightMismatch { got: u64, want: u64 },
    #[error("credential selector does not match its position")]
    SelectorMismatch,
    #[error("account holds no online stake")]
    NotSelected,
}

/// Size and quorum threshold of one step committee, in abstract weight units.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Committee {
    pub size: u64,
    pub quorum: u64,
}

impl Committee {
    /// The committee a vote weighs against. The next series splits by value
    /// class: a next vote for bottom runs a larger committee with a higher
    /// absolute threshold than a next vote carrying a value, so abandoning
    /// a period demands broader agreement than carrying its value forward.
    /// The recovery steps likewise run thresholds a partitioned minority
    /// cannot reach. `bottom` is ignored outside the next series, where the
    /// step already fixes the value class.
    pub fn for_vote(step: Step, bottom: bool) -> Committee {
        match step {
            Step::PROPOSE => Committee { size: 20, quorum: 1 },
            Step::SOFT => Committee { size: 2990, quorum: 2267 },
            Step::CERT => Committee { size: 1500, quorum: 1112 },
            Step::LATE => Committee { size: 500, quorum: 320 },
            Step::REDO => Committee { size: 2400, quorum: 1768 },
            Step::DOWN => Committee { size: 6000, quorum: 4560 },
            _ if bottom => Committee { size: 7500, quorum: 5738 },
            _ => Committee { size: 5000, quorum: 3838 },
        }
    }
}

/// Stake standing of one account at one round, as reported by the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub address: Address,
    /// The account's online stake at the credential's round.
    pub stake: u64,
    /// Total online stake at that round.
    pub total_stake: u64,
}

/// Proof of committee membership with a sortition weight.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub selector: Digest,
    pub weight: u64,
}

impl Credential {
    /// Mints the credential for a vote at (round, period, step). `bottom`
    /// selects the value class within the next series.
    pub fn new(
        round: Round,
        period: Period,
        step: Step,
        bottom: bool,
        membership: &Membership,
    ) -> Result<Credential, CredentialError> {
        let weight = committee_weight(membership, Committee::for_vote(step, bottom));
        if weight == 0 {
            return Err(CredentialError::NotSelected);
        }
        Ok(Credential {
            selector: selector(round, period, step, membership.address),
            weight,
        })
    }

    /// Recomputes the credential from the ledger's view of the voter and
    /// rejects any divergence.
    pub fn verify(
        &self,
        round: Round,
        period: Period,
        step: Step,
        bottom: bool,
        membership: &Membership,
    ) -> Result<(), CredentialError> {
        let want = committee_weight(membership, Committee::for_vote(step, bottom));
        if want == 0 {
            return Err(CredentialError::NotSelected);
        }
        if self.weight != want {
            return Err(CredentialError::WeightMismatch { got: self.weight, want });
        }
        if self.selector != selector(round, period, step, membership.address) {
            return Err(CredentialError::SelectorMismatch);
        }
        Ok(())
    }
}

fn selector(round: Round, period: Period, step: Step, address: Address) -> Digest {
    let pos = bcs::to_bytes(&(round, period, step, address))
        .unwrap_or_default();
    Digest::hash_of("PAL::CRED", &pos)
}

fn committee_weight(membership: &Membership, committee: Committee) -> u64 {
    if membership.total_stake == 0 {
        return 0;
    }
    let scaled = membership.stake as u128 * committee.size as u128
        / membership.total_stake as u128;
    scaled as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_matches, assert_ok};

    fn member(seed: u8, stake: u64, total: u64) -> Membership {
        Membership {
            address: Address([seed; 32]),
            stake,
            total_stake: total,
        }
    }

    #[test]
    fn equal_stake_splits_committee_evenly() {
        let m = member(1, 1_000_000, 5_000_000);
        let soft = Credential::new(1, 0, Step::SOFT, false, &m).unwrap();
        assert_eq!(soft.weight, 2990 / 5);

        // Four of five equal holders clear the quorum; three do not.
        let quorum = Committee::for_vote(Step::SOFT, false).quorum;
        assert!(soft.weight * 4 >= quorum);
        assert!(soft.weight * 3 < quorum);
    }

    #[test]
    fn quorum_shape_holds_for_every_committee() {
        let committees = [
            (Step::SOFT, false),
            (Step::CERT, false),
            (Step::next(0), false),
            (Step::next(0), true),
            (Step::next(5), false),
            (Step::next(5), true),
            (Step::LATE, false),
            (Step::REDO, false),
            (Step::DOWN, true),
        ];
        for (step, bottom) in committees {
            let c = Committee::for_vote(step, bottom);
            let per_node = c.size / 5;
            assert!(
                per_node * 4 >= c.quorum,
                "4/5 must reach quorum at {} (bottom: {})",
                step,
                bottom
            );
            assert!(
                per_node * 3 < c.quorum,
                "3/5 must miss quorum at {} (bottom: {})",
                step,
                bottom
            );
        }
    }

    #[test]
    fn next_thresholds_split_by_value_class() {
        for k in [0, 1, 7] {
            let with_value = Committee::for_vote(Step::next(k), false);
            let for_bottom = Committee::for_vote(Step::next(k), true);
            assert_ne!(with_value, for_bottom);
            assert!(for_bottom.quorum > with_value.quorum);
            assert!(for_bottom.size > with_value.size);
        }

        // A credential minted for one class carries that class's weight and
        // does not verify as the other.
        let m = member(1, 1_000_000, 5_000_000);
        let with_value = Credential::new(1, 0, Step::next(0), false, &m).unwrap();
        let for_bottom = Credential::new(1, 0, Step::next(0), true, &m).unwrap();
        assert!(for_bottom.weight > with_value.weight);
        assert_matches!(
            for_bottom.verify(1, 0, Step::next(0), false, &m),
            Err(CredentialError::WeightMismatch { .. })
        );
    }

    #[test]
    fn verify_rejects_tampered_weight() {
        let m = member(2, 1_000_000, 5_000_000);
        let mut cred = Credential::new(3, 0, Step::CERT, false, &m).unwrap();
        assert_ok!(cred.verify(3, 0, Step::CERT, false, &m));
        cred.weight += 1;
        assert_err!(cred.verify(3, 0, Step::CERT, false, &m));
    }

    #[test]
    fn verify_rejects_moved_selector() {
        let m = member(3, 1_000_000, 5_000_000);
        let cred = Credential::new(4, 0, Step::SOFT, false, &m).unwrap();
        // Same weight committee, different position.
        assert_err!(cred.verify(5, 0, Step::SOFT, false, &m));
    }

    #[test]
    fn zero_stake_is_not_selected() {
        let m = member(4, 0, 5_000_000);
        assert_err!(Credential::new(1, 0, Step::SOFT, false, &m));
    }
}
