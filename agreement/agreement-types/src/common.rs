// Copyright © Palisade Contributors
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;

/// Index of the ledger entry being agreed upon.
pub type Round = u64;

/// Attempt number within a round. Period 0 is the fast path; higher periods
/// are recovery attempts.
pub type Period = u64;

/// Phase within a period.
///
/// Steps are ordered: propose, soft, cert, then the unbounded next series,
/// with the fast-recovery steps (late, redo, down) pinned to the top of the
/// encoding space so the next series can never collide with them.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Step(pub u64);

impl Step {
    pub const PROPOSE: Step = Step(0);
    pub const SOFT: Step = Step(1);
    pub const CERT: Step = Step(2);
    /// First step of the next series; `Step::next(k)` is the k-th.
    pub const NEXT: Step = Step(3);
    pub const LATE: Step = Step(253);
    pub const REDO: Step = Step(254);
    pub const DOWN: Step = Step(255);

    pub fn next(k: u64) -> Step {
        Step(Step::NEXT.0 + k)
    }

    pub fn is_next(self) -> bool {
        self.0 >= Step::NEXT.0 && self.0 < Step::LATE.0
    }

    /// Position within the next series, if this is a next step.
    pub fn next_index(self) -> Option<u64> {
        self.is_next().then(|| self.0 - Step::NEXT.0)
    }

    pub fn is_recovery(self) -> bool {
        self.0 >= Step::LATE.0
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Step::PROPOSE => write!(f, "propose"),
            Step::SOFT => write!(f, "soft"),
            Step::CERT => write!(f, "cert"),
            Step::LATE => write!(f, "late"),
            Step::REDO => write!(f, "redo"),
            Step::DOWN => write!(f, "down"),
            Step(s) => write!(f, "next_{}", s - Step::NEXT.0),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A 256-bit content digest.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    /// Domain-separated hash of arbitrary bytes.
    pub fn hash_of(domain: &'static str, data: &[u8]) -> Digest {
        let mut h = Sha256::new();
        h.update(domain.as_bytes());
        h.update(data);
        Digest(h.finalize().into())
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// A participant identity: the ed25519 public key it votes with.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Address(pub [u8; 32]);

impl Address {
    pub fn from_public_key(pk: &ed25519_dalek::PublicKey) -> Address {
        Address(pk.to_bytes())
    }

    pub fn public_key(&self) -> Result<ed25519_dalek::PublicKey, ed25519_dalek::SignatureError> {
        ed25519_dalek::PublicKey::from_bytes(&self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
