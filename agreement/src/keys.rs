// Copyright © Palisade Contributors
// SPDX-License-Identifier: Apache-2.0

use ed25519_dalek::Keypair;
use palisade_agreement_types::{Address, Round};
use std::sync::Arc;

/// A participation key: the signing identity this node votes with over a
/// bounded range of rounds.
#[derive(Clone)]
pub struct Participation {
    pub address: Address,
    pub first_valid: Round,
    pub last_valid: Round,
    keypair: Arc<Keypair>,
}

impl Participation {
    pub fn new(keypair: Keypair, first_valid: Round, last_valid: Round) -> Participation {
        Participation {
            address: Address::from_public_key(&keypair.public),
            first_valid,
            last_valid,
            keypair: Arc::new(keypair),
        }
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// Whether this key may vote anywhere in [from, to] (inclusive).
    pub fn overlaps_interval(&self, from: Round, to: Round) -> bool {
        self.first_valid <= to && from <= self.last_valid
    }
}

impl std::fmt::Debug for Participation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Participation")
            .field("address", &self.address)
            .field("first_valid", &self.first_valid)
            .field("last_valid", &self.last_valid)
            .finish()
    }
}

/// Key storage seam. Rotation and on-disk formats live with the node.
pub trait KeyManager: Send + Sync {
    fn keys(&self) -> Vec<Participation>;

    /// Whether any participation key is valid somewhere in [from, to].
    fn has_live_keys(&self, from: Round, to: Round) -> bool;

    /// Drops keys that can no longer vote at or after `round`.
    fn delete_old_keys(&self, round: Round);
}
