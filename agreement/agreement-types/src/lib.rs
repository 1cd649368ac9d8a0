// Copyright © Palisade Contributors
// SPDX-License-Identifier: Apache-2.0

//! Value types shared by the agreement protocol core and its collaborators:
//! rounds, periods, steps, credentials, votes, proposals, bundles, and the
//! network message envelope.
//!
//! Everything here is plain data. The protocol state machine that consumes
//! these types lives in the `palisade-agreement` crate.

pub mod bundle;
pub mod committee;
pub mod common;
pub mod message;
pub mod proposal;
pub mod vote;

pub use bundle::{Bundle, BundleError, UnauthenticatedBundle};
pub use committee::{Committee, Credential, CredentialError, Membership};
pub use common::{Address, Digest, Period, Round, Step};
pub use message::{Message, PeerHandle, Tag};
pub use proposal::{Block, Proposal, ProposalValue, TransmittedPayload};
pub use vote::{RawVote, UnauthenticatedVote, Vote, VoteError};
