// Copyright © Palisade Contributors
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Opaque reference to the peer a message arrived from. Relay excludes it;
/// disconnect targets it. Messages this node injects into itself carry no
/// handle.
pub type PeerHandle = u64;

/// Network tags the agreement service subscribes to. Anything else is
/// dropped by the transport before it reaches the core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tag {
    Vote,
    ProposalPayload,
    VoteBundle,
}

impl Tag {
    pub fn as_str(self) -> &'static str {
        match self {
            Tag::Vote => "AV",
            Tag::ProposalPayload => "PP",
            Tag::VoteBundle => "VB",
        }
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An incoming message: raw bytes plus the handle of its sender, if any.
#[derive(Clone, Debug)]
pub struct Message {
    pub source: Option<PeerHandle>,
    pub data: Bytes,
}
