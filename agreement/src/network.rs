// Copyright © Palisade Contributors
// SPDX-License-Identifier: Apache-2.0

//! Transport seam. The gossip layer (membership, connection management,
//! framing) lives outside the core; adapters hand the core one bounded
//! inbound queue per tag and accept non-blocking outbound sends.

use crate::metrics;
use bytes::Bytes;
use palisade_agreement_types::{Message, PeerHandle, Tag};
use tokio::sync::mpsc;

/// Inbound queue capacities per tag. Votes are small and bursty; payloads
/// are large and rare enough that a short queue bounds memory.
pub const VOTE_BUFFER: usize = 10_000;
pub const PROPOSAL_BUFFER: usize = 14;
pub const BUNDLE_BUFFER: usize = 7;

/// Outbound surface of the transport.
pub trait Network: Send + Sync {
    /// Best-effort broadcast; the transport may drop.
    fn broadcast(&self, tag: Tag, data: Bytes) -> anyhow::Result<()>;

    /// Forwards to all peers except the message's original sender. A relay
    /// without a source is this node's own traffic and broadcasts.
    fn relay(&self, source: Option<PeerHandle>, tag: Tag, data: Bytes) -> anyhow::Result<()>;

    fn disconnect(&self, peer: PeerHandle);
}

/// Inbound message queues, consumed by the demux.
pub struct MessageStreams {
    pub votes: mpsc::Receiver<Message>,
    pub payloads: mpsc::Receiver<Message>,
    pub bundles: mpsc::Receiver<Message>,
}

/// Producer half handed to the transport adapter.
#[derive(Clone)]
pub struct MessageSinks {
    votes: mpsc::Sender<Message>,
    payloads: mpsc::Sender<Message>,
    bundles: mpsc::Sender<Message>,
}

impl MessageSinks {
    /// Enqueues without blocking; a full queue drops the message and counts
    /// the drop.
    pub fn deliver(&self, tag: Tag, message: Message) {
        let sender = match tag {
            Tag::Vote => &self.votes,
            Tag::ProposalPayload => &self.payloads,
            Tag::VoteBundle => &self.bundles,
        };
        match sender.try_send(message) {
            Ok(()) => metrics::MESSAGES_HANDLED.inc(),
            Err(_) => metrics::MESSAGES_DROPPED.inc(),
        }
    }
}

pub fn message_channels() -> (MessageSinks, MessageStreams) {
    let (votes_tx, votes_rx) = mpsc::channel(VOTE_BUFFER);
    let (payloads_tx, payloads_rx) = mpsc::channel(PROPOSAL_BUFFER);
    let (bundles_tx, bundles_rx) = mpsc::channel(BUNDLE_BUFFER);
    (
        MessageSinks { votes: votes_tx, payloads: payloads_tx, bundles: bundles_tx },
        MessageStreams { votes: votes_rx, payloads: payloads_rx, bundles: bundles_rx },
    )
}
