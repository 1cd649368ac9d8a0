// Copyright © Palisade Contributors
// SPDX-License-Identifier: Apache-2.0

//! Message demultiplexing and event selection.
//!
//! The demux turns the transport's three tag queues, the verifier's output
//! channel, the clock, and the ledger's round notifications into a single
//! stream of player events. Raw messages are filtered against the player's
//! (round, period) position: stale traffic is dropped, near-future traffic
//! is parked and replayed once the player catches up, and everything else
//! goes through cryptographic validation before it reaches the player.
//!
//! Tie-breaks are fixed rather than random so replay is deterministic:
//! checkpoint completions outrank everything, authenticated events drain
//! next, armed timeouts beat raw (unverified) traffic.

use crate::{
    clock::Clock,
    events::ExternalEvent,
    ledger::LedgerReader,
    metrics,
    monitor::{EventsMonitor, DEMUX_QUEUE},
    network::MessageStreams,
    verifier::AsyncVerifier,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use palisade_agreement_types::{
    Message, PeerHandle, Period, Round, Step, Tag, TransmittedPayload, UnauthenticatedBundle,
    UnauthenticatedVote,
};
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Rounds ahead of the player worth holding on to.
const ROUND_LOOKAHEAD: Round = 1;
/// Periods ahead of the player worth holding on to.
const PERIOD_LOOKAHEAD: Period = 3;
/// Total parked messages across tags; beyond this, future traffic is shed.
const PARK_CAPACITY: usize = 512;

enum Disposition {
    Submit,
    Park,
    Stale,
    TooFar,
}

pub struct Demux {
    streams: MessageStreams,
    votes_closed: bool,
    payloads_closed: bool,
    bundles_closed: bool,

    /// Authenticated events from the verifier pool and the pseudonode.
    events: mpsc::UnboundedReceiver<ExternalEvent>,
    verifier: AsyncVerifier,

    /// Pending checkpoint completions, drained ahead of everything else.
    priority: VecDeque<oneshot::Receiver<ExternalEvent>>,

    parked_votes: Vec<(UnauthenticatedVote, Option<PeerHandle>)>,
    parked_payloads: Vec<(TransmittedPayload, Option<PeerHandle>)>,
    parked_bundles: Vec<(UnauthenticatedBundle, Option<PeerHandle>)>,

    position: (Round, Period),
    monitor: Arc<dyn EventsMonitor>,
}

impl Demux {
    pub fn new(
        streams: MessageStreams,
        verifier: AsyncVerifier,
        events: mpsc::UnboundedReceiver<ExternalEvent>,
        monitor: Arc<dyn EventsMonitor>,
    ) -> Demux {
        Demux {
            streams,
            votes_closed: false,
            payloads_closed: false,
            bundles_closed: false,
            events,
            verifier,
            priority: VecDeque::new(),
            parked_votes: Vec::new(),
            parked_payloads: Vec::new(),
            parked_bundles: Vec::new(),
            position: (0, 0),
            monitor,
        }
    }

    /// Registers a checkpoint completion to be delivered before ordinary
    /// traffic.
    pub fn prioritize(&mut self, receiver: oneshot::Receiver<ExternalEvent>) {
        self.priority.push_back(receiver);
    }

    /// Produces the next player event. `round`/`period` are the player's
    /// position; `deadline`/`fast_deadline` its armed timeouts.
    pub async fn next(
        &mut self,
        clock: &dyn Clock,
        ledger: &dyn LedgerReader,
        round: Round,
        period: Period,
        deadline: Option<Duration>,
        fast_deadline: Option<Duration>,
    ) -> ExternalEvent {
        if self.position != (round, period) {
            self.position = (round, period);
            self.replay_parked();
        }

        loop {
            self.report_queue_depth();

            let mut step_timeout = maybe_timeout(clock, deadline);
            let mut fast_timeout = maybe_timeout(clock, fast_deadline);
            let mut committed = ledger.wait(round);
            let Demux {
                streams,
                votes_closed,
                payloads_closed,
                bundles_closed,
                events,
                priority,
                ..
            } = self;

            // Biased selection fixes the tie-break order: checkpoint
            // completions first, then events already authenticated, then
            // timers, with raw traffic last. A deadline can preempt
            // unverified messages but never work already admitted.
            let routed = tokio::select! {
                biased;
                event = next_priority(priority) => return event,
                event = events.recv() => {
                    match event {
                        Some(event) => return event,
                        // Producers all gone; the service is tearing down.
                        None => { futures::future::pending::<()>().await; continue },
                    }
                },
                _ = &mut step_timeout => {
                    return ExternalEvent::Timeout {
                        offset: deadline.unwrap_or_default(),
                        fast: false,
                    };
                },
                _ = &mut fast_timeout => {
                    return ExternalEvent::Timeout {
                        offset: fast_deadline.unwrap_or_default(),
                        fast: true,
                    };
                },
                _ = &mut committed => {
                    return ExternalEvent::RoundInterruption { round: ledger.next_round() };
                },
                msg = recv_open(&mut streams.votes, votes_closed) => (Tag::Vote, msg),
                msg = recv_open(&mut streams.payloads, payloads_closed) => {
                    (Tag::ProposalPayload, msg)
                },
                msg = recv_open(&mut streams.bundles, bundles_closed) => (Tag::VoteBundle, msg),
            };

            let (tag, message) = routed;
            if let Some(event) = self.route(tag, message) {
                return event;
            }
        }
    }

    /// Decodes, filters, and dispatches one raw message. Returns an event
    /// only for decode failures, which turn into disconnects.
    fn route(&mut self, tag: Tag, message: Message) -> Option<ExternalEvent> {
        let source = message.source;
        match tag {
            Tag::Vote => {
                let vote: UnauthenticatedVote = match decode(&message, tag) {
                    Ok(vote) => vote,
                    Err(event) => return Some(event),
                };
                match self.filter_vote(&vote) {
                    Disposition::Submit => self.verifier.submit_vote(vote, source),
                    Disposition::Park => self.park_vote(vote, source),
                    Disposition::Stale => metrics::MESSAGES_STALE.inc(),
                    Disposition::TooFar => metrics::MESSAGES_DROPPED.inc(),
                }
            },
            Tag::ProposalPayload => {
                let payload: TransmittedPayload = match decode(&message, tag) {
                    Ok(payload) => payload,
                    Err(event) => return Some(event),
                };
                match self.filter_round(payload.proposal.block.round) {
                    Disposition::Submit => self.verifier.submit_payload(payload, source),
                    Disposition::Park => self.park_payload(payload, source),
                    Disposition::Stale => metrics::MESSAGES_STALE.inc(),
                    Disposition::TooFar => metrics::MESSAGES_DROPPED.inc(),
                }
            },
            Tag::VoteBundle => {
                let bundle: UnauthenticatedBundle = match decode(&message, tag) {
                    Ok(bundle) => bundle,
                    Err(event) => return Some(event),
                };
                match self.filter_round(bundle.round) {
                    Disposition::Submit => self.verifier.submit_bundle(bundle, source),
                    Disposition::Park => self.park_bundle(bundle, source),
                    Disposition::Stale => metrics::MESSAGES_STALE.inc(),
                    Disposition::TooFar => metrics::MESSAGES_DROPPED.inc(),
                }
            },
        }
        None
    }

    fn filter_vote(&self, vote: &UnauthenticatedVote) -> Disposition {
        let (round, period) = self.position;
        match self.filter_round(vote.raw.round) {
            Disposition::Submit => {},
            other => return other,
        }
        if vote.raw.round > round {
            return Disposition::Park;
        }
        // Cert votes from any period can still certify the round.
        if vote.raw.step == Step::CERT {
            return Disposition::Submit;
        }
        if vote.raw.period + 1 < period {
            return Disposition::Stale;
        }
        if vote.raw.period > period + PERIOD_LOOKAHEAD {
            return Disposition::TooFar;
        }
        if vote.raw.period > period {
            return Disposition::Park;
        }
        Disposition::Submit
    }

    fn filter_round(&self, message_round: Round) -> Disposition {
        let (round, _) = self.position;
        if message_round < round {
            Disposition::Stale
        } else if message_round > round + ROUND_LOOKAHEAD {
            Disposition::TooFar
        } else if message_round > round {
            Disposition::Park
        } else {
            Disposition::Submit
        }
    }

    fn parked_total(&self) -> usize {
        self.parked_votes.len() + self.parked_payloads.len() + self.parked_bundles.len()
    }

    fn park_vote(&mut self, vote: UnauthenticatedVote, source: Option<PeerHandle>) {
        if self.parked_total() >= PARK_CAPACITY {
            metrics::MESSAGES_DROPPED.inc();
            return;
        }
        metrics::MESSAGES_PARKED.inc();
        self.parked_votes.push((vote, source));
    }

    fn park_payload(&mut self, payload: TransmittedPayload, source: Option<PeerHandle>) {
        if self.parked_total() >= PARK_CAPACITY {
            metrics::MESSAGES_DROPPED.inc();
            return;
        }
        metrics::MESSAGES_PARKED.inc();
        self.parked_payloads.push((payload, source));
    }

    fn park_bundle(&mut self, bundle: UnauthenticatedBundle, source: Option<PeerHandle>) {
        if self.parked_total() >= PARK_CAPACITY {
            metrics::MESSAGES_DROPPED.inc();
            return;
        }
        metrics::MESSAGES_PARKED.inc();
        self.parked_bundles.push((bundle, source));
    }

    /// Re-files every parked message against the new position.
    fn replay_parked(&mut self) {
        for (vote, source) in std::mem::take(&mut self.parked_votes) {
            match self.filter_vote(&vote) {
                Disposition::Submit => self.verifier.submit_vote(vote, source),
                Disposition::Park => self.parked_votes.push((vote, source)),
                _ => metrics::MESSAGES_STALE.inc(),
            }
        }
        for (payload, source) in std::mem::take(&mut self.parked_payloads) {
            match self.filter_round(payload.proposal.block.round) {
                Disposition::Submit => self.verifier.submit_payload(payload, source),
                Disposition::Park => self.parked_payloads.push((payload, source)),
                _ => metrics::MESSAGES_STALE.inc(),
            }
        }
        for (bundle, source) in std::mem::take(&mut self.parked_bundles) {
            match self.filter_round(bundle.round) {
                Disposition::Submit => self.verifier.submit_bundle(bundle, source),
                Disposition::Park => self.parked_bundles.push((bundle, source)),
                _ => metrics::MESSAGES_STALE.inc(),
            }
        }
        self.report_queue_depth();
    }

    fn report_queue_depth(&self) {
        let backlog = self.parked_total() + self.verifier.pending() + self.events.len();
        self.monitor.update_queue(DEMUX_QUEUE, backlog);
    }
}

/// Awaits the oldest registered checkpoint completion, skipping channels
/// whose sender died.
async fn next_priority(
    priority: &mut VecDeque<oneshot::Receiver<ExternalEvent>>,
) -> ExternalEvent {
    loop {
        if priority.front_mut().is_none() {
            futures::future::pending::<()>().await;
            continue;
        }
        let done = match priority.front_mut() {
            Some(front) => front.await,
            None => continue,
        };
        priority.pop_front();
        match done {
            Ok(event) => return event,
            Err(_) => debug!("checkpoint channel closed without an event"),
        }
    }
}

fn maybe_timeout(clock: &dyn Clock, offset: Option<Duration>) -> BoxFuture<'static, ()> {
    match offset {
        Some(offset) => clock.timeout_at(offset),
        None => futures::future::pending().boxed(),
    }
}

async fn recv_open(rx: &mut mpsc::Receiver<Message>, closed: &mut bool) -> Message {
    if *closed {
        futures::future::pending::<()>().await;
    }
    match rx.recv().await {
        Some(message) => message,
        None => {
            *closed = true;
            futures::future::pending().await
        },
    }
}

fn decode<T: DeserializeOwned>(message: &Message, tag: Tag) -> Result<T, ExternalEvent> {
    bcs::from_bytes(&message.data).map_err(|e| ExternalEvent::VerificationFailed {
        tag,
        source: message.source,
        reason: format!("undecodable message: {}", e),
    })
}
