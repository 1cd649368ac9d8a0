// Copyright © Palisade Contributors
// SPDX-License-Identifier: Apache-2.0

//! Loopback injection of this node's own traffic.
//!
//! When the player decides to propose or attest, the pseudonode signs the
//! corresponding votes with every live participation key, broadcasts them,
//! and feeds them back through the demux as if they had arrived over the
//! network. Broadcasting at signing time (rather than when the player sees
//! the loopback copy) means re-issued recovery votes reach a healed
//! partition even though the player's tracker has already counted them.
//! Signing runs on spawned tasks so a slow key store never stalls the
//! player.

use crate::{
    config::LocalConfig,
    events::ExternalEvent,
    keys::KeyManager,
    ledger::{membership_of, BlockFactory, LedgerReader},
    metrics,
    monitor::{EventsMonitor, PSEUDONODE_QUEUE},
    network::Network,
};
use palisade_agreement_types::{
    Period, Proposal, ProposalValue, RawVote, Round, Step, Tag, TransmittedPayload,
    UnauthenticatedVote,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub struct Pseudonode {
    keys: Arc<dyn KeyManager>,
    factory: Arc<dyn BlockFactory>,
    ledger: Arc<dyn LedgerReader>,
    network: Arc<dyn Network>,
    events: mpsc::UnboundedSender<ExternalEvent>,
    monitor: Arc<dyn EventsMonitor>,
    pending: Arc<AtomicUsize>,
    config: LocalConfig,
}

impl Pseudonode {
    pub fn new(
        keys: Arc<dyn KeyManager>,
        factory: Arc<dyn BlockFactory>,
        ledger: Arc<dyn LedgerReader>,
        network: Arc<dyn Network>,
        events: mpsc::UnboundedSender<ExternalEvent>,
        monitor: Arc<dyn EventsMonitor>,
        config: LocalConfig,
    ) -> Pseudonode {
        Pseudonode {
            keys,
            factory,
            ledger,
            network,
            events,
            monitor,
            pending: Arc::new(AtomicUsize::new(0)),
            config,
        }
    }

    /// Assembles a block and introduces one proposal per live key: the
    /// payload (with its introducing vote) plus the standalone propose
    /// vote, all as loopback events.
    pub fn make_proposals(&self, round: Round, period: Period) {
        let factory = Arc::clone(&self.factory);
        let enable_stats = self.config.enable_assemble_stats;
        let job = self.job();
        let keys = self.keys.clone();
        let ledger = self.ledger.clone();
        let network = self.network.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let _job = job;
            let started = std::time::Instant::now();
            let block = match factory.assemble(round).await {
                Ok(block) => block,
                Err(e) => {
                    warn!(round, error = %e, "could not assemble a proposal");
                    return;
                },
            };
            if enable_stats {
                metrics::ASSEMBLE_SECONDS.observe(started.elapsed().as_secs_f64());
            }

            for participation in live_keys(keys.as_ref(), round) {
                let membership =
                    match membership_of(ledger.as_ref(), participation.address, round) {
                        Ok(membership) => membership,
                        Err(e) => {
                            debug!(address = %participation.address, error = %e,
                                "no stake record for participation key");
                            continue;
                        },
                    };

                let mut block = block.clone();
                block.proposer = participation.address;
                let proposal = Proposal {
                    block,
                    original_period: period,
                    original_proposer: participation.address,
                };
                let raw = RawVote {
                    sender: participation.address,
                    round,
                    period,
                    step: Step::PROPOSE,
                    proposal: proposal.value(),
                };
                let unauthenticated = match UnauthenticatedVote::new_signed(
                    raw,
                    &membership,
                    participation.keypair(),
                ) {
                    Ok(vote) => vote,
                    Err(e) => {
                        debug!(address = %participation.address, error = %e,
                            "key not eligible to propose");
                        continue;
                    },
                };
                let vote = match unauthenticated.verify(&membership) {
                    Ok(vote) => vote,
                    Err(e) => {
                        warn!(error = %e, "own proposal vote failed verification");
                        continue;
                    },
                };

                broadcast_vote(network.as_ref(), &unauthenticated);
                let wire = TransmittedPayload {
                    proposal: proposal.clone(),
                    prior_vote: unauthenticated,
                };
                if let Ok(data) = bcs::to_bytes(&wire) {
                    if let Err(e) = network.broadcast(Tag::ProposalPayload, data.into()) {
                        debug!(error = %e, "could not broadcast own payload");
                    }
                }
                let _ = events.send(ExternalEvent::Vote { vote, source: None });
                let _ = events.send(ExternalEvent::Payload {
                    proposal,
                    prior_vote: vote,
                    source: None,
                });
            }
        });
    }

    /// Re-introduces a value from an earlier period: propose votes only,
    /// the payload is already circulating.
    pub fn make_reproposal(&self, round: Round, period: Period, value: ProposalValue) {
        self.sign_and_inject(round, period, Step::PROPOSE, value);
    }

    /// Signs and injects one vote per live key at the given position.
    pub fn make_votes(&self, round: Round, period: Period, step: Step, value: ProposalValue) {
        self.sign_and_inject(round, period, step, value);
    }

    fn sign_and_inject(&self, round: Round, period: Period, step: Step, value: ProposalValue) {
        let job = self.job();
        let keys = self.keys.clone();
        let ledger = self.ledger.clone();
        let network = self.network.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let _job = job;
            for participation in live_keys(keys.as_ref(), round) {
                let membership =
                    match membership_of(ledger.as_ref(), participation.address, round) {
                        Ok(membership) => membership,
                        Err(e) => {
                            debug!(address = %participation.address, error = %e,
                                "no stake record for participation key");
                            continue;
                        },
                    };
                let raw = RawVote {
                    sender: participation.address,
                    round,
                    period,
                    step,
                    proposal: value,
                };
                let unauthenticated =
                    match UnauthenticatedVote::new_signed(raw, &membership, participation.keypair()) {
                        Ok(uv) => uv,
                        Err(e) => {
                            debug!(address = %participation.address, %step, error = %e,
                                "key not eligible to vote");
                            continue;
                        },
                    };
                match unauthenticated.verify(&membership) {
                    Ok(vote) => {
                        broadcast_vote(network.as_ref(), &unauthenticated);
                        let _ = events.send(ExternalEvent::Vote { vote, source: None });
                    },
                    Err(e) => {
                        warn!(error = %e, "own vote failed verification");
                    },
                }
            }
        });
    }

    /// Tracks one outstanding signing job for the backpressure probe.
    fn job(&self) -> JobGuard {
        let count = self.pending.fetch_add(1, Ordering::Relaxed) + 1;
        self.monitor.update_queue(PSEUDONODE_QUEUE, count);
        JobGuard { pending: Arc::clone(&self.pending), monitor: Arc::clone(&self.monitor) }
    }
}

fn broadcast_vote(network: &dyn Network, vote: &UnauthenticatedVote) {
    if let Ok(data) = bcs::to_bytes(vote) {
        if let Err(e) = network.broadcast(Tag::Vote, data.into()) {
            debug!(error = %e, "could not broadcast own vote");
        }
    }
}

fn live_keys(keys: &dyn KeyManager, round: Round) -> Vec<crate::keys::Participation> {
    keys.keys()
        .into_iter()
        .filter(|p| p.overlaps_interval(round, round))
        .collect()
}

struct JobGuard {
    pending: Arc<AtomicUsize>,
    monitor: Arc<dyn EventsMonitor>,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        let count = self.pending.fetch_sub(1, Ordering::Relaxed) - 1;
        self.monitor.update_queue(PSEUDONODE_QUEUE, count);
    }
}
