// Copyright © Palisade Contributors
// SPDX-License-Identifier: Apache-2.0

//! The round/period/step state machine.
//!
//! The player consumes one external event at a time and returns the actions
//! that follow from it. It owns the vote tracker and proposal store
//! outright; nothing else touches them, so no locking is involved anywhere
//! in the protocol state.
//!
//! Step progression within a period:
//!
//! - filter timeout → soft vote for the staged, starting, or best frozen
//!   value;
//! - soft-quorum with payload in hand → cert vote (event-driven, allowed
//!   until the next series begins);
//! - deadline timeout → next₀ vote, then next₁, next₂, … at widening
//!   offsets, each carrying the best value the player can still justify;
//! - next-quorum (or a recovery quorum) → the following period;
//! - cert-quorum with payload in hand → deliver, and the round moves once
//!   the ledger confirms.
//!
//! The fast partition recovery timer arms after the first next vote and
//! re-fires every λ_f, re-issuing redo/late/down attestations until some
//! quorum forms.

use crate::{
    actions::Action,
    events::{ExternalEvent, Quorum},
    metrics,
    params::{ProtocolParams, RandomSource},
    proposals::ProposalStore,
    votes::{VoteOutcome, VoteTracker},
};
use palisade_agreement_types::{
    Bundle, PeerHandle, Period, ProposalValue, Round, Step, Tag, TransmittedPayload, Vote,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// The serializable core of the player, checkpointed on every persistent
/// transition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub round: Round,
    pub period: Period,
    pub step: Step,
    pub last_concluding: Step,
    pub deadline: Option<Duration>,
    pub fast_deadline: Option<Duration>,
    pub fast_armed: bool,
    pub starting: ProposalValue,
    pub cert_voted: Option<ProposalValue>,
    pub next_count: u64,
    pub pending_cert: Option<Bundle>,
}

pub struct Player {
    round: Round,
    period: Period,
    step: Step,
    /// Step of the quorum that concluded the previous period.
    last_concluding: Step,
    /// Offset of the armed step timeout, relative to the clock zero.
    deadline: Option<Duration>,
    /// Offset of the armed fast recovery timeout.
    fast_deadline: Option<Duration>,
    /// False until the zero-offset arming fire has been consumed.
    fast_armed: bool,
    /// The period's starting value; bottom for period 0 and bottom-entered
    /// periods.
    starting: ProposalValue,
    cert_voted: Option<ProposalValue>,
    /// Number of next votes cast this period.
    next_count: u64,
    /// A cert-quorum observed before its payload arrived.
    pending_cert: Option<Bundle>,

    proposals: ProposalStore,
    votes: VoteTracker,
    params: ProtocolParams,
}

impl Player {
    /// Creates a player entering `round` fresh. The returned actions start
    /// the round and must be externalized by the caller.
    pub fn new(params: ProtocolParams, round: Round) -> (Player, Vec<Action>) {
        let mut player = Player {
            round,
            period: 0,
            step: Step::PROPOSE,
            last_concluding: Step::PROPOSE,
            deadline: None,
            fast_deadline: None,
            fast_armed: false,
            starting: ProposalValue::bottom(),
            cert_voted: None,
            next_count: 0,
            pending_cert: None,
            proposals: ProposalStore::new(round),
            votes: VoteTracker::new(round),
            params,
        };
        let actions = player.enter_round(round);
        (player, actions)
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn period(&self) -> Period {
        self.period
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    pub fn fast_deadline(&self) -> Option<Duration> {
        self.fast_deadline
    }

    pub fn proposal_store(&self) -> &ProposalStore {
        &self.proposals
    }

    pub fn vote_tracker(&self) -> &VoteTracker {
        &self.votes
    }

    pub fn snapshot(&self) -> PlayerSnapshot {
        PlayerSnapshot {
            round: self.round,
            period: self.period,
            step: self.step,
            last_concluding: self.last_concluding,
            deadline: self.deadline,
            fast_deadline: self.fast_deadline,
            fast_armed: self.fast_armed,
            starting: self.starting,
            cert_voted: self.cert_voted,
            next_count: self.next_count,
            pending_cert: self.pending_cert.clone(),
        }
    }

    /// Rebuilds a player from crash state.
    pub fn from_snapshot(
        snapshot: PlayerSnapshot,
        proposals: ProposalStore,
        votes: VoteTracker,
        params: ProtocolParams,
    ) -> Player {
        Player {
            round: snapshot.round,
            period: snapshot.period,
            step: snapshot.step,
            last_concluding: snapshot.last_concluding,
            deadline: snapshot.deadline,
            fast_deadline: snapshot.fast_deadline,
            fast_armed: snapshot.fast_armed,
            starting: snapshot.starting,
            cert_voted: snapshot.cert_voted,
            next_count: snapshot.next_count,
            pending_cert: snapshot.pending_cert,
            proposals,
            votes,
            params,
        }
    }

    pub fn handle(&mut self, event: ExternalEvent, random: &dyn RandomSource) -> Vec<Action> {
        match event {
            ExternalEvent::Timeout { offset, fast: false } => {
                self.handle_step_timeout(offset, random)
            },
            ExternalEvent::Timeout { offset, fast: true } => {
                self.handle_fast_timeout(offset, random)
            },
            ExternalEvent::Vote { vote, source } => self.handle_vote(vote, source),
            ExternalEvent::Payload { proposal, prior_vote, source } => {
                self.handle_payload(proposal, prior_vote, source)
            },
            ExternalEvent::Bundle { bundle, source } => self.handle_bundle(bundle, source),
            ExternalEvent::VerificationFailed { tag, source, reason } => {
                metrics::VERIFICATIONS_REJECTED.inc();
                warn!(%tag, ?source, reason, "message failed validation");
                match source {
                    Some(peer) => vec![Action::Disconnect { peer }],
                    None => vec![],
                }
            },
            ExternalEvent::RoundInterruption { round } => {
                if round <= self.round {
                    return vec![];
                }
                self.enter_round(round)
            },
            ExternalEvent::Checkpointed { round, period, step, result } => {
                if let Err(reason) = result {
                    error!(round, period, %step, reason, "checkpoint failed");
                } else {
                    debug!(round, period, %step, "checkpoint committed");
                }
                vec![]
            },
        }
    }

    fn handle_step_timeout(
        &mut self,
        offset: Duration,
        random: &dyn RandomSource,
    ) -> Vec<Action> {
        if self.deadline != Some(offset) {
            debug!(round = self.round, ?offset, "stale step timeout ignored");
            return vec![];
        }
        match self.step {
            Step::PROPOSE => self.issue_soft_vote(),
            _ => self.issue_next_vote(random),
        }
    }

    /// Filter timeout: close the propose step and vote soft.
    fn issue_soft_vote(&mut self) -> Vec<Action> {
        self.step = if self.cert_voted.is_some() { Step::CERT } else { Step::SOFT };
        self.deadline = Some(self.params.deadline_timeout());

        let choice = self
            .proposals
            .staged(self.period)
            .or_else(|| {
                if self.period > 0 && !self.starting.is_bottom() {
                    Some(self.starting)
                } else {
                    self.proposals.frozen_best(self.period)
                }
            });
        match choice {
            Some(value) => vec![Action::Attest {
                round: self.round,
                period: self.period,
                step: Step::SOFT,
                proposal: value,
            }],
            None => {
                debug!(round = self.round, period = self.period, "nothing to soft-vote");
                vec![]
            },
        }
    }

    fn issue_next_vote(&mut self, random: &dyn RandomSource) -> Vec<Action> {
        let k = self.next_count;
        self.next_count += 1;
        self.step = Step::next(k);
        self.deadline = Some(self.params.next_deadline(self.next_count, random));
        if !self.fast_armed && self.fast_deadline.is_none() {
            self.fast_deadline = Some(Duration::ZERO);
        }

        vec![Action::Attest {
            round: self.round,
            period: self.period,
            step: Step::next(k),
            proposal: self.next_value(),
        }]
    }

    /// The best value a next vote can still justify.
    fn next_value(&self) -> ProposalValue {
        if let Some(value) = self.cert_voted {
            value
        } else if let Some(value) = self.proposals.committable(self.period) {
            value
        } else if !self.starting.is_bottom() {
            self.starting
        } else {
            ProposalValue::bottom()
        }
    }

    fn handle_fast_timeout(
        &mut self,
        offset: Duration,
        random: &dyn RandomSource,
    ) -> Vec<Action> {
        if self.fast_deadline != Some(offset) {
            debug!(round = self.round, ?offset, "stale fast timeout ignored");
            return vec![];
        }
        if !self.fast_armed {
            self.fast_armed = true;
            self.fast_deadline = Some(self.params.first_recovery_deadline(random));
            return vec![];
        }
        self.fast_deadline = Some(self.params.subsequent_recovery_deadline(offset));

        // Recovery attestations are re-issued on every firing so a healed
        // partition can assemble a quorum from rebroadcasts alone.
        let (step, value) = if let Some(value) = self.proposals.staged(self.period) {
            (Step::REDO, value)
        } else if let Some(value) = self.proposals.pinned() {
            (Step::LATE, value)
        } else {
            (Step::DOWN, ProposalValue::bottom())
        };
        vec![Action::Attest { round: self.round, period: self.period, step, proposal: value }]
    }

    fn handle_vote(&mut self, vote: Vote, source: Option<PeerHandle>) -> Vec<Action> {
        if vote.step() == Step::PROPOSE {
            if self.proposals.observe_propose_vote(&vote) {
                return relay_vote(source, &vote).into_iter().collect();
            }
            return vec![];
        }

        match self.votes.observe(vote) {
            VoteOutcome::Fresh(quorum) => {
                let mut actions: Vec<Action> = relay_vote(source, &vote).into_iter().collect();
                if let Some(quorum) = quorum {
                    actions.extend(self.handle_quorum(quorum));
                }
                actions
            },
            VoteOutcome::Duplicate => vec![],
            VoteOutcome::Equivocation { previous } => {
                debug!(
                    voter = %vote.sender(),
                    ?previous,
                    latest = ?vote.proposal(),
                    "dropped equivocating vote"
                );
                vec![]
            },
            VoteOutcome::WrongRound => {
                metrics::MESSAGES_STALE.inc();
                vec![]
            },
        }
    }

    fn handle_payload(
        &mut self,
        proposal: palisade_agreement_types::Proposal,
        prior_vote: Vote,
        source: Option<PeerHandle>,
    ) -> Vec<Action> {
        let value = proposal.value();
        let mut actions = Vec::new();

        self.proposals.observe_propose_vote(&prior_vote);
        let fresh = self.proposals.observe_payload(proposal.clone());
        if fresh && source.is_some() && self.proposals.relevant(value) {
            let wire = TransmittedPayload {
                proposal: proposal.clone(),
                prior_vote: *prior_vote.unauthenticated(),
            };
            if let Ok(data) = bcs::to_bytes(&wire) {
                actions.push(Action::Relay {
                    source,
                    tag: Tag::ProposalPayload,
                    data: data.into(),
                });
            }
        }

        if self.pending_cert.as_ref().map_or(false, |c| c.proposal == value) {
            if let Some(certificate) = self.pending_cert.take() {
                actions.push(Action::Deliver { proposal, certificate });
            }
            return actions;
        }

        actions.extend(self.try_cert_vote());
        actions
    }

    fn handle_bundle(&mut self, bundle: Bundle, source: Option<PeerHandle>) -> Vec<Action> {
        if bundle.round != self.round {
            metrics::MESSAGES_STALE.inc();
            return vec![];
        }
        if !self.votes.register_external_bundle(&bundle) {
            return vec![];
        }

        let mut actions = Vec::new();
        if let Ok(data) = bcs::to_bytes(&bundle.unauthenticated()) {
            actions.push(Action::Relay { source, tag: Tag::VoteBundle, data: data.into() });
        }
        let quorum = Quorum {
            period: bundle.period,
            step: bundle.step,
            value: bundle.proposal,
            bundle,
        };
        actions.extend(self.handle_quorum(quorum));
        actions
    }

    fn handle_quorum(&mut self, quorum: Quorum) -> Vec<Action> {
        match quorum.step {
            Step::SOFT => {
                self.proposals.stage(quorum.period, quorum.value);
                if quorum.period == self.period {
                    self.try_cert_vote()
                } else {
                    vec![]
                }
            },
            Step::CERT => self.deliver_or_pend(quorum.bundle),
            step if step.is_next() || step.is_recovery() => {
                self.try_enter_period(quorum.period + 1, quorum.value, step, Some(quorum.bundle))
            },
            step => {
                error!(%step, "quorum reported for a non-quorum step");
                vec![]
            },
        }
    }

    /// Cert votes are event-driven: they fire on whichever arrives last of
    /// the soft-quorum and the payload, but never after the next series has
    /// begun and never twice in one period.
    fn try_cert_vote(&mut self) -> Vec<Action> {
        if self.cert_voted.is_some() || self.step.is_next() || self.step.is_recovery() {
            return vec![];
        }
        let Some(value) = self.proposals.committable(self.period) else {
            return vec![];
        };
        self.cert_voted = Some(value);
        if self.step == Step::SOFT {
            self.step = Step::CERT;
        }
        vec![Action::Attest {
            round: self.round,
            period: self.period,
            step: Step::CERT,
            proposal: value,
        }]
    }

    fn deliver_or_pend(&mut self, certificate: Bundle) -> Vec<Action> {
        match self.proposals.payload(certificate.proposal).cloned() {
            Some(proposal) => {
                self.pending_cert = None;
                vec![Action::Deliver { proposal, certificate }]
            },
            None => {
                if let Some(pending) = self.pending_cert.as_ref() {
                    if pending.proposal != certificate.proposal {
                        // Two cert-quorums for distinct values should be
                        // impossible under the honest-majority assumption.
                        error!(
                            round = self.round,
                            held = ?pending.proposal,
                            observed = ?certificate.proposal,
                            "distinct cert-quorums observed; keeping the first"
                        );
                    }
                    return vec![];
                }
                self.pending_cert = Some(certificate);
                vec![]
            },
        }
    }

    fn try_enter_period(
        &mut self,
        target: Period,
        starting: ProposalValue,
        concluding: Step,
        bundle: Option<Bundle>,
    ) -> Vec<Action> {
        // A period is entered at most once; quorums from superseded periods
        // cannot drag the player backwards.
        if target <= self.period {
            return vec![];
        }
        self.enter_period(target, starting, concluding, bundle)
    }

    fn enter_period(
        &mut self,
        period: Period,
        starting: ProposalValue,
        concluding: Step,
        bundle: Option<Bundle>,
    ) -> Vec<Action> {
        info!(
            round = self.round,
            period,
            concluding = %concluding,
            starting = ?starting,
            "entering period"
        );
        metrics::PERIODS_STARTED.inc();
        metrics::CURRENT_PERIOD.set(period as i64);

        self.period = period;
        self.step = Step::PROPOSE;
        self.last_concluding = concluding;
        self.starting = starting;
        self.cert_voted = None;
        self.next_count = 0;
        self.fast_armed = false;
        self.fast_deadline = None;
        self.deadline = Some(self.params.filter_timeout());
        self.proposals.pin(starting);
        self.votes.prune_periods(period);

        let mut actions = vec![Action::Rezero { round: self.round }];
        if let Some(bundle) = bundle {
            if let Ok(data) = bcs::to_bytes(&bundle.unauthenticated()) {
                actions.push(Action::Broadcast { tag: Tag::VoteBundle, data: data.into() });
            }
        }
        if starting.is_bottom() {
            actions.push(Action::Assemble { round: self.round, period });
        } else {
            actions.push(Action::Repropose { round: self.round, period, value: starting });
        }
        actions
    }

    fn enter_round(&mut self, round: Round) -> Vec<Action> {
        info!(round, "entering round");
        self.round = round;
        self.period = 0;
        self.step = Step::PROPOSE;
        self.last_concluding = Step::PROPOSE;
        self.starting = ProposalValue::bottom();
        self.cert_voted = None;
        self.next_count = 0;
        self.fast_armed = false;
        self.fast_deadline = None;
        self.pending_cert = None;
        self.deadline = Some(self.params.filter_timeout());
        self.proposals.advance_round(round);
        self.votes.advance_round(round);
        metrics::CURRENT_PERIOD.set(0);

        vec![
            Action::Rezero { round },
            Action::Assemble { round, period: 0 },
        ]
    }
}

/// Fresh foreign votes are forwarded. The node's own votes are not: the
/// pseudonode already broadcast them when it signed them.
fn relay_vote(source: Option<PeerHandle>, vote: &Vote) -> Option<Action> {
    source?;
    bcs::to_bytes(vote.unauthenticated())
        .ok()
        .map(|data| Action::Relay { source, tag: Tag::Vote, data: data.into() })
}
