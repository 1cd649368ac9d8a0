// Copyright © Palisade Contributors
// SPDX-License-Identifier: Apache-2.0

//! A deterministic multi-node switchboard.
//!
//! Each node is a bare player core; the switchboard plays the part of its
//! clock, pseudonode, ledger, and transport, delivering every message in a
//! controlled order. Tests steer liveness failures through the same knobs
//! the production network would present: dropping vote classes, pocketing
//! messages for later release, and partitioning the node set.

use palisade_agreement::actions::Action;
use palisade_agreement::events::ExternalEvent;
use palisade_agreement::params::ProtocolParams;
use palisade_agreement::player::Player;
use palisade_agreement::test_utils::{proposal_at, voting_net, MidpointRandom, VotingNet};
use palisade_agreement_types::{
    Block, Digest, Period, Round, Step, Tag, TransmittedPayload, UnauthenticatedBundle,
    UnauthenticatedVote,
};
use std::collections::{BTreeMap, VecDeque};

#[derive(Clone)]
pub enum Wire {
    Vote(UnauthenticatedVote),
    Payload(TransmittedPayload),
    Bundle(UnauthenticatedBundle),
}

/// A message captured instead of delivered, with enough addressing to
/// replay it verbatim.
#[derive(Clone)]
pub struct Pocketed {
    pub wire: Wire,
    pub from: usize,
    pub exclude: Option<usize>,
}

impl Pocketed {
    pub fn vote(&self) -> Option<&UnauthenticatedVote> {
        match &self.wire {
            Wire::Vote(vote) => Some(vote),
            _ => None,
        }
    }
}

pub struct Switchboard {
    pub net: VotingNet,
    pub params: ProtocolParams,
    players: Vec<Player>,
    inboxes: Vec<VecDeque<ExternalEvent>>,
    parked: Vec<Vec<ExternalEvent>>,
    entries: Vec<BTreeMap<Round, Block>>,
    zeroes: Vec<u64>,

    partition_side: Option<Vec<bool>>,
    drop_soft: bool,
    drop_slow_next: bool,
    drop_votes: bool,
    pocket_cert: bool,
    pocket_soft: bool,
    pocket_payloads: bool,
    pocketed: Vec<Pocketed>,
}

impl Switchboard {
    /// Boots `nodes` players into round 1 and settles the initial
    /// proposal exchange. Every node ends with one clock zero.
    pub fn start(nodes: usize) -> Switchboard {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let params = ProtocolParams::default();
        let mut sb = Switchboard {
            net: voting_net(nodes),
            params,
            players: Vec::new(),
            inboxes: vec![VecDeque::new(); nodes],
            parked: vec![Vec::new(); nodes],
            entries: vec![BTreeMap::new(); nodes],
            zeroes: vec![0; nodes],
            partition_side: None,
            drop_soft: false,
            drop_slow_next: false,
            drop_votes: false,
            pocket_cert: false,
            pocket_soft: false,
            pocket_payloads: false,
            pocketed: Vec::new(),
        };
        let mut startup = Vec::new();
        for _ in 0..nodes {
            let (player, actions) = Player::new(params, 1);
            sb.players.push(player);
            startup.push(actions);
        }
        for (node, actions) in startup.into_iter().enumerate() {
            sb.process_actions(node, actions);
        }
        sb.pump();
        sb
    }

    pub fn nodes(&self) -> usize {
        self.players.len()
    }

    pub fn round(&self, node: usize) -> Round {
        self.players[node].round()
    }

    pub fn period(&self, node: usize) -> Period {
        self.players[node].period()
    }

    pub fn next_round(&self, node: usize) -> Round {
        self.entries[node].keys().next_back().map_or(1, |r| r + 1)
    }

    pub fn digest(&self, node: usize, round: Round) -> Digest {
        self.entries[node][&round].digest()
    }

    // --- timeouts ---

    pub fn filter_timeout(&self) -> std::time::Duration {
        self.params.filter_timeout()
    }

    pub fn deadline_timeout(&self) -> std::time::Duration {
        self.params.deadline_timeout()
    }

    pub fn recovery_arm(&self) -> std::time::Duration {
        std::time::Duration::ZERO
    }

    pub fn first_recovery(&self) -> std::time::Duration {
        self.params.first_recovery_deadline(&MidpointRandom)
    }

    pub fn second_recovery(&self) -> std::time::Duration {
        self.params.subsequent_recovery_deadline(self.first_recovery())
    }

    /// Fires `offset` on every node whose armed deadline matches, then
    /// drives the network to quiescence.
    pub fn trigger_global(&mut self, offset: std::time::Duration) {
        let nodes: Vec<usize> = (0..self.nodes()).collect();
        self.trigger_nodes(&nodes, offset);
    }

    pub fn trigger_nodes(&mut self, nodes: &[usize], offset: std::time::Duration) {
        for &node in nodes {
            let event = if self.players[node].deadline() == Some(offset) {
                Some(ExternalEvent::Timeout { offset, fast: false })
            } else if self.players[node].fast_deadline() == Some(offset) {
                Some(ExternalEvent::Timeout { offset, fast: true })
            } else {
                None
            };
            if let Some(event) = event {
                self.inboxes[node].push_back(event);
            }
        }
        self.pump();
    }

    // --- expectations, in clock zeroes (one per round or period entry) ---

    pub fn expect_new_period(&self, zeroes: u64) -> u64 {
        let expected = zeroes + 1;
        for (node, z) in self.zeroes.iter().enumerate() {
            assert_eq!(*z, expected, "node {} zero count", node);
        }
        expected
    }

    pub fn expect_no_new_period(&self, zeroes: u64) -> u64 {
        for (node, z) in self.zeroes.iter().enumerate() {
            assert_eq!(*z, zeroes, "node {} zero count", node);
        }
        zeroes
    }

    pub fn run_round(&mut self, zeroes: u64) -> u64 {
        self.trigger_global(self.filter_timeout());
        self.expect_new_period(zeroes)
    }

    /// Every ledger advanced `rounds` rounds and all picked the same block
    /// at every height.
    pub fn sanity_check(&self, start: Round, rounds: u64) {
        for node in 0..self.nodes() {
            assert_eq!(
                self.next_round(node),
                start + rounds,
                "node {} did not progress {} rounds",
                node,
                rounds
            );
        }
        for round in start..start + rounds {
            let reference = self.digest(0, round);
            for node in 1..self.nodes() {
                assert_eq!(
                    self.digest(node, round),
                    reference,
                    "node {} confirmed the wrong block at round {}",
                    node,
                    round
                );
            }
        }
    }

    // --- network interference ---

    pub fn drop_all_soft_votes(&mut self) {
        self.drop_soft = true;
    }

    pub fn drop_all_slow_next_votes(&mut self) {
        self.drop_slow_next = true;
    }

    pub fn drop_all_votes(&mut self) {
        self.drop_votes = true;
    }

    pub fn pocket_cert_votes(&mut self) {
        self.pocket_cert = true;
    }

    pub fn pocket_soft_votes(&mut self) {
        self.pocket_soft = true;
    }

    pub fn pocket_payloads(&mut self) {
        self.pocket_payloads = true;
    }

    /// Stops pocketing and hands back everything captured so far.
    pub fn take_pocket(&mut self) -> Vec<Pocketed> {
        self.pocket_cert = false;
        self.pocket_soft = false;
        self.pocket_payloads = false;
        std::mem::take(&mut self.pocketed)
    }

    /// Replays captured messages onto the network.
    pub fn release(&mut self, pocketed: Vec<Pocketed>) {
        for p in pocketed {
            self.multicast(p.wire, p.from, p.exclude);
        }
        self.pump();
    }

    /// Splits the network: messages cross only between nodes on the same
    /// side of `side`.
    pub fn partition(&mut self, side: &[usize]) {
        let mut flags = vec![false; self.nodes()];
        for &node in side {
            flags[node] = true;
        }
        self.partition_side = Some(flags);
    }

    pub fn repair_all(&mut self) {
        self.partition_side = None;
        self.drop_soft = false;
        self.drop_slow_next = false;
        self.drop_votes = false;
        self.pocket_cert = false;
        self.pocket_soft = false;
        self.pocket_payloads = false;
    }

    // --- internals ---

    fn pump(&mut self) {
        loop {
            let mut progressed = false;
            for node in 0..self.nodes() {
                while let Some(event) = self.inboxes[node].pop_front() {
                    progressed = true;
                    let before = (self.players[node].round(), self.players[node].period());
                    if is_ahead(&event, before.0, before.1) {
                        self.parked[node].push(event);
                        continue;
                    }
                    let actions = self.players[node].handle(event, &MidpointRandom);
                    self.process_actions(node, actions);
                    let after = (self.players[node].round(), self.players[node].period());
                    if after != before && !self.parked[node].is_empty() {
                        let parked = std::mem::take(&mut self.parked[node]);
                        self.inboxes[node].extend(parked);
                    }
                }
            }
            if !progressed {
                break;
            }
        }
    }

    fn process_actions(&mut self, node: usize, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Rezero { .. } => self.zeroes[node] += 1,
                Action::Assemble { round, period } => {
                    let proposal = proposal_at(&self.net, node, round, period);
                    let value = proposal.value();
                    let uv =
                        self.net
                            .unauthenticated_vote(node, round, period, Step::PROPOSE, value);
                    let vote = uv.verify(&self.net.membership(node)).unwrap();
                    self.inboxes[node].push_back(ExternalEvent::Vote { vote, source: None });
                    self.inboxes[node].push_back(ExternalEvent::Payload {
                        proposal: proposal.clone(),
                        prior_vote: vote,
                        source: None,
                    });
                    self.multicast(Wire::Vote(uv), node, None);
                    self.multicast(
                        Wire::Payload(TransmittedPayload { proposal, prior_vote: uv }),
                        node,
                        None,
                    );
                },
                Action::Repropose { round, period, value } => {
                    let uv =
                        self.net
                            .unauthenticated_vote(node, round, period, Step::PROPOSE, value);
                    let vote = uv.verify(&self.net.membership(node)).unwrap();
                    self.inboxes[node].push_back(ExternalEvent::Vote { vote, source: None });
                    self.multicast(Wire::Vote(uv), node, None);
                },
                Action::Attest { round, period, step, proposal } => {
                    let uv = self.net.unauthenticated_vote(node, round, period, step, proposal);
                    let vote = uv.verify(&self.net.membership(node)).unwrap();
                    self.inboxes[node].push_back(ExternalEvent::Vote { vote, source: None });
                    self.multicast(Wire::Vote(uv), node, None);
                },
                Action::Broadcast { tag, data } => {
                    if let Some(wire) = decode_wire(tag, &data) {
                        self.multicast(wire, node, None);
                    }
                },
                Action::Relay { source, tag, data } => {
                    if let Some(wire) = decode_wire(tag, &data) {
                        self.multicast(wire, node, source.map(|s| s as usize));
                    }
                },
                Action::Disconnect { .. } => {},
                Action::Deliver { proposal, certificate } => {
                    assert_eq!(certificate.step, Step::CERT);
                    assert_eq!(certificate.proposal, proposal.value());
                    let round = proposal.block.round;
                    match self.entries[node].get(&round) {
                        Some(existing) => assert_eq!(
                            existing.digest(),
                            proposal.block.digest(),
                            "node {} delivered two distinct blocks for round {}",
                            node,
                            round
                        ),
                        None => {
                            assert_eq!(
                                round,
                                self.next_round(node),
                                "node {} delivered out of order",
                                node
                            );
                            self.entries[node].insert(round, proposal.block);
                            self.inboxes[node]
                                .push_back(ExternalEvent::RoundInterruption { round: round + 1 });
                        },
                    }
                },
            }
        }
    }

    fn multicast(&mut self, wire: Wire, from: usize, exclude: Option<usize>) {
        if let Wire::Vote(vote) = &wire {
            let step = vote.raw.step;
            if self.pocket_cert && step == Step::CERT {
                self.pocketed.push(Pocketed { wire, from, exclude });
                return;
            }
            if self.pocket_soft && step == Step::SOFT {
                self.pocketed.push(Pocketed { wire, from, exclude });
                return;
            }
            if self.drop_votes {
                return;
            }
            if self.drop_soft && step == Step::SOFT {
                return;
            }
            if self.drop_slow_next && step.is_next() {
                return;
            }
        }
        if let Wire::Payload(_) = &wire {
            if self.pocket_payloads {
                self.pocketed.push(Pocketed { wire, from, exclude });
                return;
            }
        }

        for to in 0..self.nodes() {
            if to == from || Some(to) == exclude {
                continue;
            }
            if let Some(side) = &self.partition_side {
                if side[from] != side[to] {
                    continue;
                }
            }
            self.deliver(to, wire.clone(), from);
        }
    }

    fn deliver(&mut self, to: usize, wire: Wire, from: usize) {
        let source = Some(from as u64);
        let event = match wire {
            Wire::Vote(uv) => {
                let member = self.net.lookup(uv.raw.sender).expect("vote from a stranger");
                let vote = uv.verify(&member).expect("switchboard carried a bad vote");
                ExternalEvent::Vote { vote, source }
            },
            Wire::Payload(tp) => {
                let member =
                    self.net.lookup(tp.prior_vote.raw.sender).expect("payload from a stranger");
                let prior_vote =
                    tp.prior_vote.verify(&member).expect("switchboard carried a bad payload");
                ExternalEvent::Payload { proposal: tp.proposal, prior_vote, source }
            },
            Wire::Bundle(ub) => {
                let net = &self.net;
                let bundle = ub
                    .verify(|address| net.lookup(address))
                    .expect("switchboard carried a bad bundle");
                ExternalEvent::Bundle { bundle, source }
            },
        };
        self.inboxes[to].push_back(event);
    }
}

fn decode_wire(tag: Tag, data: &[u8]) -> Option<Wire> {
    match tag {
        Tag::Vote => bcs::from_bytes(data).ok().map(Wire::Vote),
        Tag::ProposalPayload => bcs::from_bytes(data).ok().map(Wire::Payload),
        Tag::VoteBundle => bcs::from_bytes(data).ok().map(Wire::Bundle),
    }
}

/// Messages for a position the node has not reached yet are held back,
/// except cert votes, which stay decisive for the whole round.
fn is_ahead(event: &ExternalEvent, round: Round, period: Period) -> bool {
    match event {
        ExternalEvent::Vote { vote, .. } => {
            vote.round() > round
                || (vote.round() == round
                    && vote.step() != Step::CERT
                    && vote.period() > period)
        },
        ExternalEvent::Payload { proposal, .. } => proposal.block.round > round,
        ExternalEvent::Bundle { bundle, .. } => bundle.round > round,
        _ => false,
    }
}
