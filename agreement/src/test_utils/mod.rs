// Copyright © Palisade Contributors
// SPDX-License-Identifier: Apache-2.0

//! Test doubles shared by the unit suites and the integration tests:
//! deterministic voter sets, an in-memory ledger, a trivial block
//! factory/validator pair, a manual-fire clock, and midpoint entropy.

use crate::{
    clock::Clock,
    keys::{KeyManager, Participation},
    ledger::{BalanceRecord, BlockFactory, BlockValidator, Ledger, LedgerReader},
    params::RandomSource,
};
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
use ed25519_dalek::{Keypair, PublicKey, SecretKey};
use futures::future::BoxFuture;
use futures::FutureExt;
use palisade_agreement_types::{
    Address, Block, Bundle, Digest, Membership, Period, Proposal, ProposalValue, RawVote,
    Round, Step, UnauthenticatedVote, Vote,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// A deterministic set of equal-stake voters.
pub struct VotingNet {
    keypairs: Vec<Keypair>,
    members: Vec<Membership>,
}

pub fn voting_net(nodes: usize) -> VotingNet {
    let keypairs: Vec<Keypair> = (0..nodes)
        .map(|i| {
            let mut seed = [0u8; 32];
            seed[0] = i as u8 + 1;
            seed[1] = 0xA5;
            let secret = SecretKey::from_bytes(&seed).unwrap();
            let public = PublicKey::from(&secret);
            Keypair { secret, public }
        })
        .collect();
    let total = nodes as u64 * 1_000_000;
    let members = keypairs
        .iter()
        .map(|kp| Membership {
            address: Address::from_public_key(&kp.public),
            stake: 1_000_000,
            total_stake: total,
        })
        .collect();
    VotingNet { keypairs, members }
}

impl VotingNet {
    pub fn len(&self) -> usize {
        self.keypairs.len()
    }

    pub fn address(&self, i: usize) -> Address {
        self.members[i].address
    }

    pub fn membership(&self, i: usize) -> Membership {
        self.members[i]
    }

    pub fn keypair(&self, i: usize) -> &Keypair {
        &self.keypairs[i]
    }

    pub fn participation(&self, i: usize) -> Participation {
        let mut seed = [0u8; 32];
        seed[0] = i as u8 + 1;
        seed[1] = 0xA5;
        let secret = SecretKey::from_bytes(&seed).unwrap();
        let public = PublicKey::from(&secret);
        Participation::new(Keypair { secret, public }, 0, 1_000_000)
    }

    pub fn lookup(&self, address: Address) -> Option<Membership> {
        self.members.iter().find(|m| m.address == address).copied()
    }

    /// A signed, verified vote from voter `i`.
    pub fn vote(
        &self,
        i: usize,
        round: Round,
        period: Period,
        step: Step,
        proposal: ProposalValue,
    ) -> Vote {
        self.unauthenticated_vote(i, round, period, step, proposal)
            .verify(&self.members[i])
            .unwrap()
    }

    pub fn unauthenticated_vote(
        &self,
        i: usize,
        round: Round,
        period: Period,
        step: Step,
        proposal: ProposalValue,
    ) -> UnauthenticatedVote {
        let raw = RawVote { sender: self.address(i), round, period, step, proposal };
        UnauthenticatedVote::new_signed(raw, &self.members[i], &self.keypairs[i]).unwrap()
    }

    /// A quorum bundle signed by the first `n` voters.
    pub fn bundle(
        &self,
        round: Round,
        period: Period,
        step: Step,
        proposal: ProposalValue,
        n: usize,
    ) -> Bundle {
        let votes = (0..n)
            .map(|i| self.vote(i, round, period, step, proposal))
            .collect();
        Bundle::from_votes(round, period, step, proposal, votes)
    }

    /// Stake records shaped for `MockLedger`.
    pub fn balances(&self) -> BTreeMap<Address, u64> {
        self.members.iter().map(|m| (m.address, m.stake)).collect()
    }
}

/// An arbitrary non-bottom proposal value.
pub fn proposal_value(seed: u8) -> ProposalValue {
    ProposalValue {
        original_period: 0,
        original_proposer: Address([seed; 32]),
        block_digest: Digest([seed.wrapping_add(1); 32]),
    }
}

/// A proposal assembled by voter `i` for (round, period).
pub fn proposal_at(net: &VotingNet, i: usize, round: Round, period: Period) -> Proposal {
    Proposal {
        block: Block {
            round,
            proposer: net.address(i),
            prev: Digest::default(),
            seed: round.wrapping_mul(31).wrapping_add(i as u64),
            payload: Bytes::from(format!("entry-{}-{}", round, i)),
        },
        original_period: period,
        original_proposer: net.address(i),
    }
}

struct MockLedgerState {
    entries: BTreeMap<Round, (Block, Bundle)>,
    next: Round,
}

/// In-memory ledger: one entry per round, committed through
/// `ensure_block`, with watch-based round notifications. Conflicting
/// deliveries for one round panic; that is the safety violation the tests
/// exist to catch.
pub struct MockLedger {
    state: Mutex<MockLedgerState>,
    balances: BTreeMap<Address, u64>,
    committed_tx: watch::Sender<Round>,
    committed_rx: watch::Receiver<Round>,
}

impl MockLedger {
    pub fn new(balances: BTreeMap<Address, u64>) -> Arc<MockLedger> {
        let (committed_tx, committed_rx) = watch::channel(0);
        Arc::new(MockLedger {
            state: Mutex::new(MockLedgerState { entries: BTreeMap::new(), next: 1 }),
            balances,
            committed_tx,
            committed_rx,
        })
    }

    pub fn entry(&self, round: Round) -> Option<Block> {
        let state = self.state.lock().unwrap();
        state.entries.get(&round).map(|(block, _)| block.clone())
    }

    pub fn certificate(&self, round: Round) -> Option<Bundle> {
        let state = self.state.lock().unwrap();
        state.entries.get(&round).map(|(_, cert)| cert.clone())
    }
}

#[async_trait]
impl LedgerReader for MockLedger {
    fn next_round(&self) -> Round {
        self.state.lock().unwrap().next
    }

    async fn wait(&self, round: Round) {
        let mut rx = self.committed_rx.clone();
        // Result ignored deliberately: the sender lives as long as self.
        let _ = rx.wait_for(|committed| *committed >= round).await;
    }

    fn lookup_digest(&self, round: Round) -> anyhow::Result<Digest> {
        if round == 0 {
            return Ok(Digest::default());
        }
        let state = self.state.lock().unwrap();
        state
            .entries
            .get(&round)
            .map(|(block, _)| block.digest())
            .ok_or_else(|| anyhow!("round {} not committed", round))
    }

    fn balance_record(&self, address: Address, _round: Round) -> anyhow::Result<BalanceRecord> {
        match self.balances.get(&address) {
            Some(stake) => Ok(BalanceRecord { address, online_stake: *stake }),
            None => bail!("unknown account {}", address),
        }
    }

    fn circulation(&self, _round: Round) -> anyhow::Result<u64> {
        Ok(self.balances.values().sum())
    }
}

#[async_trait]
impl Ledger for MockLedger {
    async fn ensure_block(&self, block: Block, certificate: Bundle) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let round = block.round;
        if let Some((existing, _)) = state.entries.get(&round) {
            assert_eq!(
                existing.digest(),
                block.digest(),
                "two distinct blocks delivered for round {}",
                round
            );
            return Ok(());
        }
        if round != state.next {
            bail!("delivery for round {} but next is {}", round, state.next);
        }
        state.entries.insert(round, (block, certificate));
        state.next = round + 1;
        let _ = self.committed_tx.send(round);
        Ok(())
    }
}

/// Produces blocks whose content identifies the owner, so convergence tests
/// can check every ledger picked the same proposer's block.
pub struct TestBlockFactory {
    pub owner: usize,
    pub address: Address,
}

#[async_trait]
impl BlockFactory for TestBlockFactory {
    async fn assemble(&self, round: Round) -> anyhow::Result<Block> {
        Ok(Block {
            round,
            proposer: self.address,
            prev: Digest::default(),
            seed: round.wrapping_mul(31).wrapping_add(self.owner as u64),
            payload: Bytes::from(format!("entry-{}-{}", round, self.owner)),
        })
    }
}

pub struct TestBlockValidator;

impl BlockValidator for TestBlockValidator {
    fn validate(&self, _block: &Block) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Key manager over a fixed set of participations.
pub struct SimpleKeyManager(Vec<Participation>);

impl SimpleKeyManager {
    pub fn new(keys: Vec<Participation>) -> SimpleKeyManager {
        SimpleKeyManager(keys)
    }
}

impl KeyManager for SimpleKeyManager {
    fn keys(&self) -> Vec<Participation> {
        self.0.clone()
    }

    fn has_live_keys(&self, from: Round, to: Round) -> bool {
        self.0.iter().any(|p| p.overlaps_interval(from, to))
    }

    fn delete_old_keys(&self, _round: Round) {}
}

struct TestingClockState {
    zeroes: u64,
    fired: Vec<Duration>,
    channels: HashMap<Duration, watch::Sender<bool>>,
}

/// A clock that only advances when the test fires it.
pub struct TestingClock {
    state: Mutex<TestingClockState>,
}

impl TestingClock {
    pub fn new() -> Arc<TestingClock> {
        Arc::new(TestingClock {
            state: Mutex::new(TestingClockState {
                zeroes: 0,
                fired: Vec::new(),
                channels: HashMap::new(),
            }),
        })
    }

    /// Number of times the clock has been rezeroed: one per round or period
    /// entered.
    pub fn zeroes(&self) -> u64 {
        self.state.lock().unwrap().zeroes
    }

    /// Fires every waiter at `offset`, now and in the future, until the
    /// next rezero.
    pub fn fire(&self, offset: Duration) {
        let mut state = self.state.lock().unwrap();
        state.fired.push(offset);
        let sender = state.channels.entry(offset).or_insert_with(|| watch::channel(false).0);
        let _ = sender.send(true);
    }
}

impl Clock for TestingClock {
    fn zero(&self) {
        let mut state = self.state.lock().unwrap();
        state.zeroes += 1;
        state.fired.clear();
        state.channels.clear();
    }

    fn timeout_at(&self, offset: Duration) -> BoxFuture<'static, ()> {
        let mut state = self.state.lock().unwrap();
        let sender = state.channels.entry(offset).or_insert_with(|| watch::channel(false).0);
        let mut rx = sender.subscribe();
        async move {
            if rx.wait_for(|fired| *fired).await.is_err() {
                // The clock was rezeroed; this offset belongs to a dead
                // period and must never fire.
                futures::future::pending::<()>().await;
            }
        }
        .boxed()
    }

    fn encode(&self) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        let fired: Vec<u64> = state.fired.iter().map(|d| d.as_nanos() as u64).collect();
        bcs::to_bytes(&fired).unwrap_or_default()
    }

    fn decode(&self, data: &[u8]) -> anyhow::Result<Arc<dyn Clock>> {
        let fired: Vec<u64> = bcs::from_bytes(data)?;
        let clock = TestingClock::new();
        for nanos in fired {
            clock.fire(Duration::from_nanos(nanos));
        }
        Ok(clock)
    }
}

/// The reference entropy source for deterministic deadline tests: always
/// the midpoint of the u64 range.
pub struct MidpointRandom;

impl RandomSource for MidpointRandom {
    fn u64(&self) -> u64 {
        u64::MAX / 2
    }
}
