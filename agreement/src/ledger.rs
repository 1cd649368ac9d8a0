// Copyright © Palisade Contributors
// SPDX-License-Identifier: Apache-2.0

//! Interfaces the agreement core consumes from the rest of the node: the
//! ledger it extends, and the block factory/validator pair behind the
//! proposal pipeline. The core never writes the ledger except through
//! `ensure_block`.

use async_trait::async_trait;
use palisade_agreement_types::{Address, Block, Bundle, Digest, Membership, Round};

/// One account's voting standing at a round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BalanceRecord {
    pub address: Address,
    /// Stake eligible to vote; zero for offline accounts.
    pub online_stake: u64,
}

#[async_trait]
pub trait LedgerReader: Send + Sync {
    /// The first round not yet committed.
    fn next_round(&self) -> Round;

    /// Resolves once `round` is locally committed. Rounds already
    /// committed resolve immediately.
    async fn wait(&self, round: Round);

    fn lookup_digest(&self, round: Round) -> anyhow::Result<Digest>;

    fn balance_record(&self, address: Address, round: Round) -> anyhow::Result<BalanceRecord>;

    /// Total online stake at `round`.
    fn circulation(&self, round: Round) -> anyhow::Result<u64>;
}

#[async_trait]
pub trait Ledger: LedgerReader {
    /// Delivers a certified block. When this returns Ok, `block.round` is
    /// committed and `wait(block.round)` resolves everywhere.
    async fn ensure_block(&self, block: Block, certificate: Bundle) -> anyhow::Result<()>;
}

/// The ledger's view of one voter, shaped for credential verification.
pub fn membership_of(
    ledger: &dyn LedgerReader,
    address: Address,
    round: Round,
) -> anyhow::Result<Membership> {
    let record = ledger.balance_record(address, round)?;
    Ok(Membership {
        address,
        stake: record.online_stake,
        total_stake: ledger.circulation(round)?,
    })
}

#[async_trait]
pub trait BlockFactory: Send + Sync {
    /// Assembles a candidate block extending the chain at `round`.
    async fn assemble(&self, round: Round) -> anyhow::Result<Block>;
}

pub trait BlockValidator: Send + Sync {
    fn validate(&self, block: &Block) -> anyhow::Result<()>;
}
