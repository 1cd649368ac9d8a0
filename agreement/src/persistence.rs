// Copyright © Palisade Contributors
// SPDX-License-Identifier: Apache-2.0

//! Crash persistence.
//!
//! The whole protocol state (clock, router, player core, and the actions
//! not yet externalized) serializes into one blob held in the single-row
//! `Service` table. The async loop writes it after every round-advancing
//! transition; the service withholds attestations and deliveries until the
//! matching `Checkpointed` event comes back, so a crash can never replay
//! this node into contradicting itself.

use crate::{
    actions::{Action, ActionType},
    clock::Clock,
    events::ExternalEvent,
    ledger::LedgerReader,
    player::{Player, PlayerSnapshot},
    proposals::ProposalStore,
    votes::VoteTracker,
};
use anyhow::{bail, Context};
use palisade_agreement_types::{Period, Round, Step};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, info, warn};

/// Bumped whenever the serialized layout changes; a mismatch on restore
/// wipes the checkpoint and starts fresh.
const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// Attempts per checkpoint before reporting failure to the player.
const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(100);

/// The vote tracker and proposal store, serialized side by side.
#[derive(Clone, Serialize, Deserialize)]
pub struct RouterState {
    pub proposals: ProposalStore,
    pub votes: VoteTracker,
}

#[derive(Serialize, Deserialize)]
struct DiskState {
    version: u32,
    clock: Vec<u8>,
    router: Vec<u8>,
    player: Vec<u8>,
    action_types: Vec<ActionType>,
    actions: Vec<Vec<u8>>,
}

/// Serializes the full protocol state plus the pending actions.
pub fn encode(
    clock: &dyn Clock,
    player: &Player,
    pending: &[Action],
) -> anyhow::Result<Vec<u8>> {
    let router = RouterState {
        proposals: player.proposal_store().clone(),
        votes: player.vote_tracker().clone(),
    };
    let mut action_types = Vec::with_capacity(pending.len());
    let mut actions = Vec::with_capacity(pending.len());
    for action in pending {
        action_types.push(action.action_type());
        actions.push(bcs::to_bytes(action).context("could not encode pending action")?);
    }
    let state = DiskState {
        version: CHECKPOINT_SCHEMA_VERSION,
        clock: clock.encode(),
        router: bcs::to_bytes(&router).context("could not encode router")?,
        player: bcs::to_bytes(&player.snapshot()).context("could not encode player")?,
        action_types,
        actions,
    };
    bcs::to_bytes(&state).context("could not encode disk state")
}

pub struct DecodedState {
    pub clock: Arc<dyn Clock>,
    pub player: PlayerSnapshot,
    pub router: RouterState,
    pub pending: Vec<Action>,
}

/// Reconstructs protocol state from a checkpoint blob. `clock0` picks the
/// concrete clock implementation to decode into.
pub fn decode(raw: &[u8], clock0: &dyn Clock) -> anyhow::Result<DecodedState> {
    let state: DiskState =
        bcs::from_bytes(raw).context("checkpoint blob did not decode")?;
    if state.version != CHECKPOINT_SCHEMA_VERSION {
        bail!(
            "checkpoint schema {} does not match {}",
            state.version,
            CHECKPOINT_SCHEMA_VERSION
        );
    }
    if state.action_types.len() != state.actions.len() {
        bail!("checkpoint action tags do not line up with payloads");
    }

    let clock = clock0.decode(&state.clock)?;
    let router: RouterState =
        bcs::from_bytes(&state.router).context("router state did not decode")?;
    let player: PlayerSnapshot =
        bcs::from_bytes(&state.player).context("player state did not decode")?;

    let mut pending = Vec::with_capacity(state.actions.len());
    for (tag, raw_action) in state.action_types.iter().zip(&state.actions) {
        let action: Action =
            bcs::from_bytes(raw_action).context("pending action did not decode")?;
        if action.action_type() != *tag {
            bail!(
                "pending action decoded as {:?} but was written as {:?}",
                action.action_type(),
                tag
            );
        }
        pending.push(action);
    }
    Ok(DecodedState { clock, player, router, pending })
}

/// The single-row crash database. Only the persistence task touches it
/// after the one restore read at startup.
pub struct CrashDb {
    conn: std::sync::Mutex<rusqlite::Connection>,
}

impl CrashDb {
    pub fn open(path: &Path) -> anyhow::Result<CrashDb> {
        let conn = rusqlite::Connection::open(path)
            .with_context(|| format!("could not open crash db at {}", path.display()))?;
        Self::install(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<CrashDb> {
        Self::install(rusqlite::Connection::open_in_memory()?)
    }

    fn install(conn: rusqlite::Connection) -> anyhow::Result<CrashDb> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS Service (rowid INTEGER PRIMARY KEY CHECK (rowid = 1), data BLOB)",
        )
        .context("could not install crash schema")?;
        Ok(CrashDb { conn: std::sync::Mutex::new(conn) })
    }

    /// Atomically replaces the checkpoint.
    pub fn persist(&self, raw: &[u8]) -> anyhow::Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                "INSERT OR REPLACE INTO Service (rowid, data) VALUES (1, ?1)",
                rusqlite::params![raw],
            )
            .context("could not write checkpoint")?;
        Ok(())
    }

    /// Reads the checkpoint without interpreting it. Anything other than
    /// exactly one row wipes the table and reads as no crash state.
    pub fn restore_raw(&self) -> anyhow::Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().unwrap();
        let rows: i64 =
            conn.query_row("SELECT COUNT(*) FROM Service", [], |row| row.get(0))?;
        if rows != 1 {
            if rows != 0 {
                warn!(rows, "unexpected crash state shape; resetting");
                drop(conn);
                self.reset()?;
            }
            return Ok(None);
        }
        let raw: Vec<u8> =
            conn.query_row("SELECT data FROM Service", [], |row| row.get(0))?;
        Ok(Some(raw))
    }

    /// Deletes the recovery state.
    pub fn reset(&self) -> anyhow::Result<()> {
        info!("resetting crash state");
        self.conn
            .lock()
            .unwrap()
            .execute("DELETE FROM Service", [])
            .context("could not clear Service table")?;
        Ok(())
    }
}

/// One checkpoint request. The `events` channel is handed to the demux so
/// the completion outranks ordinary traffic.
pub struct PersistRequest {
    pub round: Round,
    pub period: Period,
    pub step: Step,
    pub raw: Vec<u8>,
    pub clock: Arc<dyn Clock>,
    pub events: oneshot::Sender<ExternalEvent>,
}

/// Spawns the persistence task. The inbox holds one slot, so a second
/// checkpoint naturally waits for the first.
pub fn spawn_persistence_loop(
    db: CrashDb,
    ledger: Arc<dyn LedgerReader>,
    mut shutdown: watch::Receiver<bool>,
) -> (mpsc::Sender<PersistRequest>, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<PersistRequest>(1);
    let handle = tokio::spawn(async move {
        loop {
            let request = tokio::select! {
                _ = shutdown.changed() => return,
                request = rx.recv() => match request {
                    Some(request) => request,
                    None => return,
                },
            };

            // The ledger must have round R-1 on disk before the checkpoint
            // claiming to work on R lands.
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ledger.wait(request.round.saturating_sub(1)) => {},
            }

            // Decode our own blob before writing it; producing a
            // checkpoint we cannot read back is the one corruption we can
            // catch early.
            if let Err(e) = decode(&request.raw, request.clock.as_ref()) {
                error!(error = %e, "could not decode own encoded disk state");
            }

            let result = persist_with_retry(&db, &request.raw).await;
            if let Err(e) = &result {
                error!(round = request.round, error = %e, "checkpoint write failed");
            }
            let event = ExternalEvent::Checkpointed {
                round: request.round,
                period: request.period,
                step: request.step,
                result: result.map_err(|e| e.to_string()),
            };
            let _ = request.events.send(event);
        }
    });
    (tx, handle)
}

async fn persist_with_retry(db: &CrashDb, raw: &[u8]) -> anyhow::Result<()> {
    let mut last = None;
    for attempt in 0..PERSIST_ATTEMPTS {
        match db.persist(raw) {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(attempt, error = %e, "checkpoint write attempt failed");
                last = Some(e);
            },
        }
        tokio::time::sleep(PERSIST_RETRY_DELAY).await;
    }
    Err(last.unwrap_or_else(|| anyhow::anyhow!("checkpoint write failed")))
}
