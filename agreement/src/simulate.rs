// Copyright © Palisade Contributors
// SPDX-License-Identifier: Apache-2.0

//! A single-process round driver for development and tests.
//!
//! `simulate` runs one agreement service whose key manager holds enough
//! stake to certify alone, against a network that swallows everything. An
//! instant clock short-circuits the filter timeout the moment the
//! pseudonode and demux go quiet, so rounds conclude as fast as the event
//! loop can turn them over; every other timeout never fires. If a round
//! stalls anyway, the per-round deadline converts the hang into an error
//! naming the round.

use crate::{
    clock::Clock,
    config::LocalConfig,
    keys::KeyManager,
    ledger::{BlockFactory, BlockValidator, Ledger},
    monitor::{EventsMonitor, DEMUX_QUEUE, PSEUDONODE_QUEUE},
    network::{message_channels, MessageSinks, Network},
    params::{OsRandomSource, ProtocolParams},
    persistence::CrashDb,
    service::{Parameters, Service},
};
use anyhow::bail;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use palisade_agreement_types::{PeerHandle, Tag};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Runs `rounds` rounds of agreement against the given collaborators.
///
/// The key manager must hold keys for a cert-quorum of the stake. With a
/// nonzero `round_deadline`, an error is returned if any round does not
/// conclude in time.
pub async fn simulate(
    crash_db: CrashDb,
    rounds: u64,
    round_deadline: Option<Duration>,
    ledger: Arc<dyn Ledger>,
    key_manager: Arc<dyn KeyManager>,
    block_factory: Arc<dyn BlockFactory>,
    block_validator: Arc<dyn BlockValidator>,
) -> anyhow::Result<()> {
    let protocol = ProtocolParams::default();
    let clock = InstantClock::new(protocol.filter_timeout());
    let (sinks, streams) = message_channels();

    let service = Service::start(Parameters {
        ledger: ledger.clone(),
        network: Arc::new(Blackhole { _sinks: sinks }),
        streams,
        key_manager,
        block_factory,
        block_validator,
        clock: clock.clone(),
        random: Arc::new(OsRandomSource),
        monitor: clock.clone(),
        local: LocalConfig {
            cadaver_size_target: 200 * 1024,
            cadaver_path: None,
            enable_assemble_stats: false,
        },
        crash_db,
        protocol,
    })?;

    let start = ledger.next_round();
    let stop = start + rounds;
    let mut failed = None;
    for round in start..stop {
        let deadline = async {
            match round_deadline {
                Some(deadline) => tokio::time::sleep(deadline).await,
                None => futures::future::pending().await,
            }
        };
        tokio::select! {
            _ = ledger.wait(round) => {},
            _ = deadline => {
                failed = Some(round);
                break;
            },
        }
    }

    service.shutdown().await;
    if let Some(round) = failed {
        bail!(
            "simulate: round {} failed to complete by the deadline ({:?})",
            round,
            round_deadline.unwrap_or_default()
        );
    }
    Ok(())
}

/// A transport that accepts everything and delivers nothing.
struct Blackhole {
    _sinks: MessageSinks,
}

impl Network for Blackhole {
    fn broadcast(&self, _tag: Tag, _data: Bytes) -> anyhow::Result<()> {
        Ok(())
    }

    fn relay(&self, _source: Option<PeerHandle>, _tag: Tag, _data: Bytes) -> anyhow::Result<()> {
        Ok(())
    }

    fn disconnect(&self, _peer: PeerHandle) {}
}

struct InstantState {
    queues: HashMap<&'static str, usize>,
    /// Set once the pseudonode has reported work since the last rezero;
    /// the filter must not fire before the round's own proposals exist.
    saw_pseudonode_work: bool,
    zeroes: u64,
}

impl InstantState {
    fn quiet(&self) -> bool {
        self.saw_pseudonode_work
            && self.queues.get(PSEUDONODE_QUEUE).copied().unwrap_or(0) == 0
            && self.queues.get(DEMUX_QUEUE).copied().unwrap_or(0) == 0
    }
}

struct InstantInner {
    state: Mutex<InstantState>,
    bump_tx: watch::Sender<u64>,
    bump_rx: watch::Receiver<u64>,
}

impl InstantInner {
    fn bump(&self) {
        self.bump_tx.send_modify(|n| *n += 1);
    }
}

/// Fires the filter timeout as soon as this node's own proposals have been
/// injected and drained; every other offset waits forever.
pub struct InstantClock {
    filter: Duration,
    inner: Arc<InstantInner>,
}

impl InstantClock {
    pub fn new(filter: Duration) -> Arc<InstantClock> {
        let (bump_tx, bump_rx) = watch::channel(0);
        Arc::new(InstantClock {
            filter,
            inner: Arc::new(InstantInner {
                state: Mutex::new(InstantState {
                    queues: HashMap::new(),
                    saw_pseudonode_work: false,
                    zeroes: 0,
                }),
                bump_tx,
                bump_rx,
            }),
        })
    }

    pub fn zeroes(&self) -> u64 {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner()).zeroes
    }
}

impl EventsMonitor for InstantClock {
    fn update_queue(&self, name: &'static str, len: usize) {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if name == PSEUDONODE_QUEUE && len > 0 {
            state.saw_pseudonode_work = true;
        }
        state.queues.insert(name, len);
        drop(state);
        self.inner.bump();
    }
}

impl Clock for InstantClock {
    fn zero(&self) {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        state.zeroes += 1;
        state.saw_pseudonode_work = false;
        drop(state);
        self.inner.bump();
    }

    fn timeout_at(&self, offset: Duration) -> BoxFuture<'static, ()> {
        if offset != self.filter {
            return futures::future::pending().boxed();
        }
        let inner = Arc::clone(&self.inner);
        let mut bump = self.inner.bump_rx.clone();
        async move {
            loop {
                if inner.state.lock().unwrap_or_else(|e| e.into_inner()).quiet() {
                    return;
                }
                if bump.changed().await.is_err() {
                    futures::future::pending::<()>().await;
                }
            }
        }
        .boxed()
    }

    fn encode(&self) -> Vec<u8> {
        Vec::new()
    }

    fn decode(&self, _data: &[u8]) -> anyhow::Result<Arc<dyn Clock>> {
        // A restored simulation keeps pacing off the same live state.
        Ok(Arc::new(InstantClock { filter: self.filter, inner: Arc::clone(&self.inner) }))
    }
}
