// Copyright © Palisade Contributors
// SPDX-License-Identifier: Apache-2.0

//! Service lifecycle and the main event loop.
//!
//! The loop is the only place protocol state is touched: it pulls one event
//! from the demux, hands it to the player, and externalizes the resulting
//! actions. Batches containing an attestation or a delivery are withheld
//! until the persistence loop confirms the checkpoint that produced them;
//! everything else goes out immediately.

use crate::{
    actions::Action,
    cadaver::{Cadaver, CadaverEntry},
    clock::Clock,
    config::LocalConfig,
    demux::Demux,
    events::ExternalEvent,
    keys::KeyManager,
    ledger::{BlockFactory, BlockValidator, Ledger},
    metrics,
    monitor::EventsMonitor,
    network::{MessageStreams, Network},
    params::{ProtocolParams, RandomSource},
    persistence::{self, CrashDb, PersistRequest},
    player::Player,
    pseudonode::Pseudonode,
    verifier::AsyncVerifier,
};
use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, info, warn};

/// Everything the agreement service consumes from the node.
pub struct Parameters {
    pub ledger: Arc<dyn Ledger>,
    pub network: Arc<dyn Network>,
    pub streams: MessageStreams,
    pub key_manager: Arc<dyn KeyManager>,
    pub block_factory: Arc<dyn BlockFactory>,
    pub block_validator: Arc<dyn BlockValidator>,
    pub clock: Arc<dyn Clock>,
    pub random: Arc<dyn RandomSource>,
    pub monitor: Arc<dyn EventsMonitor>,
    pub local: LocalConfig,
    pub crash_db: CrashDb,
    pub protocol: ProtocolParams,
}

/// A running agreement service. Dropping it detaches the tasks; call
/// `shutdown` for an orderly stop.
pub struct Service {
    shutdown_tx: watch::Sender<bool>,
    main: tokio::task::JoinHandle<()>,
    persist: tokio::task::JoinHandle<()>,
}

impl Service {
    /// Opens (or restores from) the crash database, wires the components
    /// together, and starts the event loop.
    pub fn start(parameters: Parameters) -> anyhow::Result<Service> {
        let Parameters {
            ledger,
            network,
            streams,
            key_manager,
            block_factory,
            block_validator,
            clock: clock0,
            random,
            monitor,
            local,
            crash_db,
            protocol,
        } = parameters;

        // Restore from the checkpoint if one is present and intelligible;
        // anything else wipes it and starts the round fresh.
        let restored = match crash_db.restore_raw()? {
            Some(raw) => match persistence::decode(&raw, clock0.as_ref()) {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!(error = %e, "could not restore crash state");
                    crash_db.reset()?;
                    None
                },
            },
            None => None,
        };
        let (clock, player, initial, resumed) = match restored {
            Some(state) => {
                info!(
                    round = state.player.round,
                    period = state.player.period,
                    "restored agreement state from crash database"
                );
                let player = Player::from_snapshot(
                    state.player,
                    state.router.proposals,
                    state.router.votes,
                    protocol,
                );
                (state.clock, player, state.pending, true)
            },
            None => {
                let (player, initial) = Player::new(protocol, ledger.next_round());
                (clock0, player, initial, false)
            },
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let verifier = AsyncVerifier::new(
            ledger.clone(),
            Arc::clone(&block_validator),
            events_tx.clone(),
        );
        let demux = Demux::new(streams, verifier, events_rx, Arc::clone(&monitor));
        let pseudonode = Pseudonode::new(
            key_manager.clone(),
            block_factory,
            ledger.clone(),
            Arc::clone(&network),
            events_tx.clone(),
            Arc::clone(&monitor),
            local.clone(),
        );
        let cadaver = Cadaver::open(local.cadaver_path.clone(), local.cadaver_size_target);

        let (persist_tx, persist_handle) =
            persistence::spawn_persistence_loop(crash_db, ledger.clone(), shutdown_rx.clone());

        let main_loop = MainLoop {
            player,
            demux,
            clock,
            ledger,
            network,
            pseudonode,
            key_manager,
            random,
            persist_tx,
            pending: VecDeque::new(),
            cadaver,
            _events_tx: events_tx,
            shutdown: shutdown_rx,
        };
        let main = tokio::spawn(main_loop.run(initial, resumed));

        Ok(Service { shutdown_tx, main, persist: persist_handle })
    }

    /// Cooperative shutdown: signal, then join every task.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.main.await;
        let _ = self.persist.await;
    }
}

struct MainLoop {
    player: Player,
    demux: Demux,
    clock: Arc<dyn Clock>,
    ledger: Arc<dyn Ledger>,
    network: Arc<dyn Network>,
    pseudonode: Pseudonode,
    key_manager: Arc<dyn KeyManager>,
    random: Arc<dyn RandomSource>,
    persist_tx: mpsc::Sender<PersistRequest>,
    /// Action batches withheld until their checkpoint commits, oldest
    /// first. Checkpoint completions arrive in enqueue order.
    pending: VecDeque<Vec<Action>>,
    cadaver: Cadaver,
    /// Keeps the event channel open for the demux even when the verifier
    /// and pseudonode are idle.
    _events_tx: mpsc::UnboundedSender<ExternalEvent>,
    shutdown: watch::Receiver<bool>,
}

impl MainLoop {
    async fn run(mut self, initial: Vec<Action>, resumed: bool) {
        // A restored node re-emits the actions whose checkpoint already
        // committed before the crash; a fresh one starts its first round
        // through the ordinary gated path.
        let startup = if resumed {
            self.execute(initial).await
        } else {
            self.dispatch(initial).await
        };
        if startup.is_break() {
            return;
        }

        loop {
            let event = tokio::select! {
                biased;
                _ = self.shutdown.changed() => return,
                event = self.demux.next(
                    self.clock.as_ref(),
                    self.ledger.as_ref(),
                    self.player.round(),
                    self.player.period(),
                    self.player.deadline(),
                    self.player.fast_deadline(),
                ) => event,
            };

            let checkpoint = match &event {
                ExternalEvent::Checkpointed { result, .. } => Some(result.clone()),
                _ => None,
            };

            let actions = self.player.handle(event.clone(), self.random.as_ref());
            self.cadaver.record(&CadaverEntry {
                round: self.player.round(),
                period: self.player.period(),
                step: self.player.step(),
                event: event.kind().to_string(),
                actions: actions.iter().map(Action::action_type).collect(),
            });

            if let Some(result) = checkpoint {
                let flow = match result {
                    Ok(()) => match self.pending.pop_front() {
                        Some(batch) => self.execute(batch).await,
                        None => ControlFlow::Continue(()),
                    },
                    // Withhold and try the write again; the player keeps
                    // consuming inputs meanwhile but attests nothing new.
                    Err(_) => self.requeue_front().await,
                };
                if flow.is_break() {
                    return;
                }
            }

            if self.dispatch(actions).await.is_break() {
                return;
            }
        }
    }

    /// Routes a batch. Clock, relay, and network actions go out right
    /// away; attestations and deliveries wait behind a checkpoint of the
    /// state that produced them.
    async fn dispatch(&mut self, actions: Vec<Action>) -> ControlFlow<()> {
        if actions.is_empty() {
            return ControlFlow::Continue(());
        }
        let (gated, immediate): (Vec<Action>, Vec<Action>) =
            actions.into_iter().partition(Action::persistent);
        if self.execute(immediate).await.is_break() {
            return ControlFlow::Break(());
        }
        if gated.is_empty() {
            return ControlFlow::Continue(());
        }
        if self.enqueue_checkpoint(&gated).await.is_break() {
            return ControlFlow::Break(());
        }
        self.pending.push_back(gated);
        ControlFlow::Continue(())
    }

    async fn enqueue_checkpoint(&mut self, actions: &[Action]) -> ControlFlow<()> {
        let raw = match persistence::encode(self.clock.as_ref(), &self.player, actions) {
            Ok(raw) => raw,
            Err(e) => {
                // State that cannot be encoded cannot be protected; flag it
                // and keep the node alive.
                error!(error = %e, "could not encode state for checkpoint");
                return ControlFlow::Continue(());
            },
        };
        let (events_tx, events_rx) = oneshot::channel();
        self.demux.prioritize(events_rx);
        let request = PersistRequest {
            round: self.player.round(),
            period: self.player.period(),
            step: self.player.step(),
            raw,
            clock: Arc::clone(&self.clock),
            events: events_tx,
        };
        tokio::select! {
            biased;
            _ = self.shutdown.changed() => ControlFlow::Break(()),
            sent = self.persist_tx.send(request) => {
                if sent.is_err() {
                    error!("persistence loop is gone; attestations withheld");
                }
                ControlFlow::Continue(())
            },
        }
    }

    /// A checkpoint write failed: re-encode the oldest withheld batch and
    /// put it back in line.
    async fn requeue_front(&mut self) -> ControlFlow<()> {
        let Some(batch) = self.pending.pop_front() else {
            return ControlFlow::Continue(());
        };
        if self.enqueue_checkpoint(&batch).await.is_break() {
            return ControlFlow::Break(());
        }
        self.pending.push_front(batch);
        ControlFlow::Continue(())
    }

    async fn execute(&mut self, actions: Vec<Action>) -> ControlFlow<()> {
        for action in actions {
            match action {
                Action::Rezero { .. } => self.clock.zero(),
                Action::Assemble { round, period } => {
                    self.pseudonode.make_proposals(round, period);
                },
                Action::Repropose { round, period, value } => {
                    self.pseudonode.make_reproposal(round, period, value);
                },
                Action::Attest { round, period, step, proposal } => {
                    self.pseudonode.make_votes(round, period, step, proposal);
                },
                Action::Broadcast { tag, data } => {
                    if let Err(e) = self.network.broadcast(tag, data) {
                        info!(%tag, error = %e, "could not broadcast");
                    }
                },
                Action::Relay { source, tag, data } => {
                    if let Err(e) = self.network.relay(source, tag, data) {
                        info!(%tag, error = %e, "could not relay");
                    }
                },
                Action::Disconnect { peer } => self.network.disconnect(peer),
                Action::Deliver { proposal, certificate } => {
                    let round = proposal.block.round;
                    match self.ledger.ensure_block(proposal.block, certificate).await {
                        Ok(()) => {
                            metrics::ROUNDS_COMPLETED.inc();
                            self.key_manager.delete_old_keys(round);
                            info!(round, "delivered certified block");
                        },
                        Err(e) => {
                            // Unrecoverable: without the delivery the round
                            // cannot conclude. Stop and rely on restart +
                            // restore.
                            error!(round, error = %e, "ledger refused delivery; stopping");
                            return ControlFlow::Break(());
                        },
                    }
                },
            }
        }
        ControlFlow::Continue(())
    }
}
