// Copyright © Palisade Contributors
// SPDX-License-Identifier: Apache-2.0

//! The Palisade agreement service.
//!
//! A network of participants repeatedly agrees on the next block extending
//! a shared ledger. Each node runs one [`Service`], which owns a
//! single-threaded protocol state machine (the [`player::Player`]) fed by a
//! demultiplexer over the gossip transport, a parallel cryptographic
//! verification pool, a loopback pseudonode for the node's own traffic, and
//! an asynchronous persistence loop that checkpoints protocol state before
//! any attestation or delivery leaves the node.
//!
//! The ledger, transport, block factory/validator, and key storage are
//! collaborators behind traits; see [`ledger`], [`network`], and [`keys`].

pub mod actions;
pub mod cadaver;
pub mod clock;
pub mod config;
pub mod demux;
pub mod events;
pub mod keys;
pub mod ledger;
pub mod metrics;
pub mod monitor;
pub mod network;
pub mod params;
pub mod persistence;
pub mod player;
pub mod proposals;
pub mod pseudonode;
pub mod service;
pub mod simulate;
pub mod verifier;
pub mod votes;

#[cfg(any(test, feature = "testing"))]
pub mod test_utils;

pub use clock::{Clock, MonotonicClock};
pub use config::LocalConfig;
pub use params::{OsRandomSource, ProtocolParams, RandomSource};
pub use persistence::CrashDb;
pub use service::{Parameters, Service};
