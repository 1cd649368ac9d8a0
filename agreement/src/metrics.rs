// Copyright © Palisade Contributors
// SPDX-License-Identifier: Apache-2.0

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter,
    IntGauge,
};

pub static MESSAGES_HANDLED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "palisade_agreement_messages_handled",
        "Messages accepted into the per-tag inbound queues"
    )
    .unwrap()
});

pub static MESSAGES_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "palisade_agreement_messages_dropped",
        "Messages dropped because an inbound queue was full"
    )
    .unwrap()
});

pub static MESSAGES_STALE: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "palisade_agreement_messages_stale",
        "Messages dropped because their round or period was superseded"
    )
    .unwrap()
});

pub static MESSAGES_PARKED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "palisade_agreement_messages_parked",
        "Messages held for a future round or period"
    )
    .unwrap()
});

pub static VERIFICATIONS_REJECTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "palisade_agreement_verifications_rejected",
        "Votes, bundles, and payloads that failed cryptographic validation"
    )
    .unwrap()
});

pub static ROUNDS_COMPLETED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "palisade_agreement_rounds_completed",
        "Rounds this node delivered a certified block for"
    )
    .unwrap()
});

pub static PERIODS_STARTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "palisade_agreement_periods_started",
        "Recovery periods entered past the fast path"
    )
    .unwrap()
});

pub static CURRENT_PERIOD: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "palisade_agreement_current_period",
        "Period the player is currently in"
    )
    .unwrap()
});

pub static ASSEMBLE_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "palisade_agreement_assemble_seconds",
        "Time spent assembling a proposal block"
    )
    .unwrap()
});
