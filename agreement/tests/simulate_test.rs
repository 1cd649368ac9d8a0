// Copyright © Palisade Contributors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end runs of the full async service through the `simulate`
//! driver: one service instance holding all five keys certifies rounds by
//! itself, exercising the demux, verifier pool, pseudonode, checkpoint
//! gating, and the crash-restore path.

use palisade_agreement::simulate::simulate;
use palisade_agreement::test_utils::{
    voting_net, MockLedger, SimpleKeyManager, TestBlockFactory, TestBlockValidator,
};
use palisade_agreement::CrashDb;
use palisade_agreement::ledger::LedgerReader;
use std::sync::Arc;
use std::time::Duration;

const ROUND_DEADLINE: Duration = Duration::from_secs(60);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn simulate_five_rounds() {
    let net = voting_net(5);
    let ledger = MockLedger::new(net.balances());
    let keys = (0..5).map(|i| net.participation(i)).collect();
    let dir = tempfile::tempdir().unwrap();
    let db = CrashDb::open(&dir.path().join("simulate_crash.db")).unwrap();

    simulate(
        db,
        5,
        Some(ROUND_DEADLINE),
        ledger.clone(),
        Arc::new(SimpleKeyManager::new(keys)),
        Arc::new(TestBlockFactory { owner: 0, address: net.address(0) }),
        Arc::new(TestBlockValidator),
    )
    .await
    .unwrap();

    assert_eq!(ledger.next_round(), 6);
    for round in 1..6 {
        assert!(ledger.entry(round).is_some(), "round {} missing", round);
        let cert = ledger.certificate(round).unwrap();
        assert_eq!(cert.round, round);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn simulate_resumes_from_crash_state() {
    let net = voting_net(5);
    let ledger = MockLedger::new(net.balances());
    let keys: Vec<_> = (0..5).map(|i| net.participation(i)).collect();
    let factory = || TestBlockFactory { owner: 0, address: net.address(0) };
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("resume_crash.db");

    let db = CrashDb::open(&path).unwrap();
    simulate(
        db,
        3,
        Some(ROUND_DEADLINE),
        ledger.clone(),
        Arc::new(SimpleKeyManager::new(keys.clone())),
        Arc::new(factory()),
        Arc::new(TestBlockValidator),
    )
    .await
    .unwrap();
    assert_eq!(ledger.next_round(), 4);

    // Same database: the second service restores the checkpoint left by
    // the first shutdown and keeps extending the same ledger.
    let db = CrashDb::open(&path).unwrap();
    simulate(
        db,
        2,
        Some(ROUND_DEADLINE),
        ledger.clone(),
        Arc::new(SimpleKeyManager::new(keys)),
        Arc::new(factory()),
        Arc::new(TestBlockValidator),
    )
    .await
    .unwrap();
    assert_eq!(ledger.next_round(), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn simulate_reports_a_stuck_round() {
    let net = voting_net(5);
    let ledger = MockLedger::new(net.balances());
    // One key out of five cannot certify anything.
    let keys = vec![net.participation(0)];
    let dir = tempfile::tempdir().unwrap();
    let db = CrashDb::open(&dir.path().join("stuck_crash.db")).unwrap();

    let err = simulate(
        db,
        1,
        Some(Duration::from_millis(500)),
        ledger.clone(),
        Arc::new(SimpleKeyManager::new(keys)),
        Arc::new(TestBlockFactory { owner: 0, address: net.address(0) }),
        Arc::new(TestBlockValidator),
    )
    .await
    .unwrap_err();

    assert!(err.to_string().contains("round 1"), "error should name the round: {}", err);
    assert_eq!(ledger.next_round(), 1);
}
