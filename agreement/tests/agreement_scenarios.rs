// Copyright © Palisade Contributors
// SPDX-License-Identifier: Apache-2.0

//! Multi-node protocol scenarios: the synchronous fast path, partition
//! recovery in both directions, delayed certificates, slow payloads, and a
//! long run of failed periods. Each drives five player cores over the
//! deterministic switchboard and checks that every ledger advances in
//! lockstep onto identical blocks.

mod common;

use common::Switchboard;

#[test]
fn synchronous_five_nodes_five_rounds() {
    let mut sb = Switchboard::start(5);
    let mut zeroes = sb.expect_new_period(0);

    for _ in 0..5 {
        zeroes = sb.run_round(zeroes);
    }
    sb.sanity_check(1, 5);
}

#[test]
fn synchronous_two_nodes_long_run() {
    let mut sb = Switchboard::start(2);
    let mut zeroes = sb.expect_new_period(0);

    for _ in 0..20 {
        zeroes = sb.run_round(zeroes);
    }
    sb.sanity_check(1, 20);
}

#[test]
fn fast_recovery_down_early() {
    let mut sb = Switchboard::start(5);
    let mut zeroes = sb.expect_new_period(0);

    for _ in 0..2 {
        zeroes = sb.run_round(zeroes);
    }

    // Starve both the soft step and the slow next series; only the
    // recovery votes can conclude the period, into bottom.
    sb.drop_all_soft_votes();
    sb.drop_all_slow_next_votes();
    sb.trigger_global(sb.filter_timeout());
    zeroes = sb.expect_no_new_period(zeroes);

    sb.trigger_global(sb.deadline_timeout());
    zeroes = sb.expect_no_new_period(zeroes);

    // Zero-offset firing arms the recovery timer without voting.
    sb.trigger_global(sb.recovery_arm());
    zeroes = sb.expect_no_new_period(zeroes);

    sb.trigger_global(sb.first_recovery());
    zeroes = sb.expect_new_period(zeroes);
    for node in 0..5 {
        assert_eq!(sb.period(node), 1);
    }

    // Period 1 terminates the round once the network heals.
    sb.repair_all();
    sb.trigger_global(sb.filter_timeout());
    zeroes = sb.expect_new_period(zeroes);

    for _ in 0..2 {
        zeroes = sb.run_round(zeroes);
    }
    sb.sanity_check(1, 5);
}

#[test]
fn fast_recovery_down_miss() {
    let mut sb = Switchboard::start(5);
    let mut zeroes = sb.expect_new_period(0);

    for _ in 0..2 {
        zeroes = sb.run_round(zeroes);
    }

    // Fail every step outright.
    sb.drop_all_votes();
    sb.trigger_global(sb.filter_timeout());
    zeroes = sb.expect_no_new_period(zeroes);
    sb.trigger_global(sb.deadline_timeout());
    zeroes = sb.expect_no_new_period(zeroes);
    sb.trigger_global(sb.recovery_arm());
    zeroes = sb.expect_no_new_period(zeroes);

    // Four nodes fire while the network still eats their votes.
    sb.trigger_nodes(&[0, 1, 2, 3], sb.first_recovery());
    zeroes = sb.expect_no_new_period(zeroes);

    // The last node fires after the heal; one voter is not a quorum.
    sb.repair_all();
    sb.trigger_nodes(&[4], sb.first_recovery());
    zeroes = sb.expect_no_new_period(zeroes);

    // The next firing re-issues everyone's down votes; now they land.
    sb.trigger_global(sb.second_recovery());
    zeroes = sb.expect_new_period(zeroes);

    sb.repair_all();
    sb.trigger_global(sb.filter_timeout());
    zeroes = sb.expect_new_period(zeroes);

    for _ in 0..2 {
        zeroes = sb.run_round(zeroes);
    }
    sb.sanity_check(1, 5);
}

#[test]
fn fast_recovery_to_value() {
    let mut sb = Switchboard::start(5);
    let mut zeroes = sb.expect_new_period(0);

    for _ in 0..2 {
        zeroes = sb.run_round(zeroes);
    }

    // Capture the cert votes; every node still stages the value off the
    // soft quorum, so recovery re-proposes it via redo votes.
    sb.pocket_cert_votes();
    sb.drop_all_slow_next_votes();
    sb.trigger_global(sb.filter_timeout());
    zeroes = sb.expect_no_new_period(zeroes);

    let pocketed = sb.take_pocket();
    let expected = pocketed[0].vote().unwrap().raw.proposal;
    for p in &pocketed {
        assert_eq!(p.vote().unwrap().raw.proposal, expected, "split cert votes");
    }

    sb.trigger_global(sb.deadline_timeout());
    zeroes = sb.expect_no_new_period(zeroes);
    sb.trigger_global(sb.recovery_arm());
    zeroes = sb.expect_no_new_period(zeroes);

    sb.drop_all_votes();
    sb.trigger_nodes(&[0, 1, 2, 3], sb.first_recovery());
    zeroes = sb.expect_no_new_period(zeroes);

    sb.repair_all();
    sb.trigger_nodes(&[4], sb.first_recovery());
    zeroes = sb.expect_no_new_period(zeroes);

    sb.trigger_global(sb.second_recovery());
    zeroes = sb.expect_new_period(zeroes);

    // Period 1 starts from the recovered value and commits it.
    sb.trigger_global(sb.filter_timeout());
    zeroes = sb.expect_new_period(zeroes);
    for node in 0..5 {
        let last = sb.next_round(node) - 1;
        assert_eq!(sb.digest(node, last), expected.block_digest, "node {} diverged", node);
    }

    for _ in 0..2 {
        zeroes = sb.run_round(zeroes);
    }
    sb.sanity_check(1, 5);
}

#[test]
fn late_cert_votes_terminate_the_next_period() {
    let mut sb = Switchboard::start(5);
    let mut zeroes = sb.expect_new_period(0);

    for _ in 0..2 {
        zeroes = sb.run_round(zeroes);
    }

    // Delay all cert votes so period 0 cannot conclude.
    sb.pocket_cert_votes();
    sb.trigger_global(sb.filter_timeout());
    zeroes = sb.expect_no_new_period(zeroes);
    let pocketed = sb.take_pocket();
    sb.repair_all();

    // Having cert-voted, everyone next-votes the value into period 1.
    sb.trigger_global(sb.deadline_timeout());
    zeroes = sb.expect_new_period(zeroes);
    for node in 0..5 {
        assert_eq!(sb.period(node), 1);
    }

    // The pocketed period-0 certificate still commits the round.
    sb.release(pocketed);
    zeroes = sb.expect_new_period(zeroes);

    for _ in 0..2 {
        zeroes = sb.run_round(zeroes);
    }
    sb.sanity_check(1, 5);
}

#[test]
fn recover_global_starting_value() {
    let mut sb = Switchboard::start(5);
    let mut zeroes = sb.expect_new_period(0);

    for _ in 0..2 {
        zeroes = sb.run_round(zeroes);
    }

    // Period 0: capture the cert votes, remember the value.
    sb.pocket_cert_votes();
    sb.trigger_global(sb.filter_timeout());
    zeroes = sb.expect_no_new_period(zeroes);
    let pocketed = sb.take_pocket();
    let expected = pocketed[0].vote().unwrap().raw.proposal;
    for p in &pocketed {
        assert_eq!(p.vote().unwrap().raw.proposal, expected);
    }

    sb.trigger_global(sb.deadline_timeout());
    zeroes = sb.expect_new_period(zeroes);

    // Period 1 re-proposes the same value; capture its cert votes too and
    // check the starting value survived the period change.
    sb.pocket_cert_votes();
    sb.trigger_global(sb.filter_timeout());
    zeroes = sb.expect_no_new_period(zeroes);
    let pocketed = sb.take_pocket();
    for p in &pocketed {
        assert_eq!(
            p.vote().unwrap().raw.proposal.block_digest,
            expected.block_digest,
            "starting value was not preserved"
        );
    }

    sb.trigger_global(sb.deadline_timeout());
    zeroes = sb.expect_new_period(zeroes);

    // Period 2 concludes undisturbed on that same block.
    sb.repair_all();
    sb.trigger_global(sb.filter_timeout());
    zeroes = sb.expect_new_period(zeroes);
    for node in 0..5 {
        let last = sb.next_round(node) - 1;
        assert_eq!(sb.digest(node, last), expected.block_digest);
    }

    for _ in 0..2 {
        zeroes = sb.run_round(zeroes);
    }
    sb.sanity_check(1, 5);
}

#[test]
fn slow_payloads_released_before_the_deadline() {
    let mut sb = Switchboard::start(5);
    let mut zeroes = sb.expect_new_period(0);

    for _ in 0..2 {
        zeroes = sb.run_round(zeroes);
    }

    // Pocketing starts now, so it affects the next round's payloads.
    sb.pocket_payloads();
    zeroes = sb.run_round(zeroes);

    // Values circulate but payloads do not: soft quorums form, cert votes
    // cannot.
    sb.trigger_global(sb.filter_timeout());
    zeroes = sb.expect_no_new_period(zeroes);

    // Releasing the payloads completes the round without another timeout.
    let pocketed = sb.take_pocket();
    sb.repair_all();
    sb.release(pocketed);
    zeroes = sb.expect_new_period(zeroes);

    for _ in 0..2 {
        zeroes = sb.run_round(zeroes);
    }
    sb.sanity_check(1, 6);
}

#[test]
fn slow_payloads_released_after_the_deadline() {
    let mut sb = Switchboard::start(5);
    let mut zeroes = sb.expect_new_period(0);

    for _ in 0..2 {
        zeroes = sb.run_round(zeroes);
    }

    sb.pocket_payloads();
    zeroes = sb.run_round(zeroes);

    // Without payloads the round misses its deadline and drops to
    // period 1 on bottom.
    sb.trigger_global(sb.filter_timeout());
    zeroes = sb.expect_no_new_period(zeroes);
    sb.trigger_global(sb.deadline_timeout());
    zeroes = sb.expect_new_period(zeroes);

    // The old payloads alone change nothing in period 1.
    let pocketed = sb.take_pocket();
    sb.repair_all();
    sb.release(pocketed);
    zeroes = sb.expect_no_new_period(zeroes);

    // Period 1's own exchange concludes the round.
    sb.trigger_global(sb.filter_timeout());
    zeroes = sb.expect_new_period(zeroes);

    for _ in 0..2 {
        zeroes = sb.run_round(zeroes);
    }
    sb.sanity_check(1, 6);
}

#[test]
fn sixty_failed_periods_then_termination() {
    let mut sb = Switchboard::start(5);
    let mut zeroes = sb.expect_new_period(0);

    for _ in 0..2 {
        zeroes = sb.run_round(zeroes);
    }

    // Split 3/2 during every filter step: neither side can reach a soft
    // quorum, and each deadline pushes everyone into the next period.
    for p in 0..60u64 {
        sb.partition(&[0, 1, 2]);
        sb.trigger_global(sb.filter_timeout());
        zeroes = sb.expect_no_new_period(zeroes);

        sb.repair_all();
        sb.trigger_global(sb.deadline_timeout());
        zeroes = sb.expect_new_period(zeroes);
        assert_eq!(zeroes, 4 + p, "period count drifted");
    }
    for node in 0..5 {
        assert_eq!(sb.period(node), 60);
    }

    sb.trigger_global(sb.filter_timeout());
    zeroes = sb.expect_new_period(zeroes);

    for _ in 0..2 {
        zeroes = sb.run_round(zeroes);
    }
    sb.sanity_check(1, 5);
}
