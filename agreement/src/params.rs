// Copyright © Palisade Contributors
// SPDX-License-Identifier: Apache-2.0

//! Protocol timing parameters.
//!
//! All offsets are relative to the clock zero of the current round or
//! period. The next-vote series uses widening ranges whose lower bound is
//! the previous range's upper bound, so two next deadlines can never land
//! in each other's window.

use std::time::Duration;

/// Injectable entropy for deadline jitter.
pub trait RandomSource: Send + Sync {
    fn u64(&self) -> u64;
}

/// Entropy from the operating system.
pub struct OsRandomSource;

impl RandomSource for OsRandomSource {
    fn u64(&self) -> u64 {
        use rand::RngCore;
        rand::rngs::OsRng.next_u64()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ProtocolParams {
    /// Expected one-hop message latency bound.
    pub small_lambda: Duration,
    /// Expected time to assemble and distribute a block.
    pub big_lambda: Duration,
    /// Re-fire interval of the fast partition recovery timer.
    pub fast_recovery_lambda: Duration,
}

impl Default for ProtocolParams {
    fn default() -> Self {
        ProtocolParams {
            small_lambda: Duration::from_secs(2),
            big_lambda: Duration::from_secs(15),
            fast_recovery_lambda: Duration::from_secs(300),
        }
    }
}

impl ProtocolParams {
    /// Offset at which the propose step closes and the soft vote is cast.
    pub fn filter_timeout(&self) -> Duration {
        2 * self.small_lambda
    }

    /// Offset of the first next vote.
    pub fn deadline_timeout(&self) -> Duration {
        self.big_lambda + self.small_lambda
    }

    /// Jitter range for the k-th next vote, relative to the deadline.
    /// `next_range(k + 1).0 == next_range(k).1` for every k ≥ 1 until the
    /// ranges saturate the nanosecond scale, far beyond any live period.
    pub fn next_range(&self, k: u64) -> (Duration, Duration) {
        if k == 0 {
            return (Duration::ZERO, Duration::ZERO);
        }
        let base = self.small_lambda.as_nanos() as u64;
        let lower = if k - 1 >= 63 {
            u64::MAX
        } else {
            base.saturating_mul(1u64 << (k - 1))
        };
        let upper = lower.saturating_mul(2);
        (Duration::from_nanos(lower), Duration::from_nanos(upper))
    }

    /// Absolute offset at which the k-th next vote fires.
    pub fn next_deadline(&self, k: u64, random: &dyn RandomSource) -> Duration {
        let (lower, upper) = self.next_range(k);
        let jitter = if upper > lower {
            Duration::from_nanos(random.u64() % (upper - lower).as_nanos() as u64)
        } else {
            Duration::ZERO
        };
        self.deadline_timeout() + lower + jitter
    }

    /// Offset of the first recovery firing, drawn from [0, 2·λ_f).
    pub fn first_recovery_deadline(&self, random: &dyn RandomSource) -> Duration {
        let span = (2 * self.fast_recovery_lambda).as_nanos() as u64;
        Duration::from_nanos(random.u64() % span)
    }

    /// Offset of the recovery firing after one at `prev`.
    pub fn subsequent_recovery_deadline(&self, prev: Duration) -> Duration {
        prev + self.fast_recovery_lambda
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Midpoint;

    impl RandomSource for Midpoint {
        fn u64(&self) -> u64 {
            u64::MAX / 2
        }
    }

    #[test]
    fn next_ranges_tile_without_overlap() {
        let p = ProtocolParams::default();
        for k in 1..20u64 {
            let (lower, upper) = p.next_range(k);
            assert!(lower < upper, "range {} must be non-empty", k);
            let (next_lower, _) = p.next_range(k + 1);
            assert_eq!(upper, next_lower, "range {} must abut range {}", k, k + 1);
        }
    }

    #[test]
    fn next_deadlines_stay_in_their_window() {
        let p = ProtocolParams::default();
        assert_eq!(p.next_deadline(0, &Midpoint), p.deadline_timeout());
        for k in 1..10u64 {
            let d = p.next_deadline(k, &Midpoint);
            let (lower, upper) = p.next_range(k);
            assert!(d >= p.deadline_timeout() + lower);
            assert!(d < p.deadline_timeout() + upper);
        }
    }

    #[test]
    fn recovery_deadlines_match_the_reference_trace() {
        // With midpoint entropy the first firing lands at
        // (u64::MAX / 2) % 600s and the second one λ_f later.
        let p = ProtocolParams::default();
        let first = p.first_recovery_deadline(&Midpoint);
        assert_eq!(first, Duration::from_nanos(436_854_775_807));
        let second = p.subsequent_recovery_deadline(first);
        assert_eq!(second, Duration::from_nanos(736_854_775_807));
    }
}
