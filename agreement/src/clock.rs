// Copyright © Palisade Contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::Context;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// A monotonic source of round-relative deadlines.
///
/// The player rezeroes the clock when it enters a round or period; every
/// timeout offset handed to `timeout_at` is measured from that zero. The
/// clock serializes with the rest of the crash state so a restored node
/// resumes its deadlines mid-round instead of restarting them.
pub trait Clock: Send + Sync {
    /// Resets the zero point to now.
    fn zero(&self);

    /// A future resolving once `offset` has elapsed since the last zero.
    /// An offset already in the past resolves immediately.
    fn timeout_at(&self, offset: Duration) -> BoxFuture<'static, ()>;

    fn encode(&self) -> Vec<u8>;

    /// Rebuilds a clock of the same kind from `encode` output.
    fn decode(&self, data: &[u8]) -> anyhow::Result<Arc<dyn Clock>>;
}

/// Wall-clock implementation over the tokio timer wheel.
pub struct MonotonicClock {
    zero: Mutex<Instant>,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock { zero: Mutex::new(Instant::now()) }
    }

    fn with_elapsed(elapsed: Duration) -> Self {
        let now = Instant::now();
        let zero = now.checked_sub(elapsed).unwrap_or(now);
        MonotonicClock { zero: Mutex::new(zero) }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn zero(&self) {
        *self.zero.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn timeout_at(&self, offset: Duration) -> BoxFuture<'static, ()> {
        let zero = *self.zero.lock().unwrap_or_else(|e| e.into_inner());
        tokio::time::sleep_until(zero + offset).boxed()
    }

    fn encode(&self) -> Vec<u8> {
        let zero = *self.zero.lock().unwrap_or_else(|e| e.into_inner());
        let elapsed = zero.elapsed().as_nanos() as u64;
        bcs::to_bytes(&elapsed).unwrap_or_default()
    }

    fn decode(&self, data: &[u8]) -> anyhow::Result<Arc<dyn Clock>> {
        let elapsed: u64 =
            bcs::from_bytes(data).context("monotonic clock state did not decode")?;
        Ok(Arc::new(MonotonicClock::with_elapsed(Duration::from_nanos(elapsed))))
    }
}
