// SPDX-License-Identifier: MIT OR Apache-2.0
//! Reconnect backoff schedule.

use std::time::Duration;

const INITIAL_SECS: u64 = 2;
const MAX_SECS: u64 = 60;
const JITTER_MS: u64 = 999;

/// Exponential backoff: 2 s doubling to a 60 s ceiling, with a
/// deterministic sub-second jitter mixed from a per-worker seed so that a
/// fleet of clients does not reconnect in lockstep.
#[derive(Debug, Clone)]
pub struct Backoff {
    seed: u64,
    attempt: u32,
}

impl Backoff {
    /// A fresh schedule with the given jitter seed.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self { seed, attempt: 0 }
    }

    /// Delay before the next reconnect attempt, advancing the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let shift = self.attempt.min(5);
        let base_ms = (INITIAL_SECS << shift).min(MAX_SECS) * 1000;
        // splitmix-style mixing keeps the jitter spread without an RNG.
        let mut z = self
            .seed
            .wrapping_add(u64::from(self.attempt).wrapping_mul(0x9e37_79b9_7f4a_7c15));
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        let jitter = (z ^ (z >> 31)) % (2 * JITTER_MS + 1);
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(base_ms + jitter - JITTER_MS)
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// A seed for [`Backoff`] derived from the wall clock; uniqueness, not
/// unpredictability, is what matters here.
#[must_use]
pub(crate) fn clock_seed() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x5eed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_doubles_to_cap() {
        let mut backoff = Backoff::new(7);
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_millis() as u64).collect();
        let bases = [2_000u64, 4_000, 8_000, 16_000, 32_000, 60_000, 60_000, 60_000];
        for (delay, base) in delays.iter().zip(bases) {
            assert!(delay.abs_diff(base) < 1_000, "delay {delay} not near {base}");
        }
    }

    #[test]
    fn reset_restarts_schedule() {
        let mut backoff = Backoff::new(1);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        let delay = backoff.next_delay().as_millis() as u64;
        assert!(delay.abs_diff(2_000) < 1_000);
    }

    #[test]
    fn seeds_decorrelate_jitter() {
        let a = Backoff::new(1).next_delay();
        let b = Backoff::new(2).next_delay();
        // Not a strict guarantee, but these particular seeds differ.
        assert_ne!(a, b);
    }
}
