//! Retransmission schedules.
//!
//! A [`Strategy`] describes when repeat attempts of some fallible
//! transmission should happen: an initial window the first timeout is
//! drawn from (jittered so a fleet of devices doesn't synchronize),
//! and either a fixed or doubling delay thereafter.
//!
//! The RFC 7252 section 4.2 `ACK_TIMEOUT` / `ACK_RANDOM_FACTOR` pair
//! is expressed as an exponential strategy of
//! `init_min = ACK_TIMEOUT` and
//! `init_max = ACK_TIMEOUT * ACK_RANDOM_FACTOR`: the send queue draws
//! `T0 ∈ [init_min, init_max)` via [`Strategy::init_millis`] and
//! doubles the timeout itself after every attempt.

use core::ops::RangeInclusive;

use embedded_time::duration::Milliseconds;
use rand::{Rng, SeedableRng};

/// A number of attempts
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Attempts(pub u16);

/// Strategy to employ when retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Strategy {
  /// Generate a random delay between `init_min` and `init_max`,
  /// and wait until this delay has passed between attempts.
  ///
  /// After each failed attempt, double the delay before retrying again.
  Exponential {
    /// Minimum (inclusive) delay for second attempt
    init_min: Milliseconds<u64>,
    /// Maximum (exclusive) delay for second attempt
    init_max: Milliseconds<u64>,
  },
  /// Generate a random delay between `min` and `max`,
  /// and wait until this delay has passed between attempts.
  Delay {
    /// Minimum (inclusive) delay for attempts
    min: Milliseconds<u64>,
    /// Maximum (exclusive) delay for attempts
    max: Milliseconds<u64>,
  },
}

impl Strategy {
  /// Are min & max delays the same? if so, we should skip the
  /// random number generation.
  pub fn has_jitter(&self) -> bool {
    let rng = self.range();
    rng.start() != rng.end()
  }

  /// Get the min & max durations as an inclusive range
  pub fn range(&self) -> RangeInclusive<u64> {
    match self {
      | &Self::Delay { min: Milliseconds(min),
                       max: Milliseconds(max), } => (min..=max),

      | &Self::Exponential { init_min: Milliseconds(min),
                             init_max: Milliseconds(max), } => (min..=max),
    }
  }

  /// Draw the initial delay, jittered within the configured window
  /// by a ChaCha8 stream seeded with `seed`
  pub fn init_millis(&self, seed: u64) -> u64 {
    if self.has_jitter() {
      let mut rand = rand_chacha::ChaCha8Rng::seed_from_u64(seed);
      rand.gen_range(self.range())
    } else {
      *self.range().start()
    }
  }

  /// Get the amount of time this strategy will take if all attempts fail
  pub fn max_time(&self, max_attempts: Attempts) -> Milliseconds<u64> {
    Milliseconds(match self {
                   | Self::Exponential { init_max, .. } => {
                     Self::total_delay_exp(*init_max, max_attempts.0)
                   },
                   | Self::Delay { max: Milliseconds(max),
                                   .. } => max * max_attempts.0 as u64,
                 })
  }

  /// Given the initial delay and number of attempts that have been
  /// performed, yields the total elapsed time at which the next retry
  /// should be attempted.
  pub(crate) const fn total_delay_exp(Milliseconds(init): Milliseconds<u64>, attempt: u16) -> u64 {
    // | attempt | total delay      |
    // | 1       | init             |
    // | 2       | init * 2         |
    // | 3       | init * 4         |
    // | ...     | ...              |
    // | n       | init * 2^(n-1)   |
    init * 2u64.pow((attempt - 1) as u32)
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn exp_calculation() {
    let init = Milliseconds(100);
    assert_eq!(Strategy::total_delay_exp(init, 1), 100);
    assert_eq!(Strategy::total_delay_exp(init, 2), 200);
    assert_eq!(Strategy::total_delay_exp(init, 3), 400);
  }

  #[test]
  fn max_time_sums_the_schedule() {
    let exp = Strategy::Exponential { init_min: Milliseconds(2_000),
                                      init_max: Milliseconds(3_000) };
    assert_eq!(exp.max_time(Attempts(4)), Milliseconds(24_000u64));

    let fixed = Strategy::Delay { min: Milliseconds(500),
                                  max: Milliseconds(500) };
    assert_eq!(fixed.max_time(Attempts(4)), Milliseconds(2_000u64));
  }

  #[test]
  fn fixed_windows_skip_the_rng() {
    let fixed = Strategy::Delay { min: Milliseconds(500),
                                  max: Milliseconds(500) };
    assert!(!fixed.has_jitter());
    assert_eq!(fixed.init_millis(0), 500);
    assert_eq!(fixed.init_millis(99), 500);
  }

  #[test]
  fn jitter_stays_in_window() {
    let strat = Strategy::Exponential { init_min: Milliseconds(2000),
                                        init_max: Milliseconds(3000) };
    for seed in 0..64 {
      let t0 = strat.init_millis(seed);
      assert!((2000..=3000).contains(&t0));
    }
  }
}
