use embedded_time::rate::Fraction;

use crate::core::Wait;
use crate::time::Millis;

/// Networking! woohoo!
pub mod net;
pub use net::*;

/// A monotonic millisecond clock backed by [`std::time::Instant`]
#[derive(Clone, Copy, Debug)]
pub struct Clock {
  start: std::time::Instant,
}

impl Clock {
  /// A clock whose epoch is "now"
  pub fn new() -> Self {
    Self { start: std::time::Instant::now() }
  }
}

impl Default for Clock {
  fn default() -> Self {
    Self::new()
  }
}

impl embedded_time::Clock for Clock {
  type T = u64;

  const SCALING_FACTOR: Fraction = Fraction::new(1, 1000);

  fn try_now(&self) -> Result<embedded_time::Instant<Self>, embedded_time::clock::Error> {
    Ok(embedded_time::Instant::new(self.start.elapsed().as_millis() as u64))
  }
}

/// The POSIX-flavored readiness driver: parks the thread until the
/// next timer is due.
///
/// Inbound datagrams arriving mid-sleep wait until the sleep ends;
/// bound the latency by passing a smaller timeout to
/// [`crate::core::Core::process`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SleepWait;

impl Wait for SleepWait {
  fn wait(&self, d: Millis) {
    std::thread::sleep(std::time::Duration::from_millis(d.0));
  }
}

#[cfg(test)]
mod tests {
  use embedded_time::Clock as _;

  use super::*;

  #[test]
  fn clock_is_monotonic() {
    let clock = Clock::new();
    let a = clock.try_now().unwrap();
    let b = clock.try_now().unwrap();
    assert!(b >= a);
  }
}
