use embedded_time::duration::Milliseconds;
use tinyvec::ArrayVec;

use crate::retry::{Attempts, Strategy};
use crate::time::Millis;

/// Bytes / Second
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BytesPerSecond(pub u16);

/// Configuration options related to parsing & handling outbound CON requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Con {
  /// Retry strategy for CON messages that have not yet been ACKed.
  ///
  /// The default is the RFC 7252 section 4.8 schedule:
  /// `ACK_TIMEOUT = 2s` jittered up to `ACK_RANDOM_FACTOR = 1.5`,
  /// doubling after every attempt.
  ///
  /// ```
  /// use embedded_time::duration::Milliseconds;
  /// use newt::config::Con;
  /// use newt::retry::Strategy;
  ///
  /// assert_eq!(Con::default().unacked_retry_strategy,
  ///            Strategy::Exponential { init_min: Milliseconds(2_000),
  ///                                    init_max: Milliseconds(3_000) });
  /// ```
  pub unacked_retry_strategy: Strategy,
  /// Retry strategy for CON requests that have been ACKed but whose
  /// actual response has not arrived yet.
  ///
  /// Usually this should be **lazier** than `unacked_retry_strategy`,
  /// since we can reasonably expect the duration between "received
  /// request" and "responded with ACK" to be much shorter than
  /// "responded with ACK" and "sent actual response."
  pub acked_retry_strategy: Strategy,
  /// Number of times we are allowed to resend a CON message
  /// before reporting it dead (`MAX_RETRANSMIT`).
  ///
  /// Defaults to 4 attempts.
  /// ```
  /// use newt::config::Con;
  /// use newt::retry::Attempts;
  ///
  /// assert_eq!(Con::default().max_retransmit, Attempts(4));
  /// ```
  pub max_retransmit: Attempts,
}

/// Configuration options related to parsing & handling outbound NON requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Non {
  /// Strategy to use when we sent a NON request and haven't yet
  /// received a response.
  pub retry_strategy: Strategy,
  /// Number of times we are allowed to resend a NON request
  /// before giving up.
  pub max_attempts: Attempts,
}

/// Configuration options related to parsing & handling messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Msg {
  /// Seed mixed into generated message tokens, customizable to allow
  /// for your application to generate tokens less guessably.
  ///
  /// The default value is 0, although it is best practice to set this
  /// to something else. (random integer, machine identifier)
  ///
  /// _e.g. if you're developing a swarm of smart CoAP-enabled
  /// thermostats, each one would ideally have a distinct token seed._
  pub token_seed: u16,

  /// Transmission rate we should do our best not to exceed when
  /// probing an unresponsive peer (`PROBING_RATE`).
  ///
  /// Defaults to `BytesPerSecond(1)` per RFC 7252 section 4.8.
  pub probing_rate: BytesPerSecond,

  /// See [`Con`]
  pub con: Con,

  /// See [`Non`]
  pub non: Non,

  /// Maximum amount of time we should delay a response to a
  /// multicast request (`DEFAULT_LEISURE`).
  ///
  /// The actual delay is random between zero and this value.
  ///
  /// Defaults to 5000 milliseconds.
  pub multicast_response_leisure: Millis,
}

impl Default for Con {
  fn default() -> Self {
    Con { unacked_retry_strategy: Strategy::Exponential { init_min: Milliseconds(2_000),
                                                          init_max: Milliseconds(3_000) },
          acked_retry_strategy: Strategy::Exponential { init_min: Milliseconds(4_000),
                                                        init_max: Milliseconds(6_000) },
          max_retransmit: Attempts(4) }
  }
}

impl Default for Non {
  fn default() -> Self {
    Non { retry_strategy: Strategy::Exponential { init_min: Milliseconds(2_000),
                                                  init_max: Milliseconds(3_000) },
          max_attempts: Attempts(4) }
  }
}

impl Default for Msg {
  fn default() -> Self {
    Msg { token_seed: 0,
          probing_rate: BytesPerSecond(1),
          con: Con::default(),
          non: Non::default(),
          multicast_response_leisure: Milliseconds(5000) }
  }
}

/// Runtime config
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
  /// See [`Msg`]
  pub msg: Msg,

  /// Maximum number of requests that can be in flight to a single
  /// peer at a given moment (`NSTART`)
  ///
  /// Default value is `1` (no concurrency)
  pub nstart: u8,

  /// Seconds of inactivity after which a session with no outstanding
  /// work is torn down. Defaults to 300.
  pub session_timeout: u32,

  /// Seconds of inactivity before a keepalive probe (Empty CON on
  /// datagram transports, 7.02 Ping on streams) is sent.
  /// 0 disables keepalive. Defaults to 0.
  pub ping_interval: u32,

  /// Maximum number of simultaneous idle server-side sessions.
  /// 0 means no maximum. Defaults to 0.
  pub max_idle_sessions: u16,

  /// Maximum number of sessions that may sit in the DTLS/TLS
  /// handshake state at once. Defaults to 100.
  pub max_handshake_sessions: u16,

  /// Largest block size to offer in block-wise transfers.
  /// A power of two in `[16, 1024]`; defaults to 1024.
  pub max_block_size: u16,

  /// Option numbers excluded from the request cache key, on top of
  /// the NoCacheKey rule.
  pub cache_ignored_options: ArrayVec<[u16; 8]>,
}

impl Default for Config {
  fn default() -> Self {
    Config { msg: Msg::default(),
             nstart: 1,
             session_timeout: 300,
             ping_interval: 0,
             max_idle_sessions: 0,
             max_handshake_sessions: 100,
             max_block_size: 1024,
             cache_ignored_options: Default::default() }
  }
}

impl Config {
  /// `MAX_TRANSMIT_SPAN`: worst-case time from the first transmission
  /// of a CON to its final retransmission (RFC 7252 section 4.8.2)
  pub fn max_transmit_span_millis(&self) -> u64 {
    let acked_con = self.msg
                        .con
                        .acked_retry_strategy
                        .max_time(self.msg.con.max_retransmit)
                        .0;

    let unacked_con = self.msg
                          .con
                          .unacked_retry_strategy
                          .max_time(self.msg.con.max_retransmit)
                          .0;

    let non = self.msg
                  .non
                  .retry_strategy
                  .max_time(self.msg.non.max_attempts)
                  .0;

    acked_con.max(unacked_con).max(non)
  }

  /// `MAX_TRANSMIT_WAIT`: worst-case time from the first transmission
  /// of a CON to giving up on an ACK (RFC 7252 section 4.8.2)
  pub fn max_transmit_wait_millis(&self) -> u64 {
    let Attempts(n) = self.msg.con.max_retransmit;
    self.msg
        .con
        .unacked_retry_strategy
        .max_time(Attempts(n + 1))
        .0
  }

  // TODO(config): adjust these on the fly based on observed round trips?
  /// `MAX_LATENCY` (RFC 7252 section 4.8.2): 100 seconds
  pub fn max_latency_millis(&self) -> u64 {
    100_000
  }

  /// `PROCESSING_DELAY`: the time a node takes to turn around a CON,
  /// set to `ACK_TIMEOUT` per RFC 7252 section 4.8.2
  pub fn expected_processing_delay_millis(&self) -> u64 {
    *self.msg.con.unacked_retry_strategy.range().start()
  }

  /// `MAX_RTT` (RFC 7252 section 4.8.2)
  pub fn max_rtt_millis(&self) -> u64 {
    2 * self.max_latency_millis() + self.expected_processing_delay_millis()
  }

  /// `EXCHANGE_LIFETIME`: how long a message id must be remembered
  /// for deduplication (RFC 7252 section 4.8.2)
  pub fn exchange_lifetime_millis(&self) -> u64 {
    self.max_transmit_span_millis()
    + (2 * self.max_latency_millis())
    + self.expected_processing_delay_millis()
  }

  /// `NON_LIFETIME` (RFC 7252 section 4.8.2)
  pub fn non_lifetime_millis(&self) -> u64 {
    self.max_transmit_span_millis() + self.max_latency_millis()
  }

  /// Minimum spacing between transmissions toward a peer that is not
  /// responding: the time `bytes` takes at `PROBING_RATE`
  pub fn probing_interval_millis(&self, bytes: usize) -> u64 {
    bytes as u64 * 1000 / self.msg.probing_rate.0.max(1) as u64
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_follow_rfc7252() {
    let cfg = Config::default();
    assert_eq!(cfg.nstart, 1);
    assert_eq!(cfg.msg.probing_rate, BytesPerSecond(1));
    assert_eq!(cfg.msg.multicast_response_leisure, Millis::new(5_000));
    assert_eq!(cfg.msg.con.max_retransmit, Attempts(4));
  }

  #[test]
  fn probing_interval_follows_the_rate() {
    // 4 bytes at the default 1 B/s is 4 seconds
    assert_eq!(Config::default().probing_interval_millis(4), 4_000);

    let mut cfg = Config::default();
    cfg.msg.probing_rate = BytesPerSecond(100);
    assert_eq!(cfg.probing_interval_millis(50), 500);
  }

  #[test]
  fn exchange_lifetime_in_expected_ballpark() {
    // with the RFC defaults: MAX_TRANSMIT_SPAN = 45s,
    // EXCHANGE_LIFETIME = 45 + 200 + 2 = 247s
    let cfg = Config::default();
    assert_eq!(cfg.max_transmit_span_millis(), 45_000 + 3_000);
    assert_eq!(cfg.exchange_lifetime_millis(),
               cfg.max_transmit_span_millis() + 200_000 + 2_000);
  }
}
