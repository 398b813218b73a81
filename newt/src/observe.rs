//! Observe (RFC 7641): long-lived GET registrations that a server
//! answers with a stream of notifications.
//!
//! The server side lives in [`Observers`]: registrations per
//! resource path, fan-out in registration order, a 24-bit wrapping
//! sequence number per resource, and eviction on deregister, RST, or
//! repeated nacks. The client side is [`FreshnessTracker`]: drop
//! notifications that are staler than what we've already seen.

use newt_msg::known::observe::SequenceNumber;
use newt_msg::Token;
use no_std_net::SocketAddr;
use std_alloc::collections::BTreeMap;
use std_alloc::string::String;
use std_alloc::vec::Vec;

/// Notifications a subscriber may miss consecutively before the
/// server stops trying
pub const MAX_FAIL: u8 = 3;

/// One registered observer of one resource
#[derive(Clone, Debug, PartialEq)]
pub struct Subscription {
  /// The observer's address
  pub peer: SocketAddr,
  /// The token its notifications must carry
  pub token: Token,
  /// Consecutive nacked notifications
  pub fails: u8,
}

/// Server-side observe registry.
pub struct Observers {
  by_path: BTreeMap<String, Registered>,
}

struct Registered {
  subs: Vec<Subscription>,
  seq: SequenceNumber,
}

impl core::fmt::Debug for Observers {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Observers")
     .field("paths", &self.by_path.len())
     .finish()
  }
}

impl Default for Observers {
  fn default() -> Self {
    Self { by_path: BTreeMap::new() }
  }
}

impl Observers {
  /// An empty registry
  pub fn new() -> Self {
    Default::default()
  }

  /// Register `(peer, token)` as an observer of `path`.
  ///
  /// Re-registering refreshes the token in place without losing the
  /// subscriber's position in the fan-out order.
  pub fn register(&mut self, path: &str, peer: SocketAddr, token: Token) {
    let reg = self.by_path
                  .entry(String::from(path))
                  .or_insert_with(|| Registered { subs: Vec::new(),
                                                  seq: SequenceNumber::default() });

    match reg.subs.iter_mut().find(|s| s.peer == peer) {
      | Some(sub) => {
        sub.token = token;
        sub.fails = 0;
      },
      | None => reg.subs.push(Subscription { peer,
                                             token,
                                             fails: 0 }),
    }
  }

  /// Remove the registration of `(peer, token)` on `path`
  pub fn deregister(&mut self, path: &str, peer: SocketAddr, token: Token) {
    if let Some(reg) = self.by_path.get_mut(path) {
      reg.subs.retain(|s| !(s.peer == peer && s.token == token));
    }
  }

  /// An RST arrived for a notification we sent to `(peer, token)`;
  /// drop that observer everywhere.
  pub fn deregister_by_rst(&mut self, peer: SocketAddr, token: Token) {
    for reg in self.by_path.values_mut() {
      reg.subs.retain(|s| !(s.peer == peer && s.token == token));
    }
  }

  /// Drop every registration held by `peer` (session teardown)
  pub fn forget_peer(&mut self, peer: SocketAddr) {
    for reg in self.by_path.values_mut() {
      reg.subs.retain(|s| s.peer != peer);
    }
  }

  /// A notification to `(peer, token)` was nacked; evict the
  /// observer after [`MAX_FAIL`] consecutive failures. Returns true
  /// when the observer was evicted.
  pub fn on_nack(&mut self, peer: SocketAddr, token: Token) -> bool {
    let mut evicted = false;
    for reg in self.by_path.values_mut() {
      for sub in reg.subs.iter_mut() {
        if sub.peer == peer && sub.token == token {
          sub.fails += 1;
        }
      }
      let before = reg.subs.len();
      reg.subs
         .retain(|s| !(s.peer == peer && s.token == token && s.fails >= MAX_FAIL));
      evicted |= reg.subs.len() < before;
    }
    evicted
  }

  /// A notification was acknowledged; reset the failure count
  pub fn on_ack(&mut self, peer: SocketAddr, token: Token) {
    for reg in self.by_path.values_mut() {
      for sub in reg.subs.iter_mut() {
        if sub.peer == peer && sub.token == token {
          sub.fails = 0;
        }
      }
    }
  }

  /// Advance `path`'s sequence number and snapshot the fan-out list
  /// in registration order.
  ///
  /// The caller builds one notification per subscription, carrying
  /// the returned sequence number in its Observe option.
  pub fn begin_notify(&mut self, path: &str) -> Option<(SequenceNumber, Vec<Subscription>)> {
    let reg = self.by_path.get_mut(path)?;
    if reg.subs.is_empty() {
      return None;
    }

    reg.seq = reg.seq.next();
    Some((reg.seq, reg.subs.clone()))
  }

  /// The observers of `path`, in registration order
  pub fn subscribers(&self, path: &str) -> &[Subscription] {
    self.by_path
        .get(path)
        .map(|r| r.subs.as_slice())
        .unwrap_or(&[])
  }

  /// Total number of registrations across all paths
  pub fn len(&self) -> usize {
    self.by_path.values().map(|r| r.subs.len()).sum()
  }

  /// Whether no observers are registered
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// Client-side notification freshness tracking.
///
/// Remembers the freshest sequence number seen per exchange and
/// rejects reordered (stale) notifications using the RFC 7641
/// wraparound comparison.
#[derive(Debug, Default)]
pub struct FreshnessTracker {
  last: BTreeMap<(SocketAddr, Token), SequenceNumber>,
}

impl FreshnessTracker {
  /// An empty tracker
  pub fn new() -> Self {
    Default::default()
  }

  /// Whether a notification with `seq` should be delivered, updating
  /// the high-water mark when it should.
  pub fn accept(&mut self, peer: SocketAddr, token: Token, seq: SequenceNumber) -> bool {
    match self.last.get(&(peer, token)) {
      | Some(prev) if !seq.is_newer_than(*prev) => false,
      | _ => {
        self.last.insert((peer, token), seq);
        true
      },
    }
  }

  /// Forget an exchange (deregistered, or session gone)
  pub fn forget(&mut self, peer: SocketAddr, token: Token) {
    self.last.remove(&(peer, token));
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test::{dummy_addr, dummy_addr_2, dummy_addr_3};

  fn token(n: u8) -> Token {
    Token::opaque(&[n])
  }

  #[test]
  fn fan_out_in_registration_order() {
    let mut obs = Observers::new();
    obs.register("temp", dummy_addr_2(), token(2));
    obs.register("temp", dummy_addr(), token(1));
    obs.register("temp", dummy_addr_3(), token(3));

    let (seq, subs) = obs.begin_notify("temp").unwrap();
    assert_eq!(seq.value(), 1);
    assert_eq!(subs.iter().map(|s| s.peer).collect::<Vec<_>>(),
               vec![dummy_addr_2(), dummy_addr(), dummy_addr_3()]);
  }

  #[test]
  fn sequence_numbers_strictly_increase() {
    let mut obs = Observers::new();
    obs.register("temp", dummy_addr(), token(1));

    let (a, _) = obs.begin_notify("temp").unwrap();
    let (b, _) = obs.begin_notify("temp").unwrap();
    assert!(b.is_newer_than(a));
  }

  #[test]
  fn rst_deregisters() {
    let mut obs = Observers::new();
    obs.register("temp", dummy_addr(), token(1));
    obs.register("humidity", dummy_addr(), token(1));

    obs.deregister_by_rst(dummy_addr(), token(1));
    assert!(obs.is_empty());
  }

  #[test]
  fn eviction_after_max_fail_nacks() {
    let mut obs = Observers::new();
    obs.register("temp", dummy_addr(), token(1));

    assert!(!obs.on_nack(dummy_addr(), token(1)));
    assert!(!obs.on_nack(dummy_addr(), token(1)));
    assert!(obs.on_nack(dummy_addr(), token(1)));
    assert!(obs.is_empty());
  }

  #[test]
  fn ack_resets_failure_count() {
    let mut obs = Observers::new();
    obs.register("temp", dummy_addr(), token(1));

    obs.on_nack(dummy_addr(), token(1));
    obs.on_nack(dummy_addr(), token(1));
    obs.on_ack(dummy_addr(), token(1));

    assert!(!obs.on_nack(dummy_addr(), token(1)));
    assert_eq!(obs.len(), 1);
  }

  #[test]
  fn freshness_accepts_wrap() {
    let mut fresh = FreshnessTracker::new();
    let t = token(1);

    assert!(fresh.accept(dummy_addr(), t, SequenceNumber::new(0xFFFFFF)));
    assert!(fresh.accept(dummy_addr(), t, SequenceNumber::new(0x000000)));
    assert!(fresh.accept(dummy_addr(), t, SequenceNumber::new(0x000001)));

    // reordered notification is stale
    assert!(!fresh.accept(dummy_addr(), t, SequenceNumber::new(0xFFFFFF)));
  }
}
