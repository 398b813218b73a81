//! Deduplication of inbound Confirmable messages.
//!
//! A CON's message id must be remembered for `EXCHANGE_LIFETIME`
//! after receipt; a second copy inside that window replays the exact
//! reply bytes the first copy earned (or is silently dropped if no
//! reply was generated), and never reaches the application twice.

use embedded_time::Instant;
use newt_msg::Id;
use no_std_net::SocketAddr;
use std_alloc::collections::BTreeMap;
use std_alloc::vec::Vec;

use crate::time::{millis_between, Clock, Stamped};

/// Outcome of checking an inbound CON against the history
#[derive(Clone, Debug, PartialEq)]
pub enum Seen {
  /// First sighting; process the message
  New,
  /// Duplicate; if a reply was recorded, retransmit exactly these
  /// bytes and do nothing else
  Duplicate(Option<Vec<u8>>),
}

struct History {
  id: Id,
  reply: Option<Vec<u8>>,
}

/// Per-peer message-id history over the exchange lifetime window.
pub struct Dedup<C: Clock> {
  seen: BTreeMap<SocketAddr, Vec<Stamped<C, History>>>,
}

impl<C: Clock> core::fmt::Debug for Dedup<C> {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Dedup")
     .field("peers", &self.seen.len())
     .finish()
  }
}

impl<C: Clock> Default for Dedup<C> {
  fn default() -> Self {
    Self { seen: BTreeMap::new() }
  }
}

impl<C: Clock> Dedup<C> {
  /// An empty history
  pub fn new() -> Self {
    Default::default()
  }

  /// Check an inbound `(peer, mid)` pair, recording it if new.
  pub fn check(&mut self, peer: SocketAddr, id: Id, now: Instant<C>) -> Seen {
    let ids = self.seen.entry(peer).or_default();

    match ids.iter().find(|s| s.data().id == id) {
      | Some(s) => Seen::Duplicate(s.data().reply.clone()),
      | None => {
        ids.push(Stamped(History { id, reply: None }, now));
        Seen::New
      },
    }
  }

  /// Remember the bytes we replied to `(peer, mid)` with, so a
  /// duplicate elicits the identical reply.
  pub fn record_reply(&mut self, peer: SocketAddr, id: Id, bytes: Vec<u8>) {
    if let Some(ids) = self.seen.get_mut(&peer) {
      if let Some(s) = ids.iter_mut().find(|s| s.data().id == id) {
        s.0.reply = Some(bytes);
      }
    }
  }

  /// Drop history entries older than `exchange_lifetime_millis`,
  /// and peers with no history left.
  pub fn prune(&mut self, now: Instant<C>, exchange_lifetime_millis: u64) {
    for ids in self.seen.values_mut() {
      ids.retain(|s| millis_between(s.time(), now).0 < exchange_lifetime_millis);
    }
    self.seen.retain(|_, ids| !ids.is_empty());
  }

  /// Forget everything about a peer (session teardown)
  pub fn forget(&mut self, peer: SocketAddr) {
    self.seen.remove(&peer);
  }

  /// Number of peers with live history
  pub fn len(&self) -> usize {
    self.seen.len()
  }

  /// Whether the history is empty
  pub fn is_empty(&self) -> bool {
    self.seen.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test::{dummy_addr, dummy_addr_2, ClockMock};

  #[test]
  fn second_copy_is_duplicate() {
    let mut dedup = Dedup::<ClockMock>::new();

    assert_eq!(dedup.check(dummy_addr(), Id(7), ClockMock::instant(0)),
               Seen::New);
    assert_eq!(dedup.check(dummy_addr(), Id(7), ClockMock::instant(30_000)),
               Seen::Duplicate(None));

    // same mid from another peer is unrelated
    assert_eq!(dedup.check(dummy_addr_2(), Id(7), ClockMock::instant(0)),
               Seen::New);
  }

  #[test]
  fn duplicate_replays_recorded_reply() {
    let mut dedup = Dedup::<ClockMock>::new();

    dedup.check(dummy_addr(), Id(7), ClockMock::instant(0));
    dedup.record_reply(dummy_addr(), Id(7), vec![0x60, 0x45, 0x00, 0x07]);

    assert_eq!(dedup.check(dummy_addr(), Id(7), ClockMock::instant(1_000)),
               Seen::Duplicate(Some(vec![0x60, 0x45, 0x00, 0x07])));
  }

  #[test]
  fn history_expires_after_exchange_lifetime() {
    let mut dedup = Dedup::<ClockMock>::new();
    dedup.check(dummy_addr(), Id(7), ClockMock::instant(0));

    dedup.prune(ClockMock::instant(246_000), 247_000);
    assert_eq!(dedup.check(dummy_addr(), Id(7), ClockMock::instant(246_000)),
               Seen::Duplicate(None));

    dedup.prune(ClockMock::instant(247_000), 247_000);
    assert!(dedup.is_empty());
    assert_eq!(dedup.check(dummy_addr(), Id(7), ClockMock::instant(247_000)),
               Seen::New);
  }
}
