//! The send queue: every Confirmable transmission parks here until
//! the peer ACKs it, resets it, or the retransmit budget runs out.
//!
//! Entries are keyed by `(absolute fire tick, insertion sequence)` in
//! a `BTreeMap`, giving O(log n) insertion, strict tick ordering, and
//! FIFO tie-breaking without a hand-maintained linked list.

use embedded_time::Instant;
use newt_msg::{Id, Message, Token};
use no_std_net::SocketAddr;
use std_alloc::collections::BTreeMap;
use std_alloc::vec::Vec;

use crate::net::Addrd;
use crate::retry::{Attempts, Strategy};
use crate::secure::TlsFailure;
use crate::time::{millis_between, Clock, Millis};

/// Why a queued transmission was abandoned.
///
/// Delivered to the nack handler along with the dead message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NackReason {
  /// The retransmit budget was exhausted with no ACK
  Timeout,
  /// The peer answered with a Reset
  Rst,
  /// The sender cancelled the exchange
  Cancelled,
  /// The secure channel failed under the message
  Tls(TlsFailure),
}

/// Receipt for a consumed-and-queued message.
///
/// Sending consumes the message; the ticket carries the identifiers
/// needed to correlate its fate (response, nack, cancellation).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendTicket {
  /// The message id the transmission went out under
  pub id: Id,
  /// The exchange token
  pub token: Token,
}

/// A queued confirmable transmission
#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
  /// Destination peer
  pub peer: SocketAddr,
  /// Message id, for ACK/RST matching
  pub id: Id,
  /// Exchange token, for cancellation & deferred responses
  pub token: Token,
  /// Retransmissions performed so far
  pub retransmit_cnt: u16,
  /// Current (randomized, then doubled) retransmission timeout
  pub timeout: Millis,
  /// The message itself, re-encoded on each retransmission
  pub msg: Message,
}

/// What [`SendQueue::process_due`] decided for each fired entry
#[derive(Clone, Debug, PartialEq)]
pub enum Fired {
  /// Retransmit this message (it has been rescheduled)
  Resend(Addrd<Message>),
  /// Budget exhausted; the exchange is dead
  Dead(Entry),
}

/// Priority queue of pending confirmable transmissions.
pub struct SendQueue<C: Clock> {
  entries: BTreeMap<(u64, u64), Entry>,
  basetime: Instant<C>,
  seq: u64,
}

impl<C: Clock> core::fmt::Debug for SendQueue<C> {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("SendQueue")
     .field("len", &self.entries.len())
     .finish()
  }
}

impl<C: Clock> Default for SendQueue<C> {
  fn default() -> Self {
    Self { entries: BTreeMap::new(),
           basetime: Instant::new(0),
           seq: 0 }
  }
}

impl<C: Clock> SendQueue<C> {
  /// An empty queue
  pub fn new() -> Self {
    Default::default()
  }

  fn abs_millis(&self, t: Instant<C>) -> u64 {
    Millis::try_from(t.duration_since_epoch()).map(|m| m.0)
                                              .unwrap_or(0)
  }

  /// Schedule a confirmable message.
  ///
  /// The initial timeout `T0` is drawn from `strategy`'s jitter
  /// window (`ACK_TIMEOUT * [1, ACK_RANDOM_FACTOR)`); the entry
  /// first fires at `now + T0`.
  pub fn insert(&mut self,
                msg: Addrd<Message>,
                now: Instant<C>,
                strategy: Strategy)
                -> SendTicket {
    let Addrd(msg, peer) = msg;
    let ticket = SendTicket { id: msg.id,
                              token: msg.token };

    let seed = self.abs_millis(now).wrapping_add(msg.id.0 as u64).wrapping_add(self.seq);
    let timeout = Millis::new(strategy.init_millis(seed));

    self.insert_at(Entry { peer,
                           id: msg.id,
                           token: msg.token,
                           retransmit_cnt: 0,
                           timeout,
                           msg },
                   self.abs_millis(now) + timeout.0);
    ticket
  }

  fn insert_at(&mut self, entry: Entry, fire_at: u64) {
    self.seq += 1;
    self.entries.insert((fire_at, self.seq), entry);
  }

  /// Borrow the entry that fires soonest
  pub fn peek(&self) -> Option<&Entry> {
    self.entries.values().next()
  }

  /// Remove and return the entry that fires soonest
  pub fn pop(&mut self) -> Option<Entry> {
    let key = *self.entries.keys().next()?;
    self.entries.remove(&key)
  }

  /// Milliseconds until the head entry fires, zero if it already has
  pub fn next_fire_in(&self, now: Instant<C>) -> Option<Millis> {
    let (fire_at, _) = self.entries.keys().next()?;
    Some(Millis::new(fire_at.saturating_sub(self.abs_millis(now))))
  }

  /// Rebase the queue's timeline onto `now`, returning how many
  /// entries have already fired.
  ///
  /// The entry set and relative ordering are untouched; ticks are
  /// absolute, so rebasing is bookkeeping plus a count.
  pub fn adjust_basetime(&mut self, now: Instant<C>) -> usize {
    self.basetime = now;
    let now_ms = self.abs_millis(now);
    self.entries
        .keys()
        .take_while(|(fire_at, _)| *fire_at <= now_ms)
        .count()
  }

  /// Fire every entry that is due at `now`: entries with budget left
  /// are rescheduled at double their timeout and yielded for resend;
  /// entries out of budget are yielded as [`Fired::Dead`] (emit a
  /// [`NackReason::Timeout`]).
  pub fn process_due(&mut self, now: Instant<C>, max_retransmit: Attempts) -> Vec<Fired> {
    let now_ms = self.abs_millis(now);
    let mut out = Vec::new();

    while let Some((fire_at, _)) = self.entries.keys().next().copied() {
      if fire_at > now_ms {
        break;
      }

      let mut entry = self.pop().expect("peeked head exists");

      if entry.retransmit_cnt < max_retransmit.0 {
        entry.retransmit_cnt += 1;

        // the gap to the next fire equals the timeout that just
        // elapsed, so transmissions land at T0, 2*T0, 4*T0, ..
        let gap = entry.timeout.0;
        entry.timeout = Millis::new(gap * 2);

        out.push(Fired::Resend(Addrd(entry.msg.clone(), entry.peer)));
        self.insert_at(entry, now_ms + gap);
      } else {
        log::debug!("CON {:?} to {:?} timed out after {} retransmits",
                    entry.id,
                    entry.peer,
                    entry.retransmit_cnt);
        out.push(Fired::Dead(entry));
      }
    }

    out
  }

  /// An ACK (or piggybacked response) for `(peer, mid)` arrived;
  /// dequeue the matching CON without any nack.
  pub fn ack(&mut self, peer: SocketAddr, id: Id) -> Option<Entry> {
    self.remove_where(|e| e.peer == peer && e.id == id)
        .into_iter()
        .next()
  }

  /// Cancel the queued transmission with `(peer, mid)`, silently
  pub fn cancel_by_mid(&mut self, peer: SocketAddr, id: Id) -> Option<Entry> {
    self.ack(peer, id)
  }

  /// Cancel every queued transmission sharing `(peer, token)`.
  ///
  /// The caller owes each returned entry a [`NackReason::Cancelled`].
  pub fn cancel_by_token(&mut self, peer: SocketAddr, token: Token) -> Vec<Entry> {
    self.remove_where(|e| e.peer == peer && e.token == token)
  }

  /// Drop every entry destined for `peer`.
  ///
  /// The caller owes each returned entry a nack with whatever reason
  /// killed the session.
  pub fn cancel_session(&mut self, peer: SocketAddr) -> Vec<Entry> {
    self.remove_where(|e| e.peer == peer)
  }

  fn remove_where(&mut self, f: impl Fn(&Entry) -> bool) -> Vec<Entry> {
    let keys = self.entries
                   .iter()
                   .filter(|(_, e)| f(e))
                   .map(|(k, _)| *k)
                   .collect::<Vec<_>>();

    keys.into_iter()
        .filter_map(|k| self.entries.remove(&k))
        .collect()
  }

  /// Whether any transmission to `peer` is still outstanding
  pub fn has_entries_for(&self, peer: SocketAddr) -> bool {
    self.entries.values().any(|e| e.peer == peer)
  }

  /// Number of outstanding transmissions to `peer` (the NSTART
  /// bound applies to this count)
  pub fn count_for(&self, peer: SocketAddr) -> usize {
    self.entries.values().filter(|e| e.peer == peer).count()
  }

  /// Number of queued transmissions
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  /// Whether the queue is empty
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Milliseconds between the basetime and `now`; test visibility
  /// into rebasing
  pub fn age(&self, now: Instant<C>) -> Millis {
    millis_between(self.basetime, now)
  }
}

#[cfg(test)]
mod tests {
  use embedded_time::duration::Milliseconds;
  use newt_msg::{Code, Type};

  use super::*;
  use crate::test::{dummy_addr, dummy_addr_2, msg, ClockMock};

  fn fixed(ms: u64) -> Strategy {
    Strategy::Delay { min: Milliseconds(ms),
                      max: Milliseconds(ms) }
  }

  fn con(id: u16) -> Addrd<Message> {
    msg(Type::Con, Code::GET, id, dummy_addr())
  }

  #[test]
  fn orders_by_tick_with_fifo_ties() {
    let mut q = SendQueue::<ClockMock>::new();
    q.insert(con(1), ClockMock::instant(0), fixed(1000));
    q.insert(con(2), ClockMock::instant(0), fixed(1000));
    q.insert(con(3), ClockMock::instant(0), fixed(500));

    assert_eq!(q.pop().unwrap().id, Id(3));
    assert_eq!(q.pop().unwrap().id, Id(1));
    assert_eq!(q.pop().unwrap().id, Id(2));
  }

  #[test]
  fn adjust_basetime_counts_fired_and_preserves_entries() {
    let mut q = SendQueue::<ClockMock>::new();
    q.insert(con(1), ClockMock::instant(0), fixed(1000));
    q.insert(con(2), ClockMock::instant(0), fixed(5000));

    assert_eq!(q.adjust_basetime(ClockMock::instant(500)), 0);
    assert_eq!(q.adjust_basetime(ClockMock::instant(1500)), 1);
    assert_eq!(q.adjust_basetime(ClockMock::instant(9000)), 2);
    assert_eq!(q.len(), 2);
    assert_eq!(q.peek().unwrap().id, Id(1));
  }

  #[test]
  fn retransmit_schedule_doubles_until_dead() {
    let mut q = SendQueue::<ClockMock>::new();
    q.insert(con(9), ClockMock::instant(0), fixed(2000));

    // nothing due before T0
    assert!(q.process_due(ClockMock::instant(1999), Attempts(4)).is_empty());

    // t=2s, 4s, 8s, 16s: four retransmissions
    for t in [2_000u64, 4_000, 8_000, 16_000] {
      let fired = q.process_due(ClockMock::instant(t), Attempts(4));
      assert!(matches!(fired.as_slice(), [Fired::Resend(_)]), "at t={}", t);
    }

    // t=32s: budget exhausted
    let fired = q.process_due(ClockMock::instant(32_000), Attempts(4));
    assert!(matches!(fired.as_slice(), [Fired::Dead(_)]));
    assert!(q.is_empty());
  }

  #[test]
  fn ack_dequeues_matching_entry() {
    let mut q = SendQueue::<ClockMock>::new();
    let ticket = q.insert(con(7), ClockMock::instant(0), fixed(1000));

    assert!(q.ack(dummy_addr_2(), ticket.id).is_none());
    assert!(q.ack(dummy_addr(), Id(99)).is_none());
    assert_eq!(q.ack(dummy_addr(), ticket.id).unwrap().id, ticket.id);
    assert!(q.is_empty());
  }

  #[test]
  fn cancel_by_token_removes_all_matching() {
    let mut q = SendQueue::<ClockMock>::new();
    let mut a = con(1);
    a.0.token = newt_msg::Token::opaque(b"t");
    let mut b = con(2);
    b.0.token = newt_msg::Token::opaque(b"t");
    let mut c = con(3);
    c.0.token = newt_msg::Token::opaque(b"other");

    q.insert(a, ClockMock::instant(0), fixed(1000));
    q.insert(b, ClockMock::instant(0), fixed(1000));
    q.insert(c, ClockMock::instant(0), fixed(1000));

    let cancelled = q.cancel_by_token(dummy_addr(), newt_msg::Token::opaque(b"t"));
    assert_eq!(cancelled.len(), 2);
    assert_eq!(q.len(), 1);
  }

  #[test]
  fn cancel_session_drains_peer() {
    let mut q = SendQueue::<ClockMock>::new();
    q.insert(con(1), ClockMock::instant(0), fixed(1000));
    q.insert(msg(Type::Con, Code::GET, 2, dummy_addr_2()),
             ClockMock::instant(0),
             fixed(1000));

    assert_eq!(q.cancel_session(dummy_addr()).len(), 1);
    assert!(q.has_entries_for(dummy_addr_2()));
    assert!(!q.has_entries_for(dummy_addr()));
  }
}
