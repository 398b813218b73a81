//! The request cache: canonical fingerprint → cached response, with
//! single-flight coalescing of concurrent identical requests.
//!
//! The fingerprint comes from [`newt_msg::DefaultCacheKey`]: method +
//! cache-key options (minus the configured ignore set). While a
//! response for a fingerprint is being computed, any further request
//! with the same fingerprint parks as a waiter instead of invoking
//! the handler again; when the response lands every waiter gets a
//! copy. Cache failures are invisible: they degrade to misses.

use embedded_time::Instant;
use newt_msg::{Id, Message, Token};
use no_std_net::SocketAddr;
use std_alloc::collections::BTreeMap;
use std_alloc::vec::Vec;

use crate::net::Addrd;
use crate::time::{millis_between, Clock};

/// A request parked on an in-flight cache entry.
///
/// When the response arrives it is re-addressed with the waiter's
/// own id and token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Waiter {
  /// Who asked
  pub peer: SocketAddr,
  /// The id their copy must carry
  pub id: Id,
  /// The token their copy must carry
  pub token: Token,
}

enum State<C: Clock> {
  /// A handler is computing the response; these requests want a copy
  Building { waiters: Vec<Waiter> },
  /// A response is cached until `expires`
  Ready {
    response: Message,
    stored: Instant<C>,
    max_age_millis: u64,
  },
}

struct Entry<C: Clock> {
  state: State<C>,
  generation: u64,
}

/// What the cache knows about a fingerprint
#[derive(Clone, Debug, PartialEq)]
pub enum Lookup {
  /// Fresh response; reply with it immediately
  Hit(Message),
  /// Nothing cached; invoke the handler (and consider
  /// [`Cache::build`] first to coalesce duplicates)
  Miss,
  /// A response is being computed right now; park as a waiter
  InFlight,
}

/// Fingerprint-keyed response cache.
pub struct Cache<C: Clock> {
  entries: BTreeMap<u64, Entry<C>>,
  generation: u64,
}

impl<C: Clock> core::fmt::Debug for Cache<C> {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Cache")
     .field("entries", &self.entries.len())
     .finish()
  }
}

impl<C: Clock> Default for Cache<C> {
  fn default() -> Self {
    Self { entries: BTreeMap::new(),
           generation: 0 }
  }
}

impl<C: Clock> Cache<C> {
  /// An empty cache
  pub fn new() -> Self {
    Default::default()
  }

  /// Look a fingerprint up, expiring stale entries on the way
  pub fn lookup(&mut self, key: u64, now: Instant<C>) -> Lookup {
    match self.entries.get(&key) {
      | None => Lookup::Miss,
      | Some(Entry { state: State::Building { .. },
                     .. }) => Lookup::InFlight,
      | Some(Entry { state: State::Ready { response,
                                           stored,
                                           max_age_millis, },
                     .. }) => {
        if millis_between(*stored, now).0 >= *max_age_millis {
          self.entries.remove(&key);
          Lookup::Miss
        } else {
          Lookup::Hit(response.clone())
        }
      },
    }
  }

  /// Claim a fingerprint for building: at most one build per key is
  /// in flight; the caller that gets `true` runs the handler, anyone
  /// else parks with [`Cache::join`].
  pub fn build(&mut self, key: u64) -> bool {
    if self.entries.contains_key(&key) {
      return false;
    }

    self.generation += 1;
    self.entries.insert(key,
                        Entry { state: State::Building { waiters: Vec::new() },
                                generation: self.generation });
    true
  }

  /// Park a duplicate request on an in-flight build
  pub fn join(&mut self, key: u64, waiter: Waiter) -> bool {
    match self.entries.get_mut(&key) {
      | Some(Entry { state: State::Building { waiters },
                     .. }) => {
        waiters.push(waiter);
        true
      },
      | _ => false,
    }
  }

  /// The handler finished; store the response and collect everyone
  /// waiting for a copy.
  ///
  /// A `max_age` of zero stores nothing (the response is
  /// uncacheable) but still flushes the waiters.
  pub fn fill(&mut self,
              key: u64,
              response: Message,
              now: Instant<C>,
              max_age_millis: u64)
              -> Vec<Waiter> {
    let waiters = match self.entries.remove(&key) {
      | Some(Entry { state: State::Building { waiters },
                     .. }) => waiters,
      | Some(other) => {
        // raced with an expiry sweep; keep the newer entry
        self.entries.insert(key, other);
        Vec::new()
      },
      | None => Vec::new(),
    };

    if max_age_millis > 0 {
      self.generation += 1;
      self.entries.insert(key,
                          Entry { state: State::Ready { response,
                                                        stored: now,
                                                        max_age_millis },
                                  generation: self.generation });
    }

    waiters
  }

  /// Drop a build claim without storing anything (handler failed);
  /// returns the waiters so the caller can answer them with an error.
  pub fn abandon(&mut self, key: u64) -> Vec<Waiter> {
    match self.entries.remove(&key) {
      | Some(Entry { state: State::Building { waiters },
                     .. }) => waiters,
      | Some(other) => {
        self.entries.insert(key, other);
        Vec::new()
      },
      | None => Vec::new(),
    }
  }

  /// Sweep expired entries
  pub fn sweep(&mut self, now: Instant<C>) {
    self.entries.retain(|_, e| match &e.state {
                  | State::Building { .. } => true,
                  | State::Ready { stored,
                                   max_age_millis,
                                   .. } => millis_between(*stored, now).0 < *max_age_millis,
                });
  }

  /// The next instant an entry expires, in milliseconds from `now`
  pub fn next_expiry_in(&self, now: Instant<C>) -> Option<u64> {
    self.entries
        .values()
        .filter_map(|e| match &e.state {
          | State::Building { .. } => None,
          | State::Ready { stored,
                           max_age_millis,
                           .. } => {
            Some(max_age_millis.saturating_sub(millis_between(*stored, now).0))
          },
        })
        .min()
  }

  /// Address `response` to a waiter, rewriting correlation ids
  pub fn readdress(response: &Message, waiter: &Waiter) -> Addrd<Message> {
    let mut copy = response.clone();
    copy.id = waiter.id;
    copy.token = waiter.token;
    Addrd(copy, waiter.peer)
  }

  /// The generation tag an entry was created under; generations
  /// increase monotonically, distinguishing a refilled entry from
  /// the one a stale reference was taken against
  pub fn generation_of(&self, key: u64) -> Option<u64> {
    self.entries.get(&key).map(|e| e.generation)
  }

  /// Number of live entries (including in-flight builds)
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  /// Whether the cache is empty
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}
