use embedded_time::Instant;
use newt_msg::framed::StreamDecoder;
use newt_msg::{Id, Token};
use no_std_net::SocketAddr;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std_alloc::collections::BTreeMap;

use crate::config::Config;
use crate::net::Transport;
use crate::time::{millis_between, Clock};

/// Which side of the conversation a session was created for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionKind {
  /// We initiated the session
  Client,
  /// A peer initiated the session by sending us a datagram
  Server,
  /// A server-side placeholder that only exists to answer a
  /// client's first DTLS flight; upgraded to `Server` when the
  /// handshake completes
  Hello,
}

/// Lifecycle of a session's relationship with its peer.
///
/// Plain UDP sessions are born `Established`; secured and reliable
/// transports walk through the intermediate states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
  /// Nothing has happened yet
  None,
  /// The transport is connecting (TCP connect in flight)
  Connecting,
  /// The security provider is mid-handshake
  Handshake,
  /// Reliable transport connected; waiting for the peer's CSM
  Csm,
  /// Ready to exchange requests
  Established,
  /// We decided to tear the session down and are draining
  Closing,
  /// The session is dead; it will be swept from the set
  Disconnected,
}

/// Per-peer protocol state.
///
/// A session multiplexes token-identified outstanding exchanges with
/// one peer: it hands out message ids and tokens, remembers when the
/// peer was last heard from, and tracks keepalive probes.
pub struct Session<C: Clock> {
  /// The transport this session speaks
  pub transport: Transport,
  /// See [`SessionKind`]
  pub kind: SessionKind,
  /// See [`SessionState`]
  pub state: SessionState,
  /// The peer's address
  pub peer: SocketAddr,
  /// Block size negotiated down from [`Config::max_block_size`];
  /// never grows again within the session's lifetime
  pub block_size: u16,
  /// Maximum datagram size the peer will take (path or CSM MTU)
  pub mtu: u16,
  /// Reassembly state for the byte-stream framing; unused on
  /// datagram transports
  pub stream: StreamDecoder,

  tx_mid: Id,
  token_rng: ChaCha8Rng,
  last_rx_tx: Instant<C>,
  ping: Option<Ping<C>>,
}

/// Encoded size of a keepalive probe (a 4-byte Empty CON; the
/// 2-byte stream Ping is rounded up), used for PROBING_RATE pacing
const PROBE_BYTES: usize = 4;

#[derive(Clone, Copy)]
struct Ping<C: Clock> {
  mid: Id,
  sent: Instant<C>,
}

impl<C: Clock> core::fmt::Debug for Session<C> {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Session")
     .field("transport", &self.transport)
     .field("kind", &self.kind)
     .field("state", &self.state)
     .field("peer", &self.peer)
     .field("tx_mid", &self.tx_mid)
     .finish()
  }
}

impl<C: Clock> Session<C> {
  fn new(kind: SessionKind,
         transport: Transport,
         peer: SocketAddr,
         now: Instant<C>,
         config: &Config)
         -> Self {
    let seed_ms = crate::time::Millis::try_from(now.duration_since_epoch()).map(|m| m.0)
                                                                           .unwrap_or(0);
    let mut seed_bytes = [0u8; 32];
    seed_bytes[..8].copy_from_slice(&seed_ms.to_be_bytes());
    seed_bytes[8..10].copy_from_slice(&config.msg.token_seed.to_be_bytes());
    seed_bytes[10..12].copy_from_slice(&peer.port().to_be_bytes());

    let mut token_rng = ChaCha8Rng::from_seed(seed_bytes);
    let tx_mid = Id(token_rng.gen());

    let state = match transport {
      | Transport::Udp => SessionState::Established,
      | Transport::Dtls => SessionState::Handshake,
      | Transport::Tcp | Transport::Tls => SessionState::Connecting,
    };

    Self { transport,
           kind,
           state,
           peer,
           block_size: config.max_block_size,
           mtu: 1152,
           stream: StreamDecoder::new(),
           tx_mid,
           token_rng,
           last_rx_tx: now,
           ping: None }
  }

  /// Create a client-side session
  pub fn client(transport: Transport, peer: SocketAddr, now: Instant<C>, config: &Config) -> Self {
    Self::new(SessionKind::Client, transport, peer, now, config)
  }

  /// Create a server-side session for a peer we just heard from
  pub fn server(transport: Transport, peer: SocketAddr, now: Instant<C>, config: &Config) -> Self {
    let kind = if transport.is_secure() {
      SessionKind::Hello
    } else {
      SessionKind::Server
    };
    Self::new(kind, transport, peer, now, config)
  }

  /// A message id unique among this session's outstanding CONs.
  ///
  /// Monotonically incremented; wraps at the 16-bit boundary, which
  /// is harmless as long as fewer than 2^16 exchanges happen per
  /// `EXCHANGE_LIFETIME` window.
  pub fn new_mid(&mut self) -> Id {
    self.tx_mid = self.tx_mid.next();
    self.tx_mid
  }

  /// A fresh 8-byte token, unpredictable to third parties
  pub fn new_token(&mut self) -> Token {
    let nonce: u64 = self.token_rng.gen();
    Token::opaque(&nonce.to_be_bytes())
  }

  /// Note traffic to or from the peer, deferring inactivity timers
  pub fn mark_activity(&mut self, now: Instant<C>) {
    self.last_rx_tx = now;
  }

  /// Milliseconds since traffic was last seen
  pub fn idle_millis(&self, now: Instant<C>) -> u64 {
    millis_between(self.last_rx_tx, now).0
  }

  /// The DTLS handshake (or TCP connect + CSM exchange) finished
  pub fn established(&mut self, now: Instant<C>) {
    if self.kind == SessionKind::Hello {
      self.kind = SessionKind::Server;
    }
    self.state = SessionState::Established;
    self.mark_activity(now);
  }

  /// Whether a keepalive probe should be sent now.
  ///
  /// An idle session gets its first probe after
  /// [`Config::ping_interval`]. An already-outstanding probe on a
  /// datagram transport retransmits through the send queue; on
  /// reliable transports (where nothing retransmits for us) the
  /// unresponsive peer is re-probed, no faster than `PROBING_RATE`
  /// allows.
  pub fn wants_ping(&self, now: Instant<C>, config: &Config) -> bool {
    if config.ping_interval == 0 || self.state != SessionState::Established {
      return false;
    }

    match self.ping {
      | None => self.idle_millis(now) >= config.ping_interval as u64 * 1000,
      | Some(Ping { sent, .. }) => {
        self.transport.is_reliable()
        && millis_between(sent, now).0 >= config.probing_interval_millis(PROBE_BYTES)
      },
    }
  }

  /// Record that a keepalive probe with `mid` went out
  pub fn ping_sent(&mut self, mid: Id, now: Instant<C>) {
    self.ping = Some(Ping { mid, sent: now });
  }

  /// The message id of the keepalive probe awaiting its pong, if any
  pub fn ping_outstanding(&self) -> Option<Id> {
    self.ping.as_ref().map(|p| p.mid)
  }

  /// A matching pong (RST to our Empty CON, or 7.03 on streams)
  /// arrived; returns whether it matched the outstanding probe
  pub fn pong_received(&mut self, mid: Id, now: Instant<C>) -> bool {
    match self.ping {
      | Some(Ping { mid: expected, .. }) if expected == mid => {
        self.ping = None;
        self.mark_activity(now);
        true
      },
      | _ => false,
    }
  }

  /// Clamp the session's block size down to `size`; block size never
  /// grows mid-session
  pub fn negotiate_block_size(&mut self, size: u16) {
    self.block_size = self.block_size.min(size.clamp(16, 1024));
  }
}

/// Refused to create a session: the endpoint is at one of its
/// configured session caps
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TooManySessions;

/// All sessions behind one endpoint, keyed by peer address.
pub struct SessionSet<C: Clock> {
  sessions: BTreeMap<SocketAddr, Session<C>>,
}

impl<C: Clock> core::fmt::Debug for SessionSet<C> {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("SessionSet")
     .field("len", &self.sessions.len())
     .finish()
  }
}

impl<C: Clock> Default for SessionSet<C> {
  fn default() -> Self {
    Self { sessions: BTreeMap::new() }
  }
}

impl<C: Clock> SessionSet<C> {
  /// An empty set
  pub fn new() -> Self {
    Default::default()
  }

  /// Borrow the session for `peer`, if one exists
  pub fn get(&self, peer: SocketAddr) -> Option<&Session<C>> {
    self.sessions.get(&peer)
  }

  /// Mutably borrow the session for `peer`, if one exists
  pub fn get_mut(&mut self, peer: SocketAddr) -> Option<&mut Session<C>> {
    self.sessions.get_mut(&peer)
  }

  /// Insert a client session, replacing any prior session with
  /// the peer
  pub fn insert_client(&mut self, session: Session<C>) -> &mut Session<C> {
    let peer = session.peer;
    self.sessions.insert(peer, session);
    self.sessions.get_mut(&peer).unwrap()
  }

  /// Borrow the session for a peer that just sent us a datagram,
  /// creating a server session if none exists.
  ///
  /// Refuses (and the caller should drop the datagram) when the
  /// endpoint is at [`Config::max_idle_sessions`] or, for secured
  /// transports, [`Config::max_handshake_sessions`].
  pub fn get_or_create_server(&mut self,
                              transport: Transport,
                              peer: SocketAddr,
                              now: Instant<C>,
                              config: &Config)
                              -> Result<&mut Session<C>, TooManySessions> {
    if !self.sessions.contains_key(&peer) {
      if transport.is_secure() {
        let handshaking = self.sessions
                              .values()
                              .filter(|s| s.state == SessionState::Handshake)
                              .count();
        if handshaking >= config.max_handshake_sessions as usize {
          return Err(TooManySessions);
        }
      }

      if config.max_idle_sessions > 0
         && self.sessions
                .values()
                .filter(|s| s.kind != SessionKind::Client)
                .count()
            >= config.max_idle_sessions as usize
      {
        return Err(TooManySessions);
      }

      self.sessions
          .insert(peer, Session::server(transport, peer, now, config));
    }

    Ok(self.sessions.get_mut(&peer).unwrap())
  }

  /// Move idle sessions with no outstanding work through
  /// `Closing` into `Disconnected` and sweep them out, yielding the
  /// peers that were dropped.
  pub fn sweep_idle(&mut self,
                    now: Instant<C>,
                    config: &Config,
                    has_outstanding_work: impl Fn(SocketAddr) -> bool)
                    -> std_alloc::vec::Vec<SocketAddr> {
    let timeout_ms = config.session_timeout as u64 * 1000;
    if timeout_ms == 0 {
      return Default::default();
    }

    for session in self.sessions.values_mut() {
      if session.idle_millis(now) >= timeout_ms && !has_outstanding_work(session.peer) {
        session.state = match session.state {
          | SessionState::Closing | SessionState::Disconnected => SessionState::Disconnected,
          | _ => SessionState::Closing,
        };
      }
    }

    let dead = self.sessions
                   .values()
                   .filter(|s| s.state == SessionState::Disconnected)
                   .map(|s| s.peer)
                   .collect::<std_alloc::vec::Vec<_>>();

    for peer in dead.iter() {
      self.sessions.remove(peer);
    }

    dead
  }

  /// Remove a session outright
  pub fn remove(&mut self, peer: SocketAddr) -> Option<Session<C>> {
    self.sessions.remove(&peer)
  }

  /// Iterate all sessions
  pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session<C>> {
    self.sessions.values_mut()
  }

  /// Number of live sessions
  pub fn len(&self) -> usize {
    self.sessions.len()
  }

  /// Whether the set is empty
  pub fn is_empty(&self) -> bool {
    self.sessions.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test::{dummy_addr, dummy_addr_2, ClockMock};

  fn cfg() -> Config {
    Config::default()
  }

  #[test]
  fn mids_increment_and_wrap() {
    let mut sesh = Session::<ClockMock>::client(Transport::Udp,
                                                dummy_addr(),
                                                ClockMock::instant(0),
                                                &cfg());
    let a = sesh.new_mid();
    let b = sesh.new_mid();
    assert_eq!(b.0, a.0.wrapping_add(1));
  }

  #[test]
  fn tokens_are_distinct() {
    let mut sesh = Session::<ClockMock>::client(Transport::Udp,
                                                dummy_addr(),
                                                ClockMock::instant(0),
                                                &cfg());
    assert_ne!(sesh.new_token(), sesh.new_token());
  }

  #[test]
  fn udp_sessions_born_established() {
    let sesh = Session::<ClockMock>::client(Transport::Udp,
                                            dummy_addr(),
                                            ClockMock::instant(0),
                                            &cfg());
    assert_eq!(sesh.state, SessionState::Established);

    let sesh = Session::<ClockMock>::client(Transport::Dtls,
                                            dummy_addr(),
                                            ClockMock::instant(0),
                                            &cfg());
    assert_eq!(sesh.state, SessionState::Handshake);
  }

  #[test]
  fn keepalive_fires_after_inactivity() {
    let mut config = cfg();
    config.ping_interval = 10;

    let mut sesh = Session::<ClockMock>::client(Transport::Udp,
                                                dummy_addr(),
                                                ClockMock::instant(0),
                                                &config);

    assert!(!sesh.wants_ping(ClockMock::instant(9_999), &config));
    assert!(sesh.wants_ping(ClockMock::instant(10_000), &config));

    sesh.ping_sent(Id(7), ClockMock::instant(10_000));
    assert!(!sesh.wants_ping(ClockMock::instant(20_000), &config));

    assert!(!sesh.pong_received(Id(8), ClockMock::instant(10_500)));
    assert!(sesh.pong_received(Id(7), ClockMock::instant(10_500)));
    assert_eq!(sesh.ping_outstanding(), None);
  }

  #[test]
  fn unresponsive_reliable_peer_reprobed_at_probing_rate() {
    let mut config = cfg();
    config.ping_interval = 10;

    let mut sesh = Session::<ClockMock>::client(Transport::Tcp,
                                                dummy_addr(),
                                                ClockMock::instant(0),
                                                &config);
    sesh.established(ClockMock::instant(0));

    assert!(sesh.wants_ping(ClockMock::instant(10_000), &config));
    sesh.ping_sent(Id(1), ClockMock::instant(10_000));

    // PROBING_RATE 1 B/s and a 4-byte probe: 4 seconds between probes
    assert!(!sesh.wants_ping(ClockMock::instant(13_999), &config));
    assert!(sesh.wants_ping(ClockMock::instant(14_000), &config));

    // datagram probes retransmit through the send queue instead
    let mut udp = Session::<ClockMock>::client(Transport::Udp,
                                               dummy_addr(),
                                               ClockMock::instant(0),
                                               &config);
    udp.ping_sent(Id(2), ClockMock::instant(10_000));
    assert!(!udp.wants_ping(ClockMock::instant(60_000), &config));
  }

  #[test]
  fn idle_sessions_swept() {
    let mut set = SessionSet::<ClockMock>::new();
    set.get_or_create_server(Transport::Udp, dummy_addr(), ClockMock::instant(0), &cfg())
       .unwrap();

    // clock advances past session_timeout (300s); two sweeps walk
    // Closing then Disconnected
    let late = ClockMock::instant(301_000);
    assert_eq!(set.sweep_idle(late, &cfg(), |_| false), vec![]);
    assert_eq!(set.sweep_idle(late, &cfg(), |_| false), vec![dummy_addr()]);
    assert!(set.is_empty());
  }

  #[test]
  fn outstanding_work_defers_sweep() {
    let mut set = SessionSet::<ClockMock>::new();
    set.get_or_create_server(Transport::Udp, dummy_addr(), ClockMock::instant(0), &cfg())
       .unwrap();

    let late = ClockMock::instant(301_000);
    set.sweep_idle(late, &cfg(), |_| true);
    set.sweep_idle(late, &cfg(), |_| true);
    assert_eq!(set.len(), 1);
  }

  #[test]
  fn session_caps_enforced() {
    let mut config = cfg();
    config.max_idle_sessions = 1;

    let mut set = SessionSet::<ClockMock>::new();
    assert!(set.get_or_create_server(Transport::Udp,
                                     dummy_addr(),
                                     ClockMock::instant(0),
                                     &config)
               .is_ok());
    assert_eq!(set.get_or_create_server(Transport::Udp,
                                        dummy_addr_2(),
                                        ClockMock::instant(0),
                                        &config)
                  .err(),
               Some(TooManySessions));
  }
}
