//! The context: one socket, one clock, and every piece of protocol
//! state needed to be a CoAP client, server, or both at once.
//!
//! [`Core::process`] is the single integration point, mirroring the
//! classic `prepare / wait / do_io` shape: it drains the socket,
//! fires due retransmissions, runs keepalive and expiry sweeps,
//! and then (optionally) waits on the injected [`Wait`] driver until
//! the next timer. All state is confined to the thread driving
//! `process`; nothing here locks.

use embedded_time::duration::Milliseconds;
use embedded_time::Instant;
use newt_msg::known::no_repeat::{BLOCK1, BLOCK2, MAX_AGE, OBSERVE, SIZE1, SIZE2};
use newt_msg::known::observe::Action;
use newt_msg::known::ContentFormat;
use newt_msg::{framed, Code, CodeKind, DefaultCacheKey, CacheKey, Id, Message,
               MessageToBytesError, OptFilter, OptNumber, Payload, Token, TryFromBytes,
               TryIntoBytes, Type};
use no_std_net::SocketAddr;
use std_alloc::collections::BTreeMap;
use std_alloc::vec::Vec;

use crate::block::{Assemblers, BlockError, Direction, Outbound, Progress};
use crate::cache::{Cache, Lookup, Waiter};
use crate::config::Config;
use crate::dedup::{Dedup, Seen};
use crate::net::{Addrd, Socket, Transport};
use crate::observe::Observers;
use crate::resource::{Method, Reply, Resources};
use crate::retry::Strategy;
use crate::sendq::{Fired, NackReason, SendQueue, SendTicket};
use crate::session::{SessionSet, SessionState};
use crate::time::{millis_between, Clock, Millis, Timeout};

/// Events emitted by the core state machine
pub mod event;
pub use event::{Event, MatchEvent};

/// The discovery resource's path
pub const WELL_KNOWN_CORE: &str = ".well-known/core";

/// How long a cacheable response stays fresh when nothing says
/// otherwise (RFC 7252 section 5.10.5: Max-Age defaults to 60)
const DEFAULT_MAX_AGE_MILLIS: u64 = 60_000;

/// Max-Age advice attached to 5.03 responses when block staging
/// is out of space
const BUSY_RETRY_AFTER_SECS: u64 = 10;

/// The readiness wait the event loop parks in between timers.
///
/// The `std` module provides a sleep-based driver; embedded
/// integrators bring their own (or [`NoWait`] to poll externally).
pub trait Wait {
  /// Park for up to `d`; spurious early wakeups are fine
  fn wait(&self, d: Millis);
}

/// A [`Wait`] that returns immediately, for integrations that drive
/// `process` from their own timer
#[derive(Clone, Copy, Debug, Default)]
pub struct NoWait;

impl Wait for NoWait {
  fn wait(&self, _: Millis) {}
}

/// An error encounterable while driving a [`Core`]
#[derive(Debug)]
pub enum Error<SockError> {
  /// Some socket operation failed
  Socket(SockError),
  /// Serializing a message to bytes failed
  ToBytes(MessageToBytesError),
  /// Reading the clock failed
  Clock(embedded_time::clock::Error),
  /// The endpoint is at a configured session cap
  TooManySessions,
  /// NSTART outstanding exchanges with this peer already; try again
  /// after one completes
  NstartExceeded,
}

type Ear<Clk, Sock> = (MatchEvent, fn(&mut Core<Clk, Sock>, &Event));

/// A CoAP endpoint: client, server, or both.
///
/// Generic over the clock and socket so tests (and embedded targets)
/// can substitute deterministic ones.
pub struct Core<Clk: Clock, Sock: Socket> {
  clock: Clk,
  sock: Sock,
  transport: Transport,
  config: Config,
  known_options: OptFilter,

  sessions: SessionSet<Clk>,
  sendq: SendQueue<Clk>,
  dedup: Dedup<Clk>,
  assemblers: Assemblers,
  block_tx: BTreeMap<(SocketAddr, Token), (Outbound, Message)>,
  observers: Observers,
  freshness: crate::observe::FreshnessTracker,
  resources: Resources,
  cache: Cache<Clk>,

  ears: Vec<Ear<Clk, Sock>>,
  deferred: Vec<(u64, Addrd<Message>)>,
  resps: Vec<Addrd<Message>>,
  pongs: Vec<Addrd<Id>>,
  outstanding: BTreeMap<(SocketAddr, Token), Message>,
  stop: bool,
}

impl<Clk: Clock, Sock: Socket> core::fmt::Debug for Core<Clk, Sock> {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Core")
     .field("transport", &self.transport)
     .field("sessions", &self.sessions)
     .field("sendq", &self.sendq)
     .field("resources", &self.resources)
     .finish()
  }
}

impl<Clk: Clock, Sock: Socket> Core<Clk, Sock> {
  /// A UDP endpoint with default config
  pub fn new(clock: Clk, sock: Sock) -> Self {
    Self::new_config(clock, sock, Transport::Udp, Config::default())
  }

  /// An endpoint with explicit transport & config
  pub fn new_config(clock: Clk, sock: Sock, transport: Transport, config: Config) -> Self {
    Self { clock,
           sock,
           transport,
           config,
           known_options: OptFilter::core_options(),
           sessions: SessionSet::new(),
           sendq: SendQueue::new(),
           dedup: Dedup::new(),
           assemblers: Assemblers::new(config.max_block_size as usize * 64),
           block_tx: BTreeMap::new(),
           observers: Observers::new(),
           freshness: crate::observe::FreshnessTracker::new(),
           resources: Resources::new(),
           cache: Cache::new(),
           ears: Vec::new(),
           deferred: Vec::new(),
           resps: Vec::new(),
           pongs: Vec::new(),
           outstanding: BTreeMap::new(),
           stop: false }
  }

  /// The runtime config in effect
  pub fn config(&self) -> &Config {
    &self.config
  }

  /// The served resource set
  pub fn resources_mut(&mut self) -> &mut Resources {
    &mut self.resources
  }

  /// Register `number` as understood, so inbound messages carrying
  /// it critically are not rejected
  pub fn register_option(&mut self, number: OptNumber) {
    self.known_options.set(number);
  }

  /// Listen for events matching `mat`
  pub fn listen(&mut self, mat: MatchEvent, listener: fn(&mut Self, &Event)) {
    self.ears.push((mat, listener));
  }

  /// Convenience for [`MatchEvent::RecvResponse`] listeners
  pub fn register_response_handler(&mut self, f: fn(&mut Self, &Event)) {
    self.listen(MatchEvent::RecvResponse, f);
  }

  /// Convenience for [`MatchEvent::Nack`] listeners
  pub fn register_nack_handler(&mut self, f: fn(&mut Self, &Event)) {
    self.listen(MatchEvent::Nack, f);
  }

  /// Convenience for [`MatchEvent::Ping`] listeners
  pub fn register_ping_handler(&mut self, f: fn(&mut Self, &Event)) {
    self.listen(MatchEvent::Ping, f);
  }

  /// Convenience for [`MatchEvent::Pong`] listeners
  pub fn register_pong_handler(&mut self, f: fn(&mut Self, &Event)) {
    self.listen(MatchEvent::Pong, f);
  }

  /// Fire an event at every matching listener
  pub fn fire(&mut self, event: Event) {
    let ears = self.ears.clone();
    for (mat, work) in ears {
      if mat.matches(&event) {
        work(self, &event);
      }
    }
  }

  /// Ask the next `process` call to return immediately; the flag
  /// stays set until [`Core::clear_stop`]
  pub fn request_stop(&mut self) {
    self.stop = true;
  }

  /// Clear a prior [`Core::request_stop`]
  pub fn clear_stop(&mut self) {
    self.stop = false;
  }

  fn now(&self) -> Result<Instant<Clk>, Error<Sock::Error>> {
    self.clock.try_now().map_err(Error::Clock)
  }

  fn encode(&self, msg: Message) -> Result<Vec<u8>, Error<Sock::Error>> {
    if self.transport.is_reliable() {
      framed::try_into_bytes(msg).map_err(Error::ToBytes)
    } else {
      msg.try_into_bytes().map_err(Error::ToBytes)
    }
  }

  fn transmit(&self, bytes: &[u8], peer: SocketAddr) -> Result<(), Error<Sock::Error>> {
    nb::block!(self.sock.send(Addrd(bytes, peer))).map_err(Error::Socket)
  }

  fn abs_millis(t: Instant<Clk>) -> u64 {
    Millis::try_from(t.duration_since_epoch()).map(|m| m.0)
                                              .unwrap_or(0)
  }

  /// Whether this endpoint listens on a multicast group
  fn via_multicast(&self) -> bool {
    self.sock.local_addr().ip().is_multicast()
  }

  /// Hold a response for a random slice of `DEFAULT_LEISURE`, so
  /// answers to a multicast request don't stampede the network
  /// (RFC 7252 section 8.2)
  fn defer_response(&mut self, msg: Addrd<Message>, now: Instant<Clk>) {
    let strategy = Strategy::Delay { min: Milliseconds(0),
                                     max: self.config.msg.multicast_response_leisure };
    let seed = Self::abs_millis(now).wrapping_add(msg.data().id.0 as u64);
    let delay = strategy.init_millis(seed);

    log::debug!("holding response to {:?} for {}ms of leisure", msg.addr(), delay);
    self.deferred.push((Self::abs_millis(now) + delay, msg));
  }

  // ------------------------------------------------------------------
  // the event loop
  // ------------------------------------------------------------------

  /// One `prepare / wait / do_io` cycle.
  ///
  /// Drains the socket and timers, then waits on `waiter` up to
  /// `min(timeout, next timer)` and drains again. Returns elapsed
  /// milliseconds, or 0 immediately when a stop was requested.
  /// `Timeout::Millis(0)` never waits.
  pub fn process(&mut self,
                 timeout: Timeout,
                 waiter: &impl Wait)
                 -> Result<u64, Error<Sock::Error>> {
    if self.stop {
      return Ok(0);
    }

    let start = self.now()?;
    self.sendq.adjust_basetime(start);
    self.drive(start)?;

    let budget = match timeout {
      | Timeout::Millis(ms) => Some(ms),
      | Timeout::Never => None,
    };

    let wait_for = match (budget, self.next_timer_in(start)) {
      | (Some(0), _) => 0,
      | (Some(b), Some(t)) => b.min(t),
      | (Some(b), None) => b,
      | (None, Some(t)) => t,
      | (None, None) => 0,
    };

    if wait_for > 0 && !self.stop {
      waiter.wait(Millis::new(wait_for));
      let now = self.now()?;
      self.drive(now)?;
    }

    let end = self.now()?;
    Ok(millis_between(start, end).0)
  }

  /// Milliseconds until the next timer-driven action, if any is
  /// scheduled
  pub fn next_timer_in(&self, now: Instant<Clk>) -> Option<u64> {
    let now_ms = Self::abs_millis(now);
    let sendq = self.sendq.next_fire_in(now).map(|m| m.0);
    let cache = self.cache.next_expiry_in(now);
    let leisure = self.deferred
                      .iter()
                      .map(|(at, _)| at.saturating_sub(now_ms))
                      .min();

    [sendq, cache, leisure].into_iter().flatten().min()
  }

  /// The prepare half of the loop, for integrators driving their own
  /// readiness source (select/epoll) instead of [`Core::process`]:
  /// which I/O the endpoint wants right now, and how long until the
  /// next timer fires.
  ///
  /// Feed the answered `can_*` bits back by calling `process` with
  /// `Timeout::Millis(0)` when the socket is readable.
  pub fn prepare_io(&self, now: Instant<Clk>) -> (crate::net::Readiness, Option<u64>) {
    let readiness = crate::net::Readiness { want_read: true,
                                            want_write: !self.sendq.is_empty(),
                                            want_connect: self.transport.is_reliable(),
                                            ..Default::default() };
    (readiness, self.next_timer_in(now))
  }

  fn drive(&mut self, now: Instant<Clk>) -> Result<(), Error<Sock::Error>> {
    // inbound
    while let Some(dgram) = self.sock.poll().map_err(Error::Socket)? {
      self.handle_dgram(dgram, now)?;
    }

    // retransmission timers
    for fired in self.sendq.process_due(now, self.config.msg.con.max_retransmit) {
      match fired {
        | Fired::Resend(msg) => {
          log::trace!("retransmitting {:?} to {:?}", msg.data().id, msg.addr());
          let bytes = self.encode(msg.data().clone())?;
          self.transmit(&bytes, msg.addr())?;
        },
        | Fired::Dead(entry) => {
          self.exchange_dead(entry.peer, entry.token, entry.msg, NackReason::Timeout);
        },
      }
    }

    // leisure-delayed responses that are now due
    let now_ms = Self::abs_millis(now);
    let (due, rest): (Vec<_>, Vec<_>) = self.deferred
                                            .drain(..)
                                            .partition(|(at, _)| *at <= now_ms);
    self.deferred = rest;
    for (_, msg) in due {
      let bytes = self.encode(msg.data().clone())?;
      self.transmit(&bytes, msg.addr())?;
    }

    // keepalive
    self.keepalive(now)?;

    // expiry sweeps
    self.dedup.prune(now, self.config.exchange_lifetime_millis());
    self.cache.sweep(now);
    self.sweep_sessions(now)?;

    Ok(())
  }

  fn keepalive(&mut self, now: Instant<Clk>) -> Result<(), Error<Sock::Error>> {
    let config = self.config;
    let reliable = self.transport.is_reliable();

    let mut probes = Vec::new();
    for session in self.sessions.iter_mut() {
      if session.wants_ping(now, &config) {
        let mid = session.new_mid();
        session.ping_sent(mid, now);
        probes.push(Addrd(mid, session.peer));
      }
    }

    for Addrd(mid, peer) in probes {
      let msg = if reliable {
        Message::new(Type::Non, framed::signal::PING, mid, Token::empty())
      } else {
        Message::new(Type::Con, Code::EMPTY, mid, Token::empty())
      };

      log::debug!("keepalive probe {:?} to {:?}", mid, peer);
      let bytes = self.encode(msg.clone())?;
      self.transmit(&bytes, peer)?;

      if !reliable {
        self.sendq.insert(Addrd(msg, peer),
                          now,
                          self.config.msg.con.unacked_retry_strategy);
      }
    }

    Ok(())
  }

  fn sweep_sessions(&mut self, now: Instant<Clk>) -> Result<(), Error<Sock::Error>> {
    let config = self.config;
    let sendq = &self.sendq;
    let dead = {
      let has_work = |peer: SocketAddr| sendq.has_entries_for(peer);
      self.sessions.sweep_idle(now, &config, has_work)
    };

    for peer in dead {
      log::debug!("session with {:?} expired", peer);

      for entry in self.sendq.cancel_session(peer) {
        self.fire(Event::Nack { msg: Addrd(entry.msg, peer),
                                reason: NackReason::Cancelled });
      }

      self.dedup.forget(peer);
      self.assemblers.forget(peer);
      self.observers.forget_peer(peer);
      self.block_tx.retain(|(p, _), _| *p != peer);
      self.outstanding.retain(|(p, _), _| *p != peer);

      self.fire(Event::SessionExpired(peer));
    }

    Ok(())
  }

  fn exchange_dead(&mut self, peer: SocketAddr, token: Token, msg: Message, reason: NackReason) {
    // a dead keepalive probe means the peer is gone
    let was_ping = self.sessions
                       .get(peer)
                       .and_then(|s| s.ping_outstanding())
                       .map(|mid| mid == msg.id)
                       .unwrap_or(false);
    if was_ping {
      if let Some(session) = self.sessions.get_mut(peer) {
        session.state = SessionState::Disconnected;
      }
    }

    self.observers.on_nack(peer, token);
    self.outstanding.remove(&(peer, token));
    self.fire(Event::Nack { msg: Addrd(msg, peer),
                            reason });
  }

  // ------------------------------------------------------------------
  // outbound
  // ------------------------------------------------------------------

  /// Build a confirmable request addressed to `peer`, with a fresh
  /// message id and token from the peer's session.
  pub fn new_request(&mut self,
                     method: Method,
                     peer: SocketAddr,
                     path: &str)
                     -> Result<Addrd<Message>, Error<Sock::Error>> {
    let now = self.now()?;
    let transport = self.transport;
    let config = self.config;

    let session = match self.sessions.get_mut(peer) {
      | Some(s) => s,
      | None => {
        self.sessions
            .insert_client(crate::session::Session::client(transport, peer, now, &config))
      },
    };

    let mut msg = Message::new(Type::Con, method.code(), session.new_mid(), session.new_token());
    msg.set_path(path);
    Ok(Addrd(msg, peer))
  }

  /// Send a message, consuming it.
  ///
  /// Confirmable messages enter the send queue and will be
  /// retransmitted until ACKed or dead; the returned ticket carries
  /// the identifiers needed to follow the exchange.
  pub fn send_msg(&mut self, msg: Addrd<Message>) -> Result<SendTicket, Error<Sock::Error>> {
    let now = self.now()?;
    let Addrd(mut msg, peer) = msg;
    let transport = self.transport;
    let config = self.config;

    let session = match self.sessions.get_mut(peer) {
      | Some(s) => s,
      | None => {
        self.sessions
            .insert_client(crate::session::Session::client(transport, peer, now, &config))
      },
    };

    // zero ids are placeholders; provision a real one
    if msg.id == Id(0) {
      msg.id = session.new_mid();
    }
    session.mark_activity(now);
    let block_size = session.block_size as usize;

    // request bodies too big for one datagram go out block-wise;
    // continuations ride on the peer's 2.31 Continue replies
    if msg.code.kind() == CodeKind::Request
       && msg.payload.0.len() > block_size
       && msg.get_option(BLOCK1).is_none()
    {
      let body = core::mem::take(&mut msg.payload.0);
      let outbound = Outbound::new(body, block_size as u16, Direction::Request);
      let total = outbound.total_len();
      let (desc, chunk) = outbound.block(0).expect("payload is non-empty");

      msg.payload = Payload(chunk.to_vec());
      msg.set_uint(BLOCK1, u32::from(desc) as u64);
      msg.set_uint(SIZE1, total as u64);

      let mut template = msg.clone();
      template.payload = Payload(Vec::new());
      template.remove_option(BLOCK1);
      template.remove_option(SIZE1);
      self.block_tx.insert((peer, msg.token), (outbound, template));
    }

    if msg.ty == Type::Con
       && msg.code.kind() == CodeKind::Request
       && self.sendq.count_for(peer) >= self.config.nstart as usize
    {
      return Err(Error::NstartExceeded);
    }

    if msg.code.kind() == CodeKind::Request {
      self.outstanding.insert((peer, msg.token), msg.clone());
    }

    let bytes = self.encode(msg.clone())?;
    self.transmit(&bytes, peer)?;

    let ticket = if msg.ty == Type::Con && !self.transport.is_reliable() {
      self.sendq.insert(Addrd(msg, peer),
                        now,
                        self.config.msg.con.unacked_retry_strategy)
    } else {
      SendTicket { id: msg.id,
                   token: msg.token }
    };

    Ok(ticket)
  }

  /// Send a liveness probe: Empty CON on datagram transports,
  /// 7.02 Ping on streams. Poll the answer with [`Core::poll_ping`].
  pub fn ping(&mut self, peer: SocketAddr) -> Result<SendTicket, Error<Sock::Error>> {
    let now = self.now()?;
    let transport = self.transport;
    let config = self.config;

    let session = match self.sessions.get_mut(peer) {
      | Some(s) => s,
      | None => {
        self.sessions
            .insert_client(crate::session::Session::client(transport, peer, now, &config))
      },
    };

    let mid = session.new_mid();
    session.ping_sent(mid, now);

    let msg = if transport.is_reliable() {
      Message::new(Type::Non, framed::signal::PING, mid, Token::empty())
    } else {
      Message::new(Type::Con, Code::EMPTY, mid, Token::empty())
    };

    self.send_msg(Addrd(msg, peer))
  }

  /// Cancel every queued transmission sharing `token` with `peer`,
  /// nacking each with [`NackReason::Cancelled`]
  pub fn cancel_by_token(&mut self, peer: SocketAddr, token: Token) {
    for entry in self.sendq.cancel_by_token(peer, token) {
      self.fire(Event::Nack { msg: Addrd(entry.msg, peer),
                              reason: NackReason::Cancelled });
    }
    self.outstanding.remove(&(peer, token));
  }

  /// Drop every queued transmission for `peer`, nacking each with
  /// `reason`
  pub fn cancel_session_messages(&mut self, peer: SocketAddr, reason: NackReason) {
    for entry in self.sendq.cancel_session(peer) {
      self.fire(Event::Nack { msg: Addrd(entry.msg, peer),
                              reason });
    }
  }

  /// Poll for a response to the exchange identified by `token`.
  ///
  /// Drives one I/O pass, then looks in the response buffer.
  pub fn poll_resp(&mut self,
                   peer: SocketAddr,
                   token: Token)
                   -> nb::Result<Addrd<Message>, Error<Sock::Error>> {
    let now = self.now().map_err(nb::Error::Other)?;
    self.drive(now).map_err(nb::Error::Other)?;

    match self.resps
              .iter()
              .position(|r| r.addr() == peer && r.data().token == token)
    {
      | Some(ix) => Ok(self.resps.swap_remove(ix)),
      | None => Err(nb::Error::WouldBlock),
    }
  }

  /// Poll for the answer to a [`Core::ping`]
  pub fn poll_ping(&mut self,
                   peer: SocketAddr,
                   ticket: SendTicket)
                   -> nb::Result<(), Error<Sock::Error>> {
    let now = self.now().map_err(nb::Error::Other)?;
    self.drive(now).map_err(nb::Error::Other)?;

    match self.pongs
              .iter()
              .position(|p| p.addr() == peer && *p.data() == ticket.id)
    {
      | Some(ix) => {
        self.pongs.swap_remove(ix);
        Ok(())
      },
      | None => Err(nb::Error::WouldBlock),
    }
  }

  /// Push a fresh representation of `path` to every observer.
  ///
  /// Invokes the resource's GET handler once and fans the result out
  /// in registration order as confirmable notifications carrying the
  /// next sequence number.
  pub fn notify(&mut self, path: &str) -> Result<usize, Error<Sock::Error>> {
    let Some((seq, subs)) = self.observers.begin_notify(path) else {
      return Ok(0);
    };

    let reply = {
      let probe = Message::new(Type::Non, Code::GET, Id(0), Token::empty());
      let addr = self.sock.local_addr();
      let probe = Addrd(probe, addr);

      match self.resources
                .lookup(path, probe.data())
                .and_then(|(_, r)| r.handle(Method::Get, &probe))
      {
        | Some(reply) => reply,
        | None => return Ok(0),
      }
    };

    let mut sent = 0;
    for sub in subs {
      let mid = match self.sessions.get_mut(sub.peer) {
        | Some(s) => s.new_mid(),
        | None => Id(0),
      };

      let mut msg = Message::new(Type::Con, reply.code, mid, sub.token);
      msg.set_uint(OBSERVE, seq.value() as u64);
      if let Some(format) = reply.content_format {
        msg.set_option(newt_msg::known::no_repeat::CONTENT_FORMAT, format.bytes());
      }
      msg.payload = Payload(reply.payload.clone());

      self.send_msg(Addrd(msg, sub.peer))?;
      sent += 1;
    }

    Ok(sent)
  }

  // ------------------------------------------------------------------
  // inbound
  // ------------------------------------------------------------------

  fn handle_dgram(&mut self,
                  dgram: Addrd<Vec<u8>>,
                  now: Instant<Clk>)
                  -> Result<(), Error<Sock::Error>> {
    let peer = dgram.addr();
    let transport = self.transport;
    let config = self.config;

    let msgs: Vec<Message> = {
      let session =
        match self.sessions
                  .get_or_create_server(transport, peer, now, &config)
        {
          | Ok(s) => s,
          | Err(_) => {
            log::warn!("dropping datagram from {:?}: session caps reached", peer);
            return Ok(());
          },
        };
      session.mark_activity(now);

      if transport.is_reliable() {
        session.stream.feed(dgram.data());
        let mut msgs = Vec::new();
        loop {
          match session.stream.poll() {
            | Ok(Some(msg)) => msgs.push(msg),
            | Ok(None) => break,
            | Err(e) => {
              log::error!("stream from {:?} poisoned: {:?}", peer, e);
              session.state = SessionState::Disconnected;
              break;
            },
          }
        }
        msgs
      } else {
        match Message::try_from_bytes(dgram.data()) {
          | Ok(msg) => std_alloc::vec![msg],
          | Err(e) => {
            log::error!("dropping malformed datagram from {:?}: {:?}", peer, e);
            self.fire(Event::MsgParseError(Addrd(e, peer)));
            Vec::new()
          },
        }
      }
    };

    self.fire(Event::RecvDgram(dgram));

    for msg in msgs {
      self.handle_msg(Addrd(msg, peer), now)?;
    }

    Ok(())
  }

  fn handle_msg(&mut self,
                msg: Addrd<Message>,
                now: Instant<Clk>)
                -> Result<(), Error<Sock::Error>> {
    let peer = msg.addr();
    log::trace!("<- {:?} {}", peer, crate::logging::msg_summary(msg.data()));

    // dedup every inbound CON over the exchange-lifetime window
    if msg.data().ty == Type::Con {
      match self.dedup.check(peer, msg.data().id, now) {
        | Seen::New => (),
        | Seen::Duplicate(Some(reply)) => {
          log::debug!("duplicate CON {:?}; replaying prior reply", msg.data().id);
          self.transmit(&reply, peer)?;
          return Ok(());
        },
        | Seen::Duplicate(None) => {
          log::debug!("duplicate CON {:?}; dropping", msg.data().id);
          return Ok(());
        },
      }
    }

    match (msg.data().ty, msg.data().code.kind()) {
      | (Type::Con, CodeKind::Empty) => self.handle_ping(msg),
      | (Type::Ack, CodeKind::Empty) => {
        // the CON got through; the real response may follow later
        if let Some(entry) = self.sendq.ack(peer, msg.data().id) {
          self.observers.on_ack(peer, entry.token);
        }
        Ok(())
      },
      | (Type::Reset, _) => self.handle_rst(msg, now),
      | (_, CodeKind::Signal) => self.handle_signal(msg, now),
      | (_, CodeKind::Request) => self.handle_request(msg, now),
      | (_, CodeKind::Response) => self.handle_response(msg, now),
      | (_, CodeKind::Empty) => {
        // NON Empty is senseless; RFC 7252 section 4.3 says reject
        // with Reset, unless it came to a multicast group
        if self.via_multicast() {
          return Ok(());
        }
        let rst = msg.data().rst();
        let bytes = self.encode(rst)?;
        self.transmit(&bytes, peer)
      },
    }
  }

  fn handle_ping(&mut self, msg: Addrd<Message>) -> Result<(), Error<Sock::Error>> {
    // a ping aimed at a multicast group earns no Reset
    if self.via_multicast() {
      return Ok(());
    }

    let peer = msg.addr();
    let id = msg.data().id;

    // pong is an Empty RST echoing the mid
    let bytes = self.encode(msg.data().rst())?;
    self.transmit(&bytes, peer)?;
    self.dedup.record_reply(peer, id, bytes);

    self.fire(Event::Ping(Addrd(id, peer)));
    Ok(())
  }

  fn handle_rst(&mut self,
                msg: Addrd<Message>,
                now: Instant<Clk>)
                -> Result<(), Error<Sock::Error>> {
    let peer = msg.addr();
    let id = msg.data().id;

    // an RST answering our Empty CON is a pong
    let is_pong = self.sessions
                      .get_mut(peer)
                      .map(|s| s.pong_received(id, now))
                      .unwrap_or(false);
    if is_pong {
      self.sendq.cancel_by_mid(peer, id);
      self.pongs.push(Addrd(id, peer));
      self.fire(Event::Pong(Addrd(id, peer)));
      return Ok(());
    }

    // otherwise the peer rejected a CON of ours
    if let Some(entry) = self.sendq.ack(peer, id) {
      self.observers.deregister_by_rst(peer, entry.token);
      self.outstanding.remove(&(peer, entry.token));
      self.fire(Event::Nack { msg: Addrd(entry.msg, peer),
                              reason: NackReason::Rst });
    }

    Ok(())
  }

  fn handle_signal(&mut self,
                   msg: Addrd<Message>,
                   now: Instant<Clk>)
                   -> Result<(), Error<Sock::Error>> {
    let peer = msg.addr();
    let code = msg.data().code;

    if code == framed::signal::CSM {
      if let Some(session) = self.sessions.get_mut(peer) {
        if let Some(max) = msg.data().get_uint(framed::signal::OPT_MAX_MESSAGE_SIZE) {
          session.mtu = max.min(u16::MAX as u64) as u16;
        }
        session.established(now);
      }
      Ok(())
    } else if code == framed::signal::PING {
      let pong = Message::new(Type::Non, framed::signal::PONG, Id(0), msg.data().token);
      let bytes = self.encode(pong)?;
      self.transmit(&bytes, peer)?;
      self.fire(Event::Ping(Addrd(msg.data().id, peer)));
      Ok(())
    } else if code == framed::signal::PONG {
      let id = msg.data().id;
      if self.sessions
             .get_mut(peer)
             .map(|s| s.pong_received(id, now))
             .unwrap_or(false)
      {
        self.pongs.push(Addrd(id, peer));
        self.fire(Event::Pong(Addrd(id, peer)));
      }
      Ok(())
    } else {
      // Release / Abort: the peer is done with us
      log::debug!("peer {:?} signalled {:?}; closing session", peer, code);
      if let Some(session) = self.sessions.get_mut(peer) {
        session.state = SessionState::Disconnected;
      }
      Ok(())
    }
  }

  fn handle_response(&mut self,
                     mut msg: Addrd<Message>,
                     _now: Instant<Clk>)
                     -> Result<(), Error<Sock::Error>> {
    let peer = msg.addr();
    let token = msg.data().token;

    // a response carrying a critical option we don't understand is
    // rejected with Reset
    if let Some(num) = self.known_options.first_unknown_critical(msg.data()) {
      log::debug!("response from {:?} carries unknown critical option {:?}", peer, num);
      if !self.via_multicast() {
        let bytes = self.encode(msg.data().rst())?;
        self.transmit(&bytes, peer)?;
      }
      return Ok(());
    }

    match msg.data().ty {
      | Type::Ack => {
        // piggybacked response: the ACK half retires the CON
        if let Some(entry) = self.sendq.ack(peer, msg.data().id) {
          self.observers.on_ack(peer, entry.token);
        }
      },
      | Type::Con => {
        // separate response: ACK it, then match by token
        let ack = msg.data().ack();
        let bytes = self.encode(ack)?;
        self.transmit(&bytes, peer)?;
        self.dedup.record_reply(peer, msg.data().id, bytes);
        self.sendq.cancel_by_token(peer, token);
      },
      | _ => (),
    }

    // 2.31 Continue: the peer took a block of our request body;
    // send the next one
    if msg.data().code == Code::new(2, 31) {
      if let Some(echoed) = msg.data().block1() {
        self.continue_block1(peer, token, echoed)?;
      }
      return Ok(());
    }

    // block-wise response body: accumulate, and ask for the next
    // chunk until M=0
    if let Some(block2) = msg.data().block2() {
      let body = msg.data().payload.0.clone();
      match self.assemblers
                .feed(peer, token, Direction::Response, block2, &body)
      {
        | Ok(Progress::Partial { next }) => {
          if let Some(original) = self.outstanding.get(&(peer, token)).cloned() {
            let mut follow_up = original;
            follow_up.id = Id(0);
            follow_up.set_uint(BLOCK2,
                               u32::from(newt_msg::known::Block::new(block2.size(), next, false))
                               as u64);
            self.send_msg(Addrd(follow_up, peer))?;
          }
          return Ok(());
        },
        | Ok(Progress::Done(assembled)) => {
          msg.data_mut().payload = Payload(assembled);
          msg.data_mut().remove_option(BLOCK2);
        },
        | Err(e) => {
          log::error!("block2 reassembly with {:?} failed: {:?}", peer, e);
          return Ok(());
        },
      }
    }

    // stale observe notifications are dropped
    if let Some(seq) = msg.data().observe_seq() {
      if !self.freshness.accept(peer, token, seq) {
        log::debug!("dropping stale notification (seq {:?}) from {:?}", seq.value(), peer);
        return Ok(());
      }
    } else {
      self.outstanding.remove(&(peer, token));
    }

    self.resps.push(msg.clone());
    self.fire(Event::RecvResponse(msg));
    Ok(())
  }

  fn handle_request(&mut self,
                    mut msg: Addrd<Message>,
                    now: Instant<Clk>)
                    -> Result<(), Error<Sock::Error>> {
    let peer = msg.addr();

    // a request carrying a critical option we don't understand is
    // rejected with 4.02 Bad Option
    if let Some(num) = self.known_options.first_unknown_critical(msg.data()) {
      log::debug!("request from {:?} carries unknown critical option {:?}", peer, num);
      return self.respond(&msg, Reply::just(crate::code::BAD_OPTION)).map(|_| ());
    }

    self.fire(Event::RecvRequest(msg.clone()));

    // block-wise request body
    if let Some(block1) = msg.data().block1() {
      let body = msg.data().payload.0.clone();
      let token = msg.data().token;

      match self.assemblers
                .feed(peer, token, Direction::Request, block1, &body)
      {
        | Ok(Progress::Partial { .. }) => {
          // 2.31 Continue, echoing the block we took
          let mut extra = Message::new(Type::Ack, Code::new(2, 31), msg.data().id, token);
          extra.set_uint(BLOCK1, u32::from(block1) as u64);
          let bytes = self.encode(extra)?;
          self.transmit(&bytes, peer)?;
          self.dedup.record_reply(peer, msg.data().id, bytes);
          return Ok(());
        },
        | Ok(Progress::Done(assembled)) => {
          msg.data_mut().payload = Payload(assembled);
          msg.data_mut().remove_option(BLOCK1);
        },
        | Err(BlockError::OutOfOrder { expected, got }) => {
          log::debug!("block1 from {:?} out of order: wanted {}, got {}", peer, expected, got);
          return self.respond(&msg, Reply::just(crate::code::REQUEST_ENTITY_INCOMPLETE))
                     .map(|_| ());
        },
        | Err(BlockError::TooLarge) => {
          let reply = Reply::just(crate::code::SERVICE_UNAVAILABLE);
          return self.respond_with(&msg, reply, |resp| {
                       resp.set_uint(MAX_AGE, BUSY_RETRY_AFTER_SECS);
                     })
                     .map(|_| ());
        },
      }
    }

    let path = match msg.data().path() {
      | Ok(p) => p.unwrap_or_default(),
      | Err(_) => {
        return self.respond(&msg, Reply::just(crate::code::BAD_OPTION)).map(|_| ());
      },
    };

    // a Block2 continuation asks for one more chunk of a response
    // we've already computed
    if let Some(block2) = msg.data().block2() {
      if block2.num() > 0 {
        return self.continue_block2(&msg, block2);
      }
    }

    let method = match Method::from_code(msg.data().code) {
      | Some(m) => m,
      | None => {
        return self.respond(&msg, Reply::just(crate::code::METHOD_NOT_ALLOWED)).map(|_| ());
      },
    };

    // the request cache: answer hits, coalesce concurrent identical
    // builds, fall through on miss
    // observe traffic must reach the registry, never a cached copy
    let fingerprint = self.fingerprint(msg.data());
    let coalesce = method == Method::Get && msg.data().observe_action().is_none();
    if coalesce {
      match self.cache.lookup(fingerprint, now) {
        | Lookup::Hit(cached) => {
          log::trace!("cache hit for {:?}", path);
          let waiter = Waiter { peer,
                                id: msg.data().id,
                                token: msg.data().token };
          let mut copy = Cache::<Clk>::readdress(&cached, &waiter);
          if self.via_multicast() {
            copy.data_mut().ty = Type::Non;
            self.defer_response(copy, now);
            return Ok(());
          }
          copy.data_mut().ty = if msg.data().ty == Type::Con { Type::Ack } else { Type::Non };
          let bytes = self.encode(copy.data().clone())?;
          self.transmit(&bytes, peer)?;
          self.dedup.record_reply(peer, msg.data().id, bytes);
          return Ok(());
        },
        | Lookup::InFlight => {
          self.cache.join(fingerprint,
                          Waiter { peer,
                                   id: msg.data().id,
                                   token: msg.data().token });
          return Ok(());
        },
        | Lookup::Miss => {
          self.cache.build(fingerprint);
        },
      }
    }

    let reply = if path == WELL_KNOWN_CORE {
      match method {
        | Method::Get => {
          Some(Reply::content(self.resources.well_known_core().into_bytes())
                     .with_format(ContentFormat::LinkFormat))
        },
        | _ => Some(Reply::just(crate::code::METHOD_NOT_ALLOWED)),
      }
    } else {
      match self.resources.lookup(&path, msg.data()) {
        | None => Some(Reply::just(crate::code::NOT_FOUND)),
        | Some((_, resource)) => {
          let observable = resource.is_observable();
          let reply = resource.handle(method, &msg);

          // observe registration rides on a successful GET
          if observable && method == Method::Get {
            match msg.data().observe_action() {
              | Some(Action::Register) => {
                self.observers
                    .register(&path, peer, msg.data().token);
              },
              | Some(Action::Deregister) => {
                self.observers
                    .deregister(&path, peer, msg.data().token);
              },
              | None => (),
            }
          }

          Some(reply.unwrap_or_else(|| Reply::just(crate::code::METHOD_NOT_ALLOWED)))
        },
      }
    };

    let reply = reply.expect("every dispatch arm yields a reply");
    let cacheable = coalesce && reply.code.class == 2;
    if coalesce && !cacheable {
      self.cache.abandon(fingerprint);
    }

    let resp = self.respond(&msg, reply)?;

    if cacheable {
      let waiters = self.cache
                        .fill(fingerprint, resp, now, DEFAULT_MAX_AGE_MILLIS);
      for waiter in waiters {
        if let Lookup::Hit(cached) = self.cache.lookup(fingerprint, now) {
          let copy = Cache::<Clk>::readdress(&cached, &waiter);
          if self.via_multicast() {
            self.defer_response(copy, now);
          } else {
            let bytes = self.encode(copy.data().clone())?;
            self.transmit(&bytes, waiter.peer)?;
          }
        }
      }
    }

    Ok(())
  }

  fn fingerprint(&self, msg: &Message) -> u64 {
    let ignored = self.config
                      .cache_ignored_options
                      .iter()
                      .map(|n| OptNumber(*n as u32))
                      .collect::<Vec<_>>();
    DefaultCacheKey::ignoring(ignored).cache_key(msg)
  }

  /// The peer accepted block `echoed` of a request body we are
  /// sending; push the next block, or clean up when done
  fn continue_block1(&mut self,
                     peer: SocketAddr,
                     token: Token,
                     echoed: newt_msg::known::Block)
                     -> Result<(), Error<Sock::Error>> {
    let next = match self.block_tx.get_mut(&(peer, token)) {
      | Some((outbound, template)) if outbound.direction() == Direction::Request => {
        outbound.negotiate(echoed.size());
        outbound.block(echoed.num() + 1)
                .map(|(desc, chunk)| (desc, chunk.to_vec(), template.clone()))
      },
      | _ => None,
    };

    let Some((desc, chunk, template)) = next else {
      self.block_tx.remove(&(peer, token));
      return Ok(());
    };

    let mut req = template;
    req.id = Id(0);
    req.payload = Payload(chunk);
    req.set_uint(BLOCK1, u32::from(desc) as u64);

    let last = !desc.more();
    self.send_msg(Addrd(req, peer))?;
    if last {
      self.block_tx.remove(&(peer, token));
    }
    Ok(())
  }

  /// Serve block `NUM > 0` of an already-computed blocked response
  fn continue_block2(&mut self,
                     req: &Addrd<Message>,
                     block2: newt_msg::known::Block)
                     -> Result<(), Error<Sock::Error>> {
    let peer = req.addr();
    let token = req.data().token;

    let served = match self.block_tx.get_mut(&(peer, token)) {
      | None => None,
      | Some((outbound, template)) => {
        outbound.negotiate(block2.size());
        outbound.block(block2.num())
                .map(|(desc, chunk)| (desc, chunk.to_vec(), template.clone()))
      },
    };

    let Some((desc, chunk, template)) = served else {
      return self.respond(req, Reply::just(crate::code::REQUEST_ENTITY_INCOMPLETE))
                 .map(|_| ());
    };

    let mut resp = template;
    resp.id = req.data().id;
    resp.token = token;
    resp.ty = if req.data().ty == Type::Con { Type::Ack } else { Type::Non };
    resp.payload = Payload(chunk);
    resp.set_uint(BLOCK2, u32::from(desc) as u64);

    let last = !desc.more();
    let bytes = self.encode(resp)?;
    self.transmit(&bytes, peer)?;
    self.dedup.record_reply(peer, req.data().id, bytes);

    if last {
      self.block_tx.remove(&(peer, token));
    }
    Ok(())
  }

  fn respond(&mut self, req: &Addrd<Message>, reply: Reply) -> Result<Message, Error<Sock::Error>> {
    self.respond_with(req, reply, |_| ())
  }

  /// Build and transmit the response to `req`, applying `tweak`
  /// before encoding. Handles piggybacking, block2 splitting of
  /// large bodies, and the dedup replay record. Returns the
  /// response as sent.
  fn respond_with(&mut self,
                  req: &Addrd<Message>,
                  reply: Reply,
                  tweak: impl FnOnce(&mut Message))
                  -> Result<Message, Error<Sock::Error>> {
    let peer = req.addr();
    let token = req.data().token;
    let mcast = self.via_multicast();

    // responses to multicast requests are never piggybacked
    let ty = match req.data().ty {
      | Type::Con if !mcast => Type::Ack,
      | _ => Type::Non,
    };
    let id = match ty {
      | Type::Ack => req.data().id,
      | _ => {
        self.sessions
            .get_mut(peer)
            .map(|s| s.new_mid())
            .unwrap_or(Id(0))
      },
    };

    let mut resp = Message::new(ty, reply.code, id, token);
    if let Some(format) = reply.content_format {
      resp.set_option(newt_msg::known::no_repeat::CONTENT_FORMAT, format.bytes());
    }
    if let Some(etag) = reply.etag {
      resp.add_option(newt_msg::known::repeat::ETAG, etag);
    }

    // the reply to a successful register carries a sequence number
    // baseline
    if req.data().observe_action() == Some(Action::Register) && reply.code.class == 2 {
      resp.set_uint(OBSERVE, 0);
    }

    let block_size = self.sessions
                         .get(peer)
                         .map(|s| s.block_size)
                         .unwrap_or(self.config.max_block_size) as usize;

    if reply.payload.len() > block_size {
      // too big for one datagram: stash the body and serve block 0
      let requested = req.data().block2();
      let size = requested.map(|b| b.size().min(block_size as u16))
                          .unwrap_or(block_size as u16);

      let outbound = Outbound::new(reply.payload, size, Direction::Response);
      let total = outbound.total_len();
      let (desc, chunk) = outbound.block(0).expect("payload is non-empty");

      resp.payload = Payload(chunk.to_vec());
      resp.set_uint(BLOCK2, u32::from(desc) as u64);
      resp.set_uint(SIZE2, total as u64);

      let mut template = resp.clone();
      template.payload = Payload(Vec::new());
      template.remove_option(BLOCK2);
      template.remove_option(SIZE2);
      self.block_tx.insert((peer, token), (outbound, template));
    } else {
      resp.payload = Payload(reply.payload);
    }

    tweak(&mut resp);

    if mcast {
      // RFC 7252 section 8.2: errors to multicast requests are
      // suppressed, and successes leave after a leisure delay
      if resp.code.class != 2 {
        log::debug!("suppressing {:?} to multicast request from {:?}", resp.code, peer);
        return Ok(resp);
      }
      let now = self.now()?;
      self.defer_response(Addrd(resp.clone(), peer), now);
      return Ok(resp);
    }

    log::trace!("-> {:?} {}", peer, crate::logging::msg_summary(&resp));
    let bytes = self.encode(resp.clone())?;
    self.transmit(&bytes, peer)?;

    if req.data().ty == Type::Con {
      self.dedup.record_reply(peer, req.data().id, bytes);
    }

    Ok(resp)
  }

  /// The unanswered requests currently tracked for `peer`
  pub fn outstanding_for(&self, peer: SocketAddr) -> usize {
    self.outstanding.keys().filter(|(p, _)| *p == peer).count()
  }
}
