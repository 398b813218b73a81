use newt_msg::{Id, Message, MessageParseError};
use no_std_net::SocketAddr;
use std_alloc::vec::Vec;

use crate::net::Addrd;
use crate::sendq::NackReason;

/// A state transition in the runtime, visible to registered
/// listeners.
///
/// Events fire *after* the runtime's own bookkeeping for them has
/// happened; listeners observe, they don't veto.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
  /// Raw bytes arrived from the socket
  RecvDgram(Addrd<Vec<u8>>),
  /// A datagram failed to parse and was dropped
  MsgParseError(Addrd<MessageParseError>),
  /// A request reached the server path (post-dedup, pre-dispatch)
  RecvRequest(Addrd<Message>),
  /// A response was matched to an outstanding exchange
  RecvResponse(Addrd<Message>),
  /// A peer pinged us (we already answered)
  Ping(Addrd<Id>),
  /// A ping of ours was answered
  Pong(Addrd<Id>),
  /// A confirmable transmission died
  Nack {
    /// The message that will never be delivered
    msg: Addrd<Message>,
    /// Why
    reason: NackReason,
  },
  /// An idle session was torn down
  SessionExpired(SocketAddr),
}

/// Pattern for subscribing to [`Event`]s
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchEvent {
  /// Match every event
  All,
  #[allow(missing_docs)]
  RecvDgram,
  #[allow(missing_docs)]
  MsgParseError,
  #[allow(missing_docs)]
  RecvRequest,
  #[allow(missing_docs)]
  RecvResponse,
  #[allow(missing_docs)]
  Ping,
  #[allow(missing_docs)]
  Pong,
  #[allow(missing_docs)]
  Nack,
  #[allow(missing_docs)]
  SessionExpired,
}

impl MatchEvent {
  /// Does this pattern select `event`?
  pub fn matches(&self, event: &Event) -> bool {
    matches!((self, event),
             | (MatchEvent::All, _)
             | (MatchEvent::RecvDgram, Event::RecvDgram(_))
             | (MatchEvent::MsgParseError, Event::MsgParseError(_))
             | (MatchEvent::RecvRequest, Event::RecvRequest(_))
             | (MatchEvent::RecvResponse, Event::RecvResponse(_))
             | (MatchEvent::Ping, Event::Ping(_))
             | (MatchEvent::Pong, Event::Pong(_))
             | (MatchEvent::Nack, Event::Nack { .. })
             | (MatchEvent::SessionExpired, Event::SessionExpired(_)))
  }
}
