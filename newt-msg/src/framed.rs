//! RFC 8323 framing of CoAP messages over reliable byte streams.
//!
//! Reliable transports carry no message id and no type nibble; the
//! fixed 4-byte header is replaced by a variable length prefix:
//!
//! ```text
//!  0                   1
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | Len=13| TKL   | Ext. Length   | ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! `Len` counts the bytes starting at the first Options byte. Values
//! 13, 14 and 15 pull 1, 2 or 4 extension bytes holding `len - 13`,
//! `len - 269` and `len - 65805` respectively.
//!
//! Decoded messages surface as ordinary [`Message`]s with
//! `ty = Non` and `id = Id(0)`; neither field exists on the wire.

use std_alloc::vec::Vec;

use crate::cursor::Cursor;
use crate::from_bytes::TryConsumeBytes;
use crate::to_bytes::encode_opts;
use crate::{Code, Id, Message, MessageParseError, MessageToBytesError, OptionMap, Payload, Token,
            Type, Version};

/// Signalling codes (RFC 8323 section 5); only meaningful on
/// reliable transports
pub mod signal {
  use crate::Code;

  /// Capabilities and Settings, exchanged on connect
  pub const CSM: Code = Code::new(7, 1);
  /// Ping: elicits a Pong, keeping the connection alive
  pub const PING: Code = Code::new(7, 2);
  /// Pong: answers a Ping
  pub const PONG: Code = Code::new(7, 3);
  /// Release: graceful shutdown of the connection
  pub const RELEASE: Code = Code::new(7, 4);
  /// Abort: the sender is unable to continue the connection
  pub const ABORT: Code = Code::new(7, 5);

  /// CSM option: largest message the sender can receive
  pub const OPT_MAX_MESSAGE_SIZE: crate::OptNumber = crate::OptNumber(2);
  /// CSM option: sender supports block-wise transfers
  pub const OPT_BLOCK_WISE_TRANSFER: crate::OptNumber = crate::OptNumber(4);
}

/// Errors encounterable while decoding a frame from a stream
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FrameError {
  /// Not enough bytes buffered to decode a whole frame yet.
  /// Read more from the stream and try again.
  Incomplete,
  /// The frame header or body was malformed
  Parse(MessageParseError),
}

/// Serialize a message with the stream framing. `msg.id` and
/// `msg.ty` are not encoded.
pub fn try_into_bytes(msg: Message) -> Result<Vec<u8>, MessageToBytesError> {
  let mut body = Vec::new();
  encode_opts(&msg.opts, &mut body)?;
  if !msg.payload.0.is_empty() {
    body.push(0b11111111);
    body.extend(msg.payload.0);
  }

  let tkl = msg.token.len() as u8;
  let mut bytes = Vec::with_capacity(body.len() + msg.token.len() + 6);

  match body.len() {
    | n if n < 13 => bytes.push((n as u8) << 4 | tkl),
    | n if n < 269 => {
      bytes.push(13 << 4 | tkl);
      bytes.push((n - 13) as u8);
    },
    | n if n < 65805 => {
      bytes.push(14 << 4 | tkl);
      bytes.extend(((n - 269) as u16).to_be_bytes());
    },
    | n => {
      bytes.push(15 << 4 | tkl);
      bytes.extend(((n - 65805) as u32).to_be_bytes());
    },
  }

  bytes.push(msg.code.into());
  bytes.extend(msg.token.0);
  bytes.extend(body);

  Ok(bytes)
}

/// Decode one frame from the front of `bytes`.
///
/// On success yields the message and the total number of bytes the
/// frame occupied; [`FrameError::Incomplete`] means the buffer holds
/// only a partial frame.
pub fn try_from_bytes(bytes: &[u8]) -> Result<(Message, usize), FrameError> {
  let mut cur = Cursor::new(bytes);
  let byte1 = cur.next().ok_or(FrameError::Incomplete)?;

  let len_nibble = byte1 >> 4;
  let tkl = byte1 & 0b1111;

  if tkl > 8 {
    return Err(FrameError::Parse(MessageParseError::InvalidTokenLength(tkl)));
  }

  let len = match len_nibble {
    | 13 => cur.next().ok_or(FrameError::Incomplete)? as usize + 13,
    | 14 => match cur.take_exact(2) {
      | Some(&[a, b]) => u16::from_be_bytes([a, b]) as usize + 269,
      | _ => return Err(FrameError::Incomplete),
    },
    | 15 => match cur.take_exact(4) {
      | Some(&[a, b, c, d]) => u32::from_be_bytes([a, b, c, d]) as usize + 65805,
      | _ => return Err(FrameError::Incomplete),
    },
    | n => n as usize,
  };

  let code: Code = cur.next().ok_or(FrameError::Incomplete)?.into();

  let token = match cur.take_exact(tkl as usize) {
    | Some(bs) => Token(tinyvec::ArrayVec::try_from(bs).expect("tkl was checked to be <= 8")),
    | None => return Err(FrameError::Incomplete),
  };

  if cur.remaining() < len {
    return Err(FrameError::Incomplete);
  }

  let consumed_header = bytes.len() - cur.remaining();
  let mut body = Cursor::new(cur.take(len));

  let opts = OptionMap::try_consume_bytes(&mut body).map_err(|e| {
                                                      FrameError::Parse(MessageParseError::OptParseError(e))
                                                    })?;
  let payload = Payload(body.take_until_end().to_vec());

  Ok((Message { id: Id(0),
                ty: Type::Non,
                ver: Version::default(),
                token,
                code,
                opts,
                payload },
      consumed_header + len))
}

/// Incremental decoder for a byte stream carrying framed messages.
///
/// Feed it whatever the transport produced (however it was chunked)
/// and poll complete messages out; partial frames stay buffered.
#[derive(Clone, Debug, Default)]
pub struct StreamDecoder {
  buf: Vec<u8>,
}

impl StreamDecoder {
  /// A decoder with an empty buffer
  pub fn new() -> Self {
    Default::default()
  }

  /// Append bytes read from the stream
  pub fn feed(&mut self, bytes: &[u8]) {
    self.buf.extend_from_slice(bytes);
  }

  /// Try to decode the next complete frame.
  ///
  /// `Ok(None)` means more bytes are needed. A parse error poisons
  /// the stream; the caller should abort the connection.
  pub fn poll(&mut self) -> Result<Option<Message>, MessageParseError> {
    if self.buf.is_empty() {
      return Ok(None);
    }

    match try_from_bytes(&self.buf) {
      | Ok((msg, consumed)) => {
        self.buf.drain(..consumed);
        Ok(Some(msg))
      },
      | Err(FrameError::Incomplete) => Ok(None),
      | Err(FrameError::Parse(e)) => Err(e),
    }
  }

  /// The number of buffered bytes not yet decoded
  pub fn pending(&self) -> usize {
    self.buf.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::OptNumber;

  fn ping() -> Message {
    Message::new(Type::Non, signal::PING, Id(0), Token::empty())
  }

  #[test]
  fn tiny_frame() {
    // Ping: no token, no options, no payload => Len = 0
    let bytes = try_into_bytes(ping()).unwrap();
    assert_eq!(bytes, vec![0x00, 0xE2]);

    let (msg, consumed) = try_from_bytes(&bytes).unwrap();
    assert_eq!(consumed, 2);
    assert_eq!(msg.code, signal::PING);
  }

  #[test]
  fn roundtrip_with_options_and_payload() {
    let mut msg = Message::new(Type::Non, Code::new(2, 5), Id(0), Token::opaque(b"x"));
    msg.set_path("big/resource");
    msg.payload = Payload(vec![0xAB; 400]);

    let bytes = try_into_bytes(msg.clone()).unwrap();
    // body > 269 bytes => nibble 14 + 2 extension bytes
    assert_eq!(bytes[0] >> 4, 14);

    let (decoded, consumed) = try_from_bytes(&bytes).unwrap();
    assert_eq!(consumed, bytes.len());
    assert_eq!(decoded.token, msg.token);
    assert_eq!(decoded.opts, msg.opts);
    assert_eq!(decoded.payload, msg.payload);
  }

  #[test]
  fn csm_roundtrip() {
    let mut csm = Message::new(Type::Non, signal::CSM, Id(0), Token::empty());
    csm.set_uint(signal::OPT_MAX_MESSAGE_SIZE, 1152);

    let bytes = try_into_bytes(csm.clone()).unwrap();
    let (decoded, _) = try_from_bytes(&bytes).unwrap();
    assert_eq!(decoded.code, signal::CSM);
    assert_eq!(decoded.get_uint(OptNumber(2)), Some(1152));
  }

  #[test]
  fn stream_decoder_handles_partial_reads() {
    let mut msg = Message::new(Type::Non, Code::new(0, 1), Id(0), Token::opaque(b"t"));
    msg.set_path("time");
    let bytes = try_into_bytes(msg.clone()).unwrap();

    let mut dec = StreamDecoder::new();

    // drip-feed one byte at a time; nothing decodes until the end
    for b in &bytes[..bytes.len() - 1] {
      dec.feed(&[*b]);
      assert_eq!(dec.poll().unwrap(), None);
    }

    dec.feed(&bytes[bytes.len() - 1..]);
    let decoded = dec.poll().unwrap().unwrap();
    assert_eq!(decoded.token, msg.token);
    assert_eq!(dec.pending(), 0);
  }

  #[test]
  fn stream_decoder_splits_coalesced_frames() {
    let a = try_into_bytes(ping()).unwrap();
    let b = try_into_bytes(Message::new(Type::Non, signal::PONG, Id(0), Token::empty())).unwrap();

    let mut dec = StreamDecoder::new();
    dec.feed(&[a, b].concat());

    assert_eq!(dec.poll().unwrap().unwrap().code, signal::PING);
    assert_eq!(dec.poll().unwrap().unwrap().code, signal::PONG);
    assert_eq!(dec.poll().unwrap(), None);
  }
}
