use std_alloc::vec::Vec;

use crate::cursor::Cursor;
use crate::from_bytes::TryConsumeBytes;
use crate::TryFromBytes;

/// Message Code
pub mod code;

/// Message parsing errors
pub mod parse_error;

/// Message ID
pub mod id;

/// Message Options
pub mod opt;

/// Message Type
pub mod ty;

/// Message Token
pub mod token;

/// Message Version
pub mod ver;

pub use code::*;
pub use id::*;
pub use opt::*;
pub use parse_error::*;
pub use token::*;
pub use ty::*;
pub use ver::*;

/// The message body. May be empty.
///
/// The payload is opaque to the messaging layer; its format is
/// communicated by the Content-Format option.
#[derive(Clone, Debug, Default, PartialEq, PartialOrd)]
pub struct Payload(pub Vec<u8>);

/// Struct representing the first byte of a message.
///
/// ```text
/// CoAP version
/// |
/// |  Message type (request, response, empty)
/// |  |
/// |  |  Length of token, in bytes. (4-bit integer)
/// |  |  |
/// vv vv vvvv
/// 01 00 0000
/// ```
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub(crate) struct Byte1 {
  pub(crate) ver: Version,
  pub(crate) ty: Type,
  pub(crate) tkl: u8,
}

impl TryFrom<u8> for Byte1 {
  type Error = MessageParseError;

  fn try_from(b: u8) -> Result<Self, Self::Error> {
    let ver = b >> 6; // bits 0 & 1
    let ty = b >> 4 & 0b11; // bits 2 & 3
    let tkl = b & 0b1111u8; // last 4 bits

    Ok(Byte1 { ver: Version(ver),
               ty: Type::try_from(ty)?,
               tkl })
  }
}

/// # `Message` struct
/// Low-level representation of a message that has been parsed from the
/// RFC 7252 datagram framing.
///
/// Options are stored in a [`BTreeMap`](std_alloc::collections::BTreeMap)
/// keyed by [`OptNumber`], so the ascending order the wire format requires
/// is guaranteed by construction. Repeatable options map to multiple
/// [`OptValue`]s under one number.
///
/// Messages support serializing to bytes and parsing from bytes via
/// [`TryFromBytes`] and [`crate::TryIntoBytes`]; the RFC 8323 framing of
/// the same struct lives in [`crate::framed`].
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
  /// see [`Id`] for details
  pub id: Id,
  /// see [`Type`] for details
  pub ty: Type,
  /// see [`Version`] for details
  pub ver: Version,
  /// see [`Token`] for details
  pub token: Token,
  /// see [`Code`] for details
  pub code: Code,
  /// see [`opt::OptionMap`] for details
  pub opts: OptionMap,
  /// see [`Payload`]
  pub payload: Payload,
}

impl Message {
  /// Create a new message with no options or payload
  pub fn new(ty: Type, code: Code, id: Id, token: Token) -> Self {
    Self { id,
           ty,
           token,
           code,
           ver: Default::default(),
           opts: Default::default(),
           payload: Payload(Default::default()) }
  }

  /// Create a new message that ACKs this one.
  ///
  /// The ACK shares the [`Id`] and [`Token`] of the message
  /// being acknowledged and is otherwise Empty; fill `code` and
  /// `payload` in afterwards for a piggybacked response.
  pub fn ack(&self) -> Self {
    Self { id: self.id,
           token: self.token,
           ver: Default::default(),
           ty: Type::Ack,
           code: Code::EMPTY,
           payload: Payload(Default::default()),
           opts: Default::default() }
  }

  /// Create a new Reset message rejecting this one.
  pub fn rst(&self) -> Self {
    Self { id: self.id,
           token: Token(Default::default()),
           ver: Default::default(),
           ty: Type::Reset,
           code: Code::EMPTY,
           payload: Payload(Default::default()),
           opts: Default::default() }
  }

  /// Whether this is an Empty message (code 0.00)
  pub fn is_empty(&self) -> bool {
    self.code == Code::EMPTY
  }

  /// Set a non-repeatable option, replacing any existing values
  pub fn set_option(&mut self, num: OptNumber, value: impl Into<Vec<u8>>) {
    self.opts
        .insert(num, std_alloc::vec![OptValue(value.into())]);
  }

  /// Add a value for a repeatable option
  pub fn add_option(&mut self, num: OptNumber, value: impl Into<Vec<u8>>) {
    self.opts
        .entry(num)
        .or_default()
        .push(OptValue(value.into()));
  }

  /// Remove all values for an option, returning them if any were set
  pub fn remove_option(&mut self, num: OptNumber) -> Option<Vec<OptValue>> {
    self.opts.remove(&num)
  }

  /// Get the first value of an option
  pub fn get_option(&self, num: OptNumber) -> Option<&OptValue> {
    self.opts.get(&num).and_then(|vals| vals.first())
  }

  /// Interpret the first value of an option as a
  /// variable-length big-endian unsigned integer
  pub fn get_uint(&self, num: OptNumber) -> Option<u64> {
    self.get_option(num).map(OptValue::as_uint)
  }

  /// Set a non-repeatable option to a variable-length
  /// big-endian unsigned integer (minimal encoding; zero is empty)
  pub fn set_uint(&mut self, num: OptNumber, value: u64) {
    self.set_option(num, OptValue::uint_bytes(value));
  }

  /// The Uri-Path of this message as `/`-joined utf8, if every
  /// segment is valid utf8
  pub fn path(&self) -> Result<Option<std_alloc::string::String>, core::str::Utf8Error> {
    use std_alloc::string::String;

    match self.opts.get(&known::repeat::PATH) {
      | None => Ok(None),
      | Some(segs) => {
        let mut path = String::new();
        for (ix, seg) in segs.iter().enumerate() {
          if ix > 0 {
            path.push('/');
          }
          path.push_str(core::str::from_utf8(&seg.0)?);
        }
        Ok(Some(path))
      },
    }
  }

  /// Set the Uri-Path from a `/`-separated string
  pub fn set_path(&mut self, path: &str) {
    let segs = path.split('/')
                   .filter(|seg| !seg.is_empty())
                   .map(|seg| OptValue(seg.as_bytes().to_vec()))
                   .collect::<Vec<_>>();
    if segs.is_empty() {
      self.opts.remove(&known::repeat::PATH);
    } else {
      self.opts.insert(known::repeat::PATH, segs);
    }
  }

  /// Block1 option (request body transfer), if present
  pub fn block1(&self) -> Option<known::Block> {
    self.get_uint(known::no_repeat::BLOCK1)
        .map(|n| known::Block::from(n as u32))
  }

  /// Block2 option (response body transfer), if present
  pub fn block2(&self) -> Option<known::Block> {
    self.get_uint(known::no_repeat::BLOCK2)
        .map(|n| known::Block::from(n as u32))
  }

  /// Observe option interpreted as a registration action
  /// (only meaningful on requests)
  pub fn observe_action(&self) -> Option<known::observe::Action> {
    self.get_uint(known::no_repeat::OBSERVE)
        .and_then(|n| u8::try_from(n).ok())
        .and_then(known::observe::Action::from_byte)
  }

  /// Observe option interpreted as a notification sequence number
  /// (only meaningful on responses)
  pub fn observe_seq(&self) -> Option<known::observe::SequenceNumber> {
    self.get_uint(known::no_repeat::OBSERVE)
        .map(|n| known::observe::SequenceNumber::new(n as u32))
  }
}

impl<Bytes: AsRef<[u8]>> TryFromBytes<Bytes> for Message {
  type Error = MessageParseError;

  fn try_from_bytes(bytes: Bytes) -> Result<Self, Self::Error> {
    let mut bytes = Cursor::new(bytes);

    let Byte1 { tkl, ty, ver } = bytes.next()
                                      .ok_or_else(MessageParseError::eof)?
                                      .try_into()?;

    if tkl > 8 {
      return Err(Self::Error::InvalidTokenLength(tkl));
    }

    let code: Code = bytes.next().ok_or_else(MessageParseError::eof)?.into();
    let id: Id = Id::try_consume_bytes(&mut bytes)?;

    let token = bytes.take_exact(tkl as usize)
                     .ok_or_else(MessageParseError::eof)?;
    let token = tinyvec::ArrayVec::<[u8; 8]>::try_from(token).expect("tkl was checked to be <= 8");
    let token = Token(token);

    if code == Code::EMPTY && (tkl > 0 || !bytes.is_exhausted()) {
      return Err(Self::Error::DataAfterEmptyMessage);
    }

    let opts = OptionMap::try_consume_bytes(&mut bytes).map_err(Self::Error::OptParseError)?;
    let payload = Payload(bytes.take_until_end().to_vec());

    Ok(Message { id,
                 ty,
                 ver,
                 code,
                 token,
                 opts,
                 payload })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_msg() {
    let (expect, msg) = crate::test_msg();
    assert_eq!(Message::try_from_bytes(&msg).unwrap(), expect)
  }

  #[test]
  fn parse_byte1() {
    let byte = 0b_01_10_0011u8;
    let byte = Byte1::try_from(byte).unwrap();
    assert_eq!(byte,
               Byte1 { ver: Version(1),
                       ty: Type::Ack,
                       tkl: 3 })
  }

  #[test]
  fn parse_id() {
    let mut id_bytes = Cursor::new(34u16.to_be_bytes());
    let id = Id::try_consume_bytes(&mut id_bytes).unwrap();
    assert_eq!(id, Id(34));
  }

  #[test]
  fn empty_with_token_rejected() {
    // CON 0.00 mid=1 with a 1-byte token
    let bytes = [0b0100_0001u8, 0x00, 0x00, 0x01, 0xFE];
    assert_eq!(Message::try_from_bytes(bytes),
               Err(MessageParseError::DataAfterEmptyMessage));
  }

  #[test]
  fn path_roundtrip() {
    let mut msg = Message::new(Type::Con, Code::GET, Id(1), Token(Default::default()));
    msg.set_path("sensors/temp");
    assert_eq!(msg.path().unwrap().unwrap(), "sensors/temp");
    assert_eq!(msg.opts.get(&known::repeat::PATH).unwrap().len(), 2);
  }

  #[test]
  fn ack_copies_token_and_id() {
    let (msg, _) = crate::test_msg();
    let ack = msg.ack();
    assert_eq!(ack.id, msg.id);
    assert_eq!(ack.token, msg.token);
    assert_eq!(ack.ty, Type::Ack);
    assert!(ack.is_empty());
  }
}
