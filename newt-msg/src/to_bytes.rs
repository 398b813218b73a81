use std_alloc::vec::Vec;

use crate::*;

/// The largest length (option delta or value) expressible by the
/// 4-bit nibble plus its 2-byte extension
pub(crate) const MAX_OPT_LEN: u32 = 269 + u16::MAX as u32;

/// Trait allowing fallible conversion into bytes
pub trait TryIntoBytes {
  /// Error yielded when conversion fails
  type Error;

  /// Try to convert into a heap-allocated collection of bytes
  ///
  /// ```
  /// use newt_msg::{Code, Id, Message, Token, TryIntoBytes, Type};
  ///
  /// let msg = Message::new(Type::Con, Code::GET, Id(1), Token::empty());
  /// let bytes: Vec<u8> = msg.try_into_bytes().unwrap();
  /// ```
  fn try_into_bytes(self) -> Result<Vec<u8>, Self::Error>;
}

/// Errors encounterable serializing to bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessageToBytesError {
  /// An option value was longer than the length extension can express
  /// (269 + 65535 bytes)
  OptionValueTooLong {
    /// the offending option
    num: OptNumber,
    /// its value's length
    len: usize,
  },
  /// The gap between two consecutive option numbers was larger than
  /// the delta extension can express
  OptionDeltaTooLarge(OptNumber),
}

pub(crate) fn encode_opts(opts: &OptionMap,
                          bytes: &mut Vec<u8>)
                          -> Result<(), MessageToBytesError> {
  let mut prev = 0u32;

  for (num, vals) in opts.iter() {
    for (ix, val) in vals.iter().enumerate() {
      // repeats after the first encode with a delta of zero
      let delta = if ix == 0 { num.0 - prev } else { 0 };

      if delta > MAX_OPT_LEN {
        return Err(MessageToBytesError::OptionDeltaTooLarge(*num));
      }

      if val.0.len() as u32 > MAX_OPT_LEN {
        return Err(MessageToBytesError::OptionValueTooLong { num: *num,
                                                             len: val.0.len() });
      }

      Opt { delta: OptDelta(delta as u16),
            value: val.clone() }.extend_bytes(bytes);
    }
    prev = num.0;
  }

  Ok(())
}

impl TryIntoBytes for Message {
  type Error = MessageToBytesError;

  fn try_into_bytes(self) -> Result<Vec<u8>, Self::Error> {
    let opts_size: usize = self.opts
                               .values()
                               .flatten()
                               .map(|v| 5 + v.0.len())
                               .sum();
    let mut bytes = Vec::with_capacity(5 + self.token.len() + opts_size + self.payload.0.len());

    let byte1: u8 = Byte1 { tkl: self.token.len() as u8,
                            ver: self.ver,
                            ty: self.ty }.into();
    let code: u8 = self.code.into();
    let id: [u8; 2] = self.id.into();

    bytes.push(byte1);
    bytes.push(code);

    bytes.extend(id);
    bytes.extend(self.token.0);

    encode_opts(&self.opts, &mut bytes)?;

    if !self.payload.0.is_empty() {
      bytes.push(0b11111111);
      bytes.extend(self.payload.0);
    }

    Ok(bytes)
  }
}

impl From<Id> for [u8; 2] {
  fn from(id: Id) -> [u8; 2] {
    id.0.to_be_bytes()
  }
}

impl From<Type> for u8 {
  fn from(t: Type) -> u8 {
    use Type::*;
    match t {
      | Con => 0,
      | Non => 1,
      | Ack => 2,
      | Reset => 3,
    }
  }
}

impl From<Byte1> for u8 {
  fn from(b: Byte1) -> u8 {
    let ver = b.ver.0 << 6;
    let ty = u8::from(b.ty) << 4;
    let tkl = b.tkl;

    ver | ty | tkl
  }
}
