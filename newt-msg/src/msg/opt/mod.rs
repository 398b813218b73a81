use std_alloc::collections::BTreeMap;
use std_alloc::vec::Vec;

use crate::cursor::Cursor;
use crate::from_bytes::TryConsumeBytes;

/// Option parsing errors
pub mod parse_error;
pub use parse_error::*;

/// Compact registered-option-number filter
pub mod filter;
pub use filter::*;

/// Known option numbers & typed values
pub mod known;

pub(crate) fn parse_opt_len_or_delta<A: AsRef<[u8]>>(head: u8,
                                                     bytes: &mut Cursor<A>,
                                                     reserved_err: OptParseError)
                                                     -> Result<u16, OptParseError> {
  match head {
    | 13 => {
      let n = bytes.next().ok_or_else(OptParseError::eof)?;
      Ok((n as u16) + 13)
    },
    | 14 => match bytes.take_exact(2) {
      | Some(&[a, b]) => Ok(u16::from_be_bytes([a, b]) + 269),
      | _ => Err(OptParseError::eof()),
    },
    | 15 => Err(reserved_err),
    | _ => Ok(head as u16),
  }
}

pub(crate) fn opt_len_or_delta(val: u16) -> (u8, tinyvec::ArrayVec<[u8; 2]>) {
  match val {
    | n if n >= 269 => {
      let mut bytes = tinyvec::ArrayVec::new();
      bytes.extend((n - 269).to_be_bytes());
      (14, bytes)
    },
    | n if n >= 13 => {
      let mut bytes = tinyvec::ArrayVec::new();
      bytes.push((n as u8) - 13);
      (13, bytes)
    },
    | n => (n as u8, tinyvec::ArrayVec::new()),
  }
}

/// # `Opt` struct
/// Low-level representation of a freshly parsed CoAP Option
///
/// ## Option Numbers
/// This struct just stores data parsed directly from the message on the
/// wire, and does not compute or store the Option Number.
///
/// To get [`OptNumber`]s, use the iterator extension
/// [`EnumerateOptNumbers`] on a collection of [`Opt`]s, or parse
/// directly into an [`OptionMap`].
#[derive(Clone, PartialEq, PartialOrd, Debug, Default)]
pub struct Opt {
  /// See [`OptDelta`]
  pub delta: OptDelta,
  /// See [`OptValue`]
  pub value: OptValue,
}

impl Opt {
  /// Given a collection to [`Extend`] and an Opt, add that Opt's bytes to the collection.
  pub fn extend_bytes(&self, bytes: &mut impl Extend<u8>) {
    let (del, del_bytes) = opt_len_or_delta(self.delta.0);
    let (len, len_bytes) = opt_len_or_delta(self.value.0.len() as u16);
    let del = del << 4;

    let header = del | len;

    bytes.extend(Some(header));
    bytes.extend(del_bytes);
    bytes.extend(len_bytes);
    bytes.extend(self.value.0.iter().copied());
  }
}

/// The "Option Delta" is the difference between this Option's Number
/// and the previous Option's number.
///
/// This is just used to compute the Option Number, identifying which
/// Option is being set (e.g. Content-Format has a Number of 12)
///
/// # Related
/// - [RFC7252#section-3.1 Option Format](https://datatracker.ietf.org/doc/html/rfc7252#section-3.1)
#[derive(Copy, Clone, Hash, PartialEq, PartialOrd, Debug, Default)]
pub struct OptDelta(pub u16);

/// Identifies an option.
///
/// The low bits of the number encode the option's properties
/// (RFC7252 section 5.4.6):
///
/// ```text
///   0   1   2   3   4   5   6   7
/// +---+---+---+---+---+---+---+---+
/// |         | NoCacheKey| U | C |
/// +---+---+---+---+---+---+---+---+
/// ```
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct OptNumber(pub u32);

/// Whether an option must be processed by the receiving endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum OptionMustBeProcessed {
  /// This option must be processed, and a message that ignores it
  /// will be rejected.
  ///
  /// Corresponds to the option being "critical" in strict CoAP terms
  Yes,
  /// This option does not _need_ to be processed.
  ///
  /// Corresponds to the option being "elective" in strict CoAP terms
  No,
}

/// How a proxy that does not understand an option should treat it
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum WhenOptionUnsupportedByProxy {
  /// This option must be processed & understood by proxies
  /// and may not be forwarded blindly to their destination.
  ///
  /// Corresponds to the option being "UnSafe" to forward
  /// in strict CoAP terms
  Error,
  /// This option may be forwarded blindly to its destination.
  ///
  /// Corresponds to the option being "SafeToForward"
  /// in strict CoAP terms
  Forward,
}

/// Whether different values for an option can change a cached response
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum WhenOptionChanges {
  /// This option is part of the cache key; different values
  /// yield different cached responses.
  ResponseChanges,
  /// This option is "NoCacheKey"; different values should
  /// yield the same cached response.
  ResponseDoesNotChange,
}

impl OptNumber {
  /// Whether or not this option may be ignored by a server
  pub fn must_be_processed(&self) -> OptionMustBeProcessed {
    #[allow(clippy::wildcard_in_or_patterns)] // will only ever be 0 or 1
    match self.0 & 0b1 {
      | 1 => OptionMustBeProcessed::Yes,
      | 0 | _ => OptionMustBeProcessed::No,
    }
  }

  /// Whether or not this option may be forwarded blindly by
  /// a proxy that does not support processing it
  pub fn when_unsupported_by_proxy(&self) -> WhenOptionUnsupportedByProxy {
    #[allow(clippy::wildcard_in_or_patterns)] // will only ever be 0 or 1
    match (self.0 & 0b10) >> 1 {
      | 1 => WhenOptionUnsupportedByProxy::Error,
      | 0 | _ => WhenOptionUnsupportedByProxy::Forward,
    }
  }

  /// Whether or not different values for this option should
  /// yield proxies' cached response
  pub fn when_option_changes(&self) -> WhenOptionChanges {
    match (self.0 & 0b11100) >> 2 {
      | 0b111 => WhenOptionChanges::ResponseDoesNotChange,
      | _ => WhenOptionChanges::ResponseChanges,
    }
  }

  /// Whether this option participates in the request cache key
  pub fn include_in_cache_key(&self) -> bool {
    self.when_option_changes() == WhenOptionChanges::ResponseChanges
  }
}

/// The value of an option, an opaque sequence of bytes.
///
/// Typed accessors interpret the bytes per the option's registered
/// format (uint, string, opaque).
#[derive(Default, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct OptValue(pub Vec<u8>);

impl OptValue {
  /// Interpret the value as a variable-length big-endian unsigned
  /// integer. An empty value is zero.
  pub fn as_uint(&self) -> u64 {
    self.0
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | (*b as u64))
  }

  /// Interpret the value as a utf8 string
  pub fn as_str(&self) -> Option<&str> {
    core::str::from_utf8(&self.0).ok()
  }

  /// The minimal big-endian encoding of a uint option value
  /// (zero encodes to the empty value)
  pub fn uint_bytes(value: u64) -> Vec<u8> {
    let skip = (value.leading_zeros() / 8) as usize;
    value.to_be_bytes()[skip.min(8)..].to_vec()
  }
}

/// Options of a message, keyed by option number in ascending order.
///
/// Repeatable options (e.g. Uri-Path) store one [`OptValue`] per
/// occurrence, in occurrence order.
pub type OptionMap = BTreeMap<OptNumber, Vec<OptValue>>;

impl<Bytes: AsRef<[u8]>> TryConsumeBytes<Bytes> for Opt {
  type Error = OptParseError;

  fn try_consume_bytes(bytes: &mut Cursor<Bytes>) -> Result<Self, Self::Error> {
    let byte1 = bytes.next()
                     .ok_or(OptParseError::OptionsExhausted)
                     .and_then(|b| {
                       if b == 0b11111111 {
                         Err(OptParseError::OptionsExhausted)
                       } else {
                         Ok(b)
                       }
                     })?;

    // Delta MUST be consumed before the value length; both may
    // borrow extension bytes from the cursor in that order.
    let delta = parse_opt_len_or_delta(byte1 >> 4,
                                       bytes,
                                       OptParseError::OptionDeltaReservedValue(15))?;
    let delta = OptDelta(delta);

    let len = parse_opt_len_or_delta(byte1 & 0b00001111,
                                     bytes,
                                     OptParseError::ValueLengthReservedValue(15))?
              as usize;

    let value = bytes.take_exact(len)
                     .ok_or(OptParseError::UnexpectedEndOfStream)?;
    let value = OptValue(value.to_vec());

    Ok(Opt { delta, value })
  }
}

impl<Bytes: AsRef<[u8]>> TryConsumeBytes<Bytes> for OptionMap {
  type Error = OptParseError;

  fn try_consume_bytes(bytes: &mut Cursor<Bytes>) -> Result<Self, Self::Error> {
    let mut opts = OptionMap::new();
    let mut number = 0u32;

    loop {
      match bytes.peek(1) {
        | [] => break Ok(opts),
        | [0b11111111, ..] => {
          // the payload marker terminates the option walk; a marker
          // with nothing after it is a message format error
          bytes.next();
          break if bytes.is_exhausted() {
            Err(OptParseError::PayloadMarkerWithNoPayload)
          } else {
            Ok(opts)
          };
        },
        | _ => (),
      }

      let opt = Opt::try_consume_bytes(bytes)?;
      number += opt.delta.0 as u32;
      opts.entry(OptNumber(number)).or_default().push(opt.value);
    }
  }
}

/// Creates an iterator which gives the current opt's number as well as the option.
///
/// The iterator returned yields pairs `(i, val)`, where `i` is the
/// [`OptNumber`] and `val` is the Opt returned by the iterator.
pub trait EnumerateOptNumbers<T>
  where Self: Sized + Iterator<Item = T>
{
  /// Creates an iterator which gives the current Opt along with its Number.
  ///
  /// ```
  /// use newt_msg::{EnumerateOptNumbers, Opt, OptDelta, OptNumber, OptValue};
  ///
  /// let opt_a = Opt { delta: OptDelta(12),
  ///                   value: OptValue(Vec::new()) };
  /// let opt_b = Opt { delta: OptDelta(2),
  ///                   value: OptValue(Vec::new()) };
  /// let opts = vec![opt_a.clone(), opt_b.clone()];
  ///
  /// let opt_ns = opts.into_iter()
  ///                  .enumerate_option_numbers()
  ///                  .collect::<Vec<_>>();
  ///
  /// assert_eq!(opt_ns, vec![(OptNumber(12), opt_a), (OptNumber(14), opt_b)])
  /// ```
  fn enumerate_option_numbers(self) -> EnumerateOptNumbersIter<T, Self>;
}

impl<I: Iterator<Item = Opt>> EnumerateOptNumbers<Opt> for I {
  fn enumerate_option_numbers(self) -> EnumerateOptNumbersIter<Opt, Self> {
    EnumerateOptNumbersIter { number: 0,
                              iter: self }
  }
}

/// Iterator yielded by [`EnumerateOptNumbers`], wrapping an Iterator
/// over [`Opt`]s.
///
/// Invoking [`Iterator::next`] on this struct will advance the
/// inner iterator, and add the delta of the new opt to its running
/// sum of deltas.
///
/// This running sum is the Number of the newly iterated Opt.
#[derive(Clone, Debug)]
pub struct EnumerateOptNumbersIter<T, I: Iterator<Item = T>> {
  number: u32,
  iter: I,
}

impl<I: Iterator<Item = Opt>> Iterator for EnumerateOptNumbersIter<Opt, I> {
  type Item = (OptNumber, Opt);

  fn next(&mut self) -> Option<Self::Item> {
    self.iter.next().map(|opt| {
                      self.number += opt.delta.0 as u32;
                      (OptNumber(self.number), opt)
                    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_opt() {
    let mut opt_bytes = Cursor::new([0b00010001, 0b00000001]);
    let opt = Opt::try_consume_bytes(&mut opt_bytes).unwrap();
    assert_eq!(opt,
               Opt { delta: OptDelta(1),
                     value: OptValue(vec![1]) });

    let mut opt_bytes = Cursor::new([0b11010001, 0b00000001, 0b00000001]);
    let opt = Opt::try_consume_bytes(&mut opt_bytes).unwrap();
    assert_eq!(opt,
               Opt { delta: OptDelta(14),
                     value: OptValue(vec![1]) });

    let mut opt_bytes = Cursor::new([0b11100001, 0b00000000, 0b00000001, 0b00000001]);
    let opt = Opt::try_consume_bytes(&mut opt_bytes).unwrap();
    assert_eq!(opt,
               Opt { delta: OptDelta(270),
                     value: OptValue(vec![1]) });

    let mut opt_bytes =
      Cursor::new([0b00000001, 0b00000001, 0b00010001, 0b00000011, 0b11111111, 0b00000001]);
    let opts = OptionMap::try_consume_bytes(&mut opt_bytes).unwrap();
    assert_eq!(opts,
               OptionMap::from([(OptNumber(0), vec![OptValue(vec![1])]),
                                (OptNumber(1), vec![OptValue(vec![3])])]));
    // the marker was consumed; the payload byte remains
    assert_eq!(opt_bytes.until_end(), &[1u8][..]);
  }

  #[test]
  fn marker_with_no_payload_rejected() {
    let mut opt_bytes = Cursor::new([0b00000001, 0b00000001, 0b11111111]);
    assert_eq!(OptionMap::try_consume_bytes(&mut opt_bytes),
               Err(OptParseError::PayloadMarkerWithNoPayload));
  }

  #[test]
  fn parse_opt_truncated_value() {
    let mut opt_bytes = Cursor::new([0b00010011, 0b00000001]);
    assert_eq!(Opt::try_consume_bytes(&mut opt_bytes),
               Err(OptParseError::UnexpectedEndOfStream));
  }

  #[test]
  fn parse_opt_reserved_delta() {
    let mut opt_bytes = Cursor::new([0b11110001, 0b00000001]);
    assert_eq!(Opt::try_consume_bytes(&mut opt_bytes),
               Err(OptParseError::OptionDeltaReservedValue(15)));
  }

  #[test]
  fn repeated_options_accumulate() {
    // Uri-Path "a" then Uri-Path "b" (delta 11 then 0)
    let mut opt_bytes = Cursor::new([0b10110001, b'a', 0b00000001, b'b']);
    let opts = OptionMap::try_consume_bytes(&mut opt_bytes).unwrap();
    assert_eq!(opts[&OptNumber(11)],
               vec![OptValue(vec![b'a']), OptValue(vec![b'b'])]);
  }

  #[test]
  fn uint_codec() {
    assert_eq!(OptValue::uint_bytes(0), Vec::<u8>::new());
    assert_eq!(OptValue::uint_bytes(60), vec![60]);
    assert_eq!(OptValue::uint_bytes(0x0123), vec![0x01, 0x23]);
    assert_eq!(OptValue(vec![]).as_uint(), 0);
    assert_eq!(OptValue(vec![0x01, 0x23]).as_uint(), 0x0123);
  }

  #[test]
  fn opt_number_qualities() {
    // critical, safe-to-fwd, cache-key
    let if_match = OptNumber(1);

    // critical, unsafe-to-fwd, cache-key
    let uri_host = OptNumber(3);

    // elective, safe-to-fwd, cache-key
    let etag = OptNumber(4);

    // elective, safe-to-fwd, no-cache-key
    let size1 = OptNumber(60);

    [&if_match, &uri_host].into_iter()
                          .for_each(|num| {
                            assert_eq!(num.must_be_processed(), OptionMustBeProcessed::Yes);
                          });

    [&etag, &size1].into_iter().for_each(|num| {
                                 assert_eq!(num.must_be_processed(), OptionMustBeProcessed::No);
                               });

    [&if_match, &etag, &size1].into_iter().for_each(|num| {
                                            assert_eq!(num.when_unsupported_by_proxy(),
                                                       WhenOptionUnsupportedByProxy::Forward);
                                          });

    [&uri_host].into_iter().for_each(|num| {
                             assert_eq!(num.when_unsupported_by_proxy(),
                                        WhenOptionUnsupportedByProxy::Error);
                           });

    [&if_match, &uri_host, &etag].into_iter().for_each(|num| {
                                               assert_eq!(num.when_option_changes(),
                                                          WhenOptionChanges::ResponseChanges);
                                             });

    [&size1].into_iter().for_each(|num| {
                          assert_eq!(num.when_option_changes(),
                                     WhenOptionChanges::ResponseDoesNotChange);
                        });
  }
}
