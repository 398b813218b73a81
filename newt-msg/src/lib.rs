//! Low-level representation of CoAP messages.
//!
//! The most notable item in `newt_msg` is [`Message`]; a CoAP message
//! very close to the actual byte layout.
//!
//! Two framings of the same message structure are supported:
//! - the RFC 7252 datagram framing (fixed 4-byte header carrying a
//!   message id), via [`TryFromBytes`] / [`TryIntoBytes`]
//! - the RFC 8323 byte-stream framing (variable length prefix, no
//!   message id), via the [`framed`] module
//!
//! ## Allocation
//! Message payloads and option values are stored in `Vec`s and options are
//! kept in a `BTreeMap` keyed by option number, meaning the ascending
//! option order required by the wire format is structural and cannot be
//! violated by callers. The crate is `no_std`-compatible but requires
//! `alloc`.

#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(not(test), forbid(missing_debug_implementations, unreachable_pub))]
#![cfg_attr(not(test), deny(unsafe_code, missing_copy_implementations))]
#![deny(missing_docs)]

extern crate alloc as std_alloc;

#[doc(hidden)]
pub mod from_bytes;

#[doc(hidden)]
pub mod to_bytes;

/// Streaming byte cursor used by the decoder
pub mod cursor;

/// Message structs
pub mod msg;

/// RFC 8323 byte-stream framing
pub mod framed;

/// Request fingerprinting
pub mod cache_key;

#[doc(inline)]
pub use cache_key::{CacheKey, DefaultCacheKey};
#[doc(inline)]
pub use cursor::Cursor;
#[doc(inline)]
pub use from_bytes::TryFromBytes;
#[doc(inline)]
pub use msg::*;
#[doc(inline)]
pub use to_bytes::{MessageToBytesError, TryIntoBytes};

#[cfg(test)]
pub(crate) fn test_msg() -> (Message, std_alloc::vec::Vec<u8>) {
  use std_alloc::collections::BTreeMap;
  use std_alloc::vec;
  use std_alloc::vec::Vec;

  let header: [u8; 4] = 0b0100_0001_0100_0101_0000_0000_0000_0001_u32.to_be_bytes();
  let token: [u8; 1] = [254u8];
  let content_format: &[u8] = b"application/json";
  let options: [&[u8]; 2] = [&[0b_1100_1101u8, 0b00000011u8], content_format];
  let payload: [&[u8]; 2] = [&[0b1111_1111_u8], b"hello, world!"];
  let bytes: Vec<u8> = [header.as_ref(),
                        token.as_ref(),
                        options.concat().as_ref(),
                        payload.concat().as_ref()].concat();

  let msg = Message { id: Id(1),
                      ty: Type::Con,
                      ver: Version(1),
                      token: Token(tinyvec::array_vec!([u8; 8] => 254)),
                      opts: BTreeMap::from([(OptNumber(12),
                                             vec![OptValue(content_format.to_vec())])]),
                      code: Code { class: 2,
                                   detail: 5 },
                      payload: Payload(b"hello, world!".to_vec()) };
  (msg, bytes)
}
