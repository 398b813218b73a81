use core::hash::{Hash, Hasher};

use std_alloc::vec::Vec;

use crate::msg::known::repeat::QUERY;
use crate::msg::Message;
use crate::OptNumber;

/// [`core::hash::Hasher`] backed by the BLAKE2 digest
///
/// The 64-bit hash is the big-endian head of the full digest.
#[derive(Clone, Debug, Default)]
pub struct Blake2Hasher(blake2::Blake2b512);

impl Hasher for Blake2Hasher {
  fn write(&mut self, bytes: &[u8]) {
    use blake2::Digest;
    self.0.update(bytes);
  }

  fn finish(&self) -> u64 {
    use blake2::Digest;
    let digest = self.0.clone().finalize();
    u64::from_be_bytes(digest[..8].try_into().expect("BLAKE2b-512 digest is 64 bytes"))
  }
}

/// The cache key can be used to compare messages for representing
/// the same action against the same resource; requests with different
/// ids and tokens but the same method and cache-key affecting options
/// (path, query parameters, Accept, ...) yield the same cache key.
///
/// NoCacheKey options and any option number in the ignore set never
/// contribute. Query values are hashed in sorted order so that
/// `?a=1&b=2` and `?b=2&a=1` coincide.
pub trait CacheKey
  where Self: Sized + core::fmt::Debug
{
  /// Type used to generate hashes
  type Hasher: Hasher;

  #[allow(missing_docs)]
  fn hasher(&mut self) -> &mut Self::Hasher;

  /// Add this message's cache key to the hasher's internal state.
  ///
  /// After invoking this, to get the [`u64`] hash use
  /// [`Hasher::finish`], or use [`CacheKey::cache_key`] to do both.
  fn add_cache_key(&mut self, msg: &Message);

  /// Add this message's cache key to the hasher's internal state and
  /// yield the [`u64`] hash.
  ///
  /// ```
  /// use newt_msg::Type::Con;
  /// use newt_msg::{CacheKey, Code, DefaultCacheKey, Id, Message, Token};
  ///
  /// let msg_a = Message::new(Con, Code::GET, Id(1), Token::empty());
  /// let msg_b = Message::new(Con, Code::GET, Id(2), Token::empty());
  ///
  /// let a = DefaultCacheKey::new().cache_key(&msg_a);
  /// let b = DefaultCacheKey::new().cache_key(&msg_b);
  /// assert_eq!(a, b);
  /// ```
  fn cache_key(&mut self, msg: &Message) -> u64 {
    self.add_cache_key(msg);
    self.hasher().finish()
  }
}

/// Default [`CacheKey`] implementation
///
/// Hashes the message code and every cache-key option, skipping a
/// configurable ignore set.
#[derive(Debug, Clone, Default)]
pub struct DefaultCacheKey {
  hasher: Blake2Hasher,
  ignored: Vec<OptNumber>,
}

impl DefaultCacheKey {
  /// Create a new `DefaultCacheKey`
  pub fn new() -> Self {
    Self::default()
  }

  /// Create one that skips the given option numbers
  pub fn ignoring(ignored: Vec<OptNumber>) -> Self {
    Self { hasher: Default::default(),
           ignored }
  }
}

impl CacheKey for DefaultCacheKey {
  type Hasher = Blake2Hasher;

  fn hasher(&mut self) -> &mut Self::Hasher {
    &mut self.hasher
  }

  fn add_cache_key(&mut self, msg: &Message) {
    msg.code.hash(&mut self.hasher);

    for (num, vals) in msg.opts.iter() {
      if !num.include_in_cache_key() || self.ignored.contains(num) {
        continue;
      }

      num.hash(&mut self.hasher);

      if *num == QUERY {
        let mut sorted = vals.clone();
        sorted.sort();
        sorted.iter().for_each(|v| v.hash(&mut self.hasher));
      } else {
        vals.iter().for_each(|v| v.hash(&mut self.hasher));
      }
    }
  }
}
