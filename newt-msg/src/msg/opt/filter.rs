use tinyvec::ArrayVec;

use super::{OptNumber, OptionMustBeProcessed};
use crate::msg::Message;

/// A compact record of the option numbers an endpoint understands.
///
/// Numbers below 512 are stored in a fixed bitset; the handful of
/// registered numbers above that (none in the core registries) go in
/// a small overflow list with bounded capacity.
///
/// ```
/// use newt_msg::{OptFilter, OptNumber};
///
/// let mut filter = OptFilter::new();
/// filter.set(OptNumber(11));
/// assert!(filter.contains(OptNumber(11)));
/// assert!(!filter.contains(OptNumber(1)));
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OptFilter {
  bits: [u64; 8],
  ext: ArrayVec<[u16; 8]>,
}

impl OptFilter {
  /// An empty filter
  pub fn new() -> Self {
    Default::default()
  }

  /// A filter pre-populated with the option numbers this library
  /// processes itself
  pub fn core_options() -> Self {
    use super::known::{no_repeat, repeat};

    let mut f = Self::new();
    [repeat::IF_MATCH,
     no_repeat::HOST,
     repeat::ETAG,
     no_repeat::IF_NONE_MATCH,
     no_repeat::OBSERVE,
     no_repeat::PORT,
     repeat::LOCATION_PATH,
     repeat::PATH,
     no_repeat::CONTENT_FORMAT,
     no_repeat::MAX_AGE,
     repeat::QUERY,
     no_repeat::ACCEPT,
     repeat::LOCATION_QUERY,
     no_repeat::BLOCK2,
     no_repeat::BLOCK1,
     no_repeat::SIZE2,
     no_repeat::PROXY_URI,
     no_repeat::PROXY_SCHEME,
     no_repeat::SIZE1].into_iter()
                      .for_each(|n| {
                        f.set(n);
                      });
    f
  }

  /// Record an option number. Returns `false` when the number is
  /// out of range of the bitset and the overflow list is full.
  pub fn set(&mut self, num: OptNumber) -> bool {
    match num.0 {
      | n if n < 512 => {
        self.bits[(n / 64) as usize] |= 1 << (n % 64);
        true
      },
      | n if n <= u16::MAX as u32 => {
        if self.ext.contains(&(n as u16)) {
          true
        } else {
          self.ext.try_push(n as u16).is_none()
        }
      },
      | _ => false,
    }
  }

  /// Remove an option number from the filter
  pub fn clear(&mut self, num: OptNumber) {
    match num.0 {
      | n if n < 512 => self.bits[(n / 64) as usize] &= !(1 << (n % 64)),
      | n if n <= u16::MAX as u32 => self.ext.retain(|e| *e != n as u16),
      | _ => (),
    }
  }

  /// Whether an option number is in the filter
  pub fn contains(&self, num: OptNumber) -> bool {
    match num.0 {
      | n if n < 512 => self.bits[(n / 64) as usize] & (1 << (n % 64)) != 0,
      | n if n <= u16::MAX as u32 => self.ext.contains(&(n as u16)),
      | _ => false,
    }
  }

  /// Walk a message's options and yield the first critical option
  /// that is not in this filter.
  ///
  /// A request carrying one must be rejected with 4.02 Bad Option; a
  /// response carrying one must be rejected with Reset.
  pub fn first_unknown_critical(&self, msg: &Message) -> Option<OptNumber> {
    msg.opts
       .keys()
       .find(|num| {
         num.must_be_processed() == OptionMustBeProcessed::Yes && !self.contains(**num)
       })
       .copied()
  }

  /// Walk a message's options and collect unknown critical options,
  /// bounded by `out`'s capacity.
  pub fn unknown_criticals(&self, msg: &Message, out: &mut ArrayVec<[u16; 8]>) {
    for num in msg.opts.keys() {
      if num.must_be_processed() == OptionMustBeProcessed::Yes && !self.contains(*num) {
        if out.try_push(num.0 as u16).is_some() {
          break;
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{Code, Id, OptValue, Token, Type};

  #[test]
  fn set_clear_contains() {
    let mut f = OptFilter::new();
    assert!(f.set(OptNumber(1)));
    assert!(f.set(OptNumber(300)));
    assert!(f.set(OptNumber(2000)));
    assert!(f.contains(OptNumber(1)));
    assert!(f.contains(OptNumber(300)));
    assert!(f.contains(OptNumber(2000)));

    f.clear(OptNumber(300));
    assert!(!f.contains(OptNumber(300)));
  }

  #[test]
  fn unknown_critical_walk() {
    let mut msg = Message::new(Type::Con, Code::GET, Id(1), Token::empty());
    msg.opts
       .insert(OptNumber(11), vec![OptValue(b"time".to_vec())]);
    // odd => critical, and certainly not registered
    msg.opts.insert(OptNumber(9001), vec![OptValue(vec![])]);
    // even => elective, unknown but ignorable
    msg.opts.insert(OptNumber(9000), vec![OptValue(vec![])]);

    let filter = OptFilter::core_options();
    assert_eq!(filter.first_unknown_critical(&msg), Some(OptNumber(9001)));

    let known_only = Message::new(Type::Con, Code::GET, Id(1), Token::empty());
    assert_eq!(filter.first_unknown_critical(&known_only), None);
  }
}
