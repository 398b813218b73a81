/// # Token
///
/// Correlates a response with the request it answers, across
/// message-id boundaries. 0 to 8 opaque bytes chosen by the client;
/// servers echo it back unchanged.
///
/// Message [`Id`](super::Id)s identify a single transmission for
/// deduplication and ACK matching; Tokens identify a whole
/// request/response exchange, which may span several message ids
/// (e.g. a separate response sent long after the empty ACK).
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Token(pub tinyvec::ArrayVec<[u8; 8]>);

impl Token {
  /// Take an arbitrary-length sequence of bytes and turn it into an
  /// opaque 8-byte message token.
  ///
  /// Currently uses the BLAKE2 hashing algorithm, but this may change
  /// in the future.
  ///
  /// ```
  /// use newt_msg::Token;
  ///
  /// let my_token = Token::opaque(&[0, 1, 2]);
  /// ```
  pub fn opaque(data: &[u8]) -> Token {
    use blake2::digest::consts::U8;
    use blake2::{Blake2b, Digest};

    let mut digest = Blake2b::<U8>::new();
    digest.update(data);
    Token(Into::<[u8; 8]>::into(digest.finalize()).into())
  }

  /// The empty token
  pub fn empty() -> Token {
    Token(Default::default())
  }

  /// Token length in bytes (0..=8)
  pub fn len(&self) -> usize {
    self.0.len()
  }

  /// Whether this is the zero-length token
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn opaque_is_deterministic() {
    assert_eq!(Token::opaque(&[1, 2, 3]), Token::opaque(&[1, 2, 3]));
    assert_ne!(Token::opaque(&[1, 2, 3]), Token::opaque(&[3, 2, 1]));
    assert_eq!(Token::opaque(&[1, 2, 3]).len(), 8);
  }
}
