use crate::cursor::Cursor;

/// Trait for fallible conversion from a buffer of bytes
pub trait TryFromBytes<Bytes>: Sized {
  /// Error type yielded when conversion fails
  type Error;

  /// Try to convert from some sequence of bytes
  fn try_from_bytes(bytes: Bytes) -> Result<Self, Self::Error>;
}

/// Trait for parsing a structure out of a cursor, leaving the
/// cursor positioned after the consumed bytes
pub trait TryConsumeBytes<Bytes: AsRef<[u8]>>: Sized {
  /// Error type yielded when parsing fails
  type Error;

  /// Try to parse `Self` out of the cursor
  fn try_consume_bytes(bytes: &mut Cursor<Bytes>) -> Result<Self, Self::Error>;
}
