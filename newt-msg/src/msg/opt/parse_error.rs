/// Errors encounterable while parsing an option from bytes
#[derive(Copy, Clone, Debug, PartialEq, PartialOrd, Eq, Ord)]
pub enum OptParseError {
  /// Reached end of stream before parsing was finished
  UnexpectedEndOfStream,

  /// There were no more options to parse (the payload marker or
  /// end of message was reached). Used internally as the option
  /// walk's terminator; never yielded from message parsing.
  OptionsExhausted,

  /// The option delta nibble was 15, which is reserved for the
  /// payload marker
  OptionDeltaReservedValue(u8),

  /// The value length nibble was 15, which is reserved
  ValueLengthReservedValue(u8),

  /// A payload marker (`0xFF`) was present with a zero-length
  /// payload after it
  PayloadMarkerWithNoPayload,
}

impl OptParseError {
  /// Shorthand for [`OptParseError::UnexpectedEndOfStream`]
  pub fn eof() -> Self {
    Self::UnexpectedEndOfStream
  }
}
