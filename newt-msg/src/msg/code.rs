use std_alloc::string::{String, ToString};

/// # Code
/// 8-bit unsigned integer split into a 3-bit class and 5-bit detail,
/// documented as `c.dd` (e.g. `2.05` Content, `4.04` Not Found).
///
/// |class|meaning|
/// |---|---|
/// |`0`|Message is a request (or Empty when detail is also 0)|
/// |`2`|Message is a success response|
/// |`4`|Message is a client error response|
/// |`5`|Message is a server error response|
/// |`7`|Message is a signalling message (reliable transports only)|
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Code {
  /// The "class" of message codes identify it as a request or
  /// response, and provides the class of response status
  pub class: u8,

  /// 2-digit integer (range `[0, 32)`) that provides granular
  /// information about the response status.
  ///
  /// Will always be `0` for requests.
  pub detail: u8,
}

/// Whether a code identifies a request, response, signalling
/// message, or the Empty message
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum CodeKind {
  /// A request method (0.01 - 0.31)
  Request,
  /// A response status (2.00 - 5.31)
  Response,
  /// A signalling message on a reliable transport (7.00 - 7.31)
  Signal,
  /// The Empty code (0.00); carried by pings, empty ACKs and Resets
  Empty,
}

impl Code {
  /// Create a new Code
  ///
  /// ```
  /// use newt_msg::Code;
  ///
  /// let content = Code::new(2, 05);
  /// ```
  pub const fn new(class: u8, detail: u8) -> Self {
    Self { class, detail }
  }

  /// The Empty code, `0.00`
  pub const EMPTY: Code = Code::new(0, 0);

  /// Method code GET, `0.01`
  pub const GET: Code = Code::new(0, 1);
  /// Method code POST, `0.02`
  pub const POST: Code = Code::new(0, 2);
  /// Method code PUT, `0.03`
  pub const PUT: Code = Code::new(0, 3);
  /// Method code DELETE, `0.04`
  pub const DELETE: Code = Code::new(0, 4);
  /// Method code FETCH (RFC 8132), `0.05`
  pub const FETCH: Code = Code::new(0, 5);
  /// Method code PATCH (RFC 8132), `0.06`
  pub const PATCH: Code = Code::new(0, 6);
  /// Method code iPATCH (RFC 8132), `0.07`
  pub const IPATCH: Code = Code::new(0, 7);

  /// What kind of message does this code mark?
  pub fn kind(&self) -> CodeKind {
    match self.class {
      | 0 if self.detail == 0 => CodeKind::Empty,
      | 0 => CodeKind::Request,
      | 7 => CodeKind::Signal,
      | _ => CodeKind::Response,
    }
  }

  /// Get the human string representation of a message code
  ///
  /// # Returns
  /// A `char` array
  ///
  /// This is to avoid unnecessary heap allocation; a `ToString`
  /// implementation is also provided.
  /// ```
  /// use newt_msg::Code;
  ///
  /// let code = Code { class: 2, detail: 5 };
  /// let chars = code.to_human();
  /// let string = String::from_iter(chars);
  /// assert_eq!(string, "2.05".to_string());
  /// ```
  pub fn to_human(&self) -> [char; 4] {
    let to_char = |d: u8| char::from_digit(d.into(), 10).unwrap();
    [to_char(self.class),
     '.',
     to_char(self.detail / 10),
     to_char(self.detail % 10)]
  }
}

impl ToString for Code {
  fn to_string(&self) -> String {
    String::from_iter(self.to_human())
  }
}

impl From<u8> for Code {
  fn from(b: u8) -> Self {
    let class = b >> 5;
    let detail = b & 0b0011111;

    Code { class, detail }
  }
}

impl From<Code> for u8 {
  fn from(code: Code) -> u8 {
    let class = code.class << 5;
    let detail = code.detail;

    class | detail
  }
}
