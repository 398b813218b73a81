pub use no_std_net::SocketAddr;
use no_std_net::ToSocketAddrs;
use std_alloc::vec;
use std_alloc::vec::Vec;

/// Data that came from a network socket
#[derive(PartialEq, PartialOrd, Eq, Ord, Hash, Debug, Clone, Copy)]
pub struct Addrd<T>(pub T, pub SocketAddr);

impl<T> Addrd<T> {
  /// Borrow the contents of this Addressed
  pub fn as_ref(&self) -> Addrd<&T> {
    Addrd(self.data(), self.addr())
  }

  /// Discard the socket and get the data in this Addressed
  pub fn unwrap(self) -> T {
    self.0
  }

  /// Map the data contained in this Addressed
  pub fn map<R>(self, f: impl FnOnce(T) -> R) -> Addrd<R> {
    Addrd(f(self.0), self.1)
  }

  /// Map the data contained in this Addressed (with a copy of the address)
  pub fn map_with_addr<R>(self, f: impl FnOnce(T, SocketAddr) -> R) -> Addrd<R> {
    Addrd(f(self.0, self.1), self.1)
  }

  /// Borrow the contents of the addressed item
  pub fn data(&self) -> &T {
    &self.0
  }

  /// Mutably borrow the contents of the addressed item
  pub fn data_mut(&mut self) -> &mut T {
    &mut self.0
  }

  /// Copy the socket address for the data
  pub fn addr(&self) -> SocketAddr {
    self.1
  }

  /// Turn the entire structure into something else
  pub fn fold<R>(self, f: impl FnOnce(T, SocketAddr) -> R) -> R {
    f(self.0, self.1)
  }
}

impl<T> AsMut<T> for Addrd<T> {
  fn as_mut(&mut self) -> &mut T {
    &mut self.0
  }
}

/// The four transports CoAP is defined over.
///
/// Datagram transports (UDP, DTLS) carry the RFC 7252 framing with
/// message ids and CON/NON reliability; stream transports (TCP, TLS)
/// carry the RFC 8323 framing and lean on the transport for
/// reliability.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Clone, Copy)]
pub enum Transport {
  /// CoAP over UDP (RFC 7252)
  Udp,
  /// CoAP over DTLS-secured UDP (RFC 7252 section 9)
  Dtls,
  /// CoAP over TCP (RFC 8323)
  Tcp,
  /// CoAP over TLS-secured TCP (RFC 8323)
  Tls,
}

impl Transport {
  /// Whether the transport handles reliability itself, making
  /// CON/ACK & retransmission unnecessary
  pub fn is_reliable(&self) -> bool {
    matches!(self, Transport::Tcp | Transport::Tls)
  }

  /// Whether datagrams pass through the security provider
  pub fn is_secure(&self) -> bool {
    matches!(self, Transport::Dtls | Transport::Tls)
  }

  /// The IANA default port for this transport
  pub fn default_port(&self) -> u16 {
    if self.is_secure() {
      5684
    } else {
      5683
    }
  }
}

/// What a socket wants from, and can currently do with, the
/// underlying I/O layer.
///
/// `want_*` flags are set by the protocol machine during
/// [`prepare`](crate::core::Core::process); the integrator's
/// readiness source answers with the matching `can_*` flags.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Default)]
#[allow(missing_docs)]
pub struct Readiness {
  pub want_read: bool,
  pub want_write: bool,
  pub want_accept: bool,
  pub want_connect: bool,
  pub can_read: bool,
  pub can_write: bool,
  pub can_accept: bool,
  pub can_connect: bool,
}

impl Readiness {
  /// Clear all `can_*` flags (typically after an I/O pass)
  pub fn settle(&mut self) {
    self.can_read = false;
    self.can_write = false;
    self.can_accept = false;
    self.can_connect = false;
  }

  /// Whether any `can_*` flag answers a `want_*` flag
  pub fn actionable(&self) -> bool {
    (self.want_read && self.can_read)
    || (self.want_write && self.can_write)
    || (self.want_accept && self.can_accept)
    || (self.want_connect && self.can_connect)
  }
}

/// A CoAP network socket
///
/// This mirrors the UDP socket traits in embedded-nal, but allows us to
/// implement them for foreign types (like `std::net::UdpSocket`).
///
/// All operations are non-blocking; "nothing to do yet" is
/// [`nb::Error::WouldBlock`]. Blocking in `send` or `recv` stalls the
/// whole event loop and violates the [`crate::core`] contract.
pub trait Socket: Sized {
  /// The error yielded by socket operations
  type Error: core::fmt::Debug;

  /// Get the local address this socket was created from
  fn local_addr(&self) -> SocketAddr;

  /// Bind the socket to an address, without doing any spooky magic things
  /// like joining multicast groups.
  ///
  /// Implementors of `bind_raw` should:
  ///  - yield a socket in a non-blocking state
  ///  - bind to the first address if `addr` yields multiple addresses
  fn bind_raw<A: ToSocketAddrs>(addr: A) -> Result<Self, Self::Error>;

  /// Binds the socket to a local address.
  ///
  /// This function will automatically invoke [`Socket::join_multicast`]
  /// if the address is a multicast address, and should yield a
  /// non-blocking socket.
  fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, Self::Error> {
    let addr = addr.to_socket_addrs().unwrap().next().unwrap();

    let sock = Self::bind_raw(addr)?;
    match addr.ip() {
      | ip if ip.is_multicast() => sock.join_multicast(ip)?,
      | _ => (),
    };
    Ok(sock)
  }

  /// Send a message to a remote address
  fn send(&self, msg: Addrd<&[u8]>) -> nb::Result<(), Self::Error>;

  /// Pull a buffered datagram from the socket, along with the address
  /// of the sender.
  ///
  /// It is expected that (like `std::net::UdpSocket`) if the message is
  /// larger than the buffer, the excess bytes are dropped and not
  /// considered an error condition.
  fn recv(&self, buffer: &mut [u8]) -> nb::Result<Addrd<usize>, Self::Error>;

  /// Look at the sender of the message at the top of the receipt queue
  /// without clearing it, or [`nb::Error::WouldBlock`] if the queue
  /// is empty.
  fn peek(&self, buffer: &mut [u8]) -> nb::Result<Addrd<usize>, Self::Error>;

  /// Poll the socket for a datagram, yielding `None` instead of
  /// `WouldBlock` when nothing is buffered
  fn poll(&self) -> Result<Option<Addrd<Vec<u8>>>, Self::Error> {
    let mut buf = vec![0u8; 1500];
    match self.recv(&mut buf) {
      | Ok(Addrd(n, addr)) => {
        buf.truncate(n);
        Ok(Some(Addrd(buf, addr)))
      },
      | Err(nb::Error::WouldBlock) => Ok(None),
      | Err(nb::Error::Other(e)) => Err(e),
    }
  }

  /// Join a multicast group
  fn join_multicast(&self, addr: no_std_net::IpAddr) -> Result<(), Self::Error>;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn transport_qualities() {
    assert!(!Transport::Udp.is_reliable());
    assert!(!Transport::Dtls.is_reliable());
    assert!(Transport::Tcp.is_reliable());
    assert!(Transport::Tls.is_reliable());

    assert!(Transport::Dtls.is_secure());
    assert!(!Transport::Tcp.is_secure());

    assert_eq!(Transport::Udp.default_port(), 5683);
    assert_eq!(Transport::Tls.default_port(), 5684);
  }

  #[test]
  fn readiness_actionable() {
    let mut r = Readiness { want_read: true,
                            ..Default::default() };
    assert!(!r.actionable());
    r.can_read = true;
    assert!(r.actionable());
    r.settle();
    assert!(!r.actionable());
  }
}
