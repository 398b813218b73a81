//! The seam between the runtime and whatever (D)TLS implementation
//! the integrator links.
//!
//! `newt` never touches key material or record layers itself; DTLS and
//! TLS sessions funnel every datagram through a [`SecurityProvider`]
//! supplied at construction. The provider owns handshake state per
//! peer and is driven to completion by the event loop calling
//! [`SecurityProvider::handshake`] whenever a secured session is not
//! yet established.

use core::cell::RefCell;
use core::fmt::Debug;

use no_std_net::SocketAddr;
use std_alloc::collections::BTreeMap;
use std_alloc::vec::Vec;

use crate::net::{Addrd, Socket};
use crate::time::Millis;

/// Why a handshake or established secure session died
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsFailure {
  /// The peer presented credentials we could not verify
  BadCredentials,
  /// The peer closed or reset the secure channel
  Closed,
  /// The handshake did not complete within the provider's timeout
  Timeout,
  /// Any other provider-specific failure
  Other,
}

/// Progress report from a handshake step
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handshake {
  /// The channel is established; `encrypt`/`decrypt` may be used
  Done,
  /// The provider needs more bytes from the peer
  WantRead,
  /// The provider has bytes that need flushing to the peer
  WantWrite,
  /// The handshake is dead and the session should be torn down
  Failed(TlsFailure),
}

/// Pre-shared-key material handed to the provider
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Psk {
  /// The identity presented to (or by) the peer
  pub identity: Vec<u8>,
  /// The shared key
  pub key: Vec<u8>,
}

/// PSK lookup callbacks, supplied by the integrator.
///
/// All methods have defaults that decline, so a PKI-only integration
/// implements nothing.
pub trait PskStore {
  /// Key material to present to the server at `addr`, given the
  /// identity hint it sent (if any)
  fn client_psk(&self, _addr: SocketAddr, _hint: Option<&[u8]>) -> Option<Psk> {
    None
  }

  /// Look up the key for a client-presented identity
  fn server_psk(&self, _identity: &[u8]) -> Option<Vec<u8>> {
    None
  }

  /// The identity hint to offer connecting clients
  fn server_hint(&self) -> Option<Vec<u8>> {
    None
  }
}

/// A [`PskStore`] that declines everything
#[derive(Clone, Copy, Debug, Default)]
pub struct NoPsk;
impl PskStore for NoPsk {}

/// The capability a (D)TLS library must implement to secure a
/// `newt` endpoint.
pub trait SecurityProvider {
  /// Per-peer handshake/session state
  type Handle;
  /// Provider-specific error
  type Error: Debug;

  /// Start a client-side session with the server at `addr`
  fn client_session(&mut self, addr: SocketAddr) -> Result<Self::Handle, Self::Error>;

  /// Start a server-side session in response to a first datagram
  /// from `peer`
  fn server_session(&mut self, peer: SocketAddr) -> Result<Self::Handle, Self::Error>;

  /// Drive the handshake forward as far as possible without blocking
  fn handshake(&mut self, handle: &mut Self::Handle) -> Handshake;

  /// Protect one plaintext datagram
  fn encrypt(&mut self, handle: &mut Self::Handle, plain: &[u8]) -> Result<Vec<u8>, Self::Error>;

  /// Unprotect one ciphertext datagram
  fn decrypt(&mut self, handle: &mut Self::Handle, cipher: &[u8]) -> Result<Vec<u8>, Self::Error>;

  /// Tear the session down (sends close_notify where the protocol
  /// has one)
  fn close(&mut self, handle: &mut Self::Handle);

  /// How long until the provider needs a timer tick (DTLS
  /// retransmission), if it's waiting on one
  fn timeout(&self, handle: &Self::Handle) -> Option<Millis>;
}

/// Wraps an insecure [`Socket`] and a [`SecurityProvider`], yielding
/// a socket whose datagrams are (de)protected per peer.
///
/// Handshake-phase flights pass through unencrypted (the provider's
/// record layer frames them itself); once a peer's handle reports
/// [`Handshake::Done`], payload datagrams are encrypted and decrypted
/// on the way through.
pub struct Secure<Sock, Sec>
  where Sec: SecurityProvider
{
  sock: Sock,
  sec: RefCell<Sec>,
  handles: RefCell<BTreeMap<SocketAddr, Peer<Sec::Handle>>>,
}

impl<Sock, Sec> Debug for Secure<Sock, Sec>
  where Sock: Debug,
        Sec: SecurityProvider
{
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Secure")
     .field("sock", &self.sock)
     .field("peers", &self.handles.borrow().len())
     .finish()
  }
}

struct Peer<H> {
  handle: H,
  established: bool,
}

/// Errors from a secured socket
#[derive(Debug)]
pub enum Error<SockError, SecError> {
  /// The inner socket failed
  Sock(SockError),
  /// The security provider failed
  Sec(SecError),
}

impl<Sock, Sec> Secure<Sock, Sec>
  where Sock: Socket,
        Sec: SecurityProvider
{
  /// Secure an already-bound socket
  pub fn new(sock: Sock, sec: Sec) -> Self {
    Self { sock,
           sec: RefCell::new(sec),
           handles: RefCell::new(BTreeMap::new()) }
  }

  /// Borrow the inner socket
  pub fn inner(&self) -> &Sock {
    &self.sock
  }

  /// Step the handshake with `peer`, creating a client-side session
  /// if none exists. Returns the handshake state after stepping.
  pub fn handshake(&self, peer: SocketAddr) -> Result<Handshake, Sec::Error> {
    let mut sec = self.sec.borrow_mut();
    let mut handles = self.handles.borrow_mut();

    if !handles.contains_key(&peer) {
      let handle = sec.client_session(peer)?;
      handles.insert(peer,
                     Peer { handle,
                            established: false });
    }

    let entry = handles.get_mut(&peer).unwrap();
    let state = sec.handshake(&mut entry.handle);
    if state == Handshake::Done {
      entry.established = true;
    }
    Ok(state)
  }

  /// Accept a server-side session for a peer whose first flight
  /// just arrived
  pub fn accept(&self, peer: SocketAddr) -> Result<(), Sec::Error> {
    let mut sec = self.sec.borrow_mut();
    let mut handles = self.handles.borrow_mut();

    if !handles.contains_key(&peer) {
      let handle = sec.server_session(peer)?;
      handles.insert(peer,
                     Peer { handle,
                            established: false });
    }
    Ok(())
  }

  /// Close and discard the secure state for `peer`
  pub fn close(&self, peer: SocketAddr) {
    let mut sec = self.sec.borrow_mut();
    if let Some(mut entry) = self.handles.borrow_mut().remove(&peer) {
      sec.close(&mut entry.handle);
    }
  }

  /// Whether `peer`'s channel is established
  pub fn established(&self, peer: SocketAddr) -> bool {
    self.handles
        .borrow()
        .get(&peer)
        .map(|p| p.established)
        .unwrap_or(false)
  }
}

impl<Sock, Sec> Socket for Secure<Sock, Sec>
  where Sock: Socket,
        Sec: SecurityProvider
{
  type Error = Error<Sock::Error, Sec::Error>;

  fn local_addr(&self) -> SocketAddr {
    self.sock.local_addr()
  }

  fn bind_raw<A: no_std_net::ToSocketAddrs>(_: A) -> Result<Self, Self::Error> {
    // a provider instance is required; bind the inner socket and use
    // `Secure::new` instead
    unimplemented!("use Secure::new(Sock::bind(..), provider)")
  }

  fn send(&self, msg: Addrd<&[u8]>) -> nb::Result<(), Self::Error> {
    let addr = msg.addr();
    let mut handles = self.handles.borrow_mut();

    match handles.get_mut(&addr) {
      | Some(peer) if peer.established => {
        let cipher = self.sec
                         .borrow_mut()
                         .encrypt(&mut peer.handle, msg.data())
                         .map_err(Error::Sec)
                         .map_err(nb::Error::Other)?;
        self.sock
            .send(Addrd(&cipher, addr))
            .map_err(|e| e.map(Error::Sock))
      },
      | _ => self.sock.send(msg).map_err(|e| e.map(Error::Sock)),
    }
  }

  fn recv(&self, buffer: &mut [u8]) -> nb::Result<Addrd<usize>, Self::Error> {
    let Addrd(n, addr) = self.sock
                             .recv(buffer)
                             .map_err(|e| e.map(Error::Sock))?;

    let mut handles = self.handles.borrow_mut();
    match handles.get_mut(&addr) {
      | Some(peer) if peer.established => {
        let plain = self.sec
                        .borrow_mut()
                        .decrypt(&mut peer.handle, &buffer[..n])
                        .map_err(Error::Sec)
                        .map_err(nb::Error::Other)?;
        let n = plain.len().min(buffer.len());
        buffer[..n].copy_from_slice(&plain[..n]);
        Ok(Addrd(n, addr))
      },
      | _ => Ok(Addrd(n, addr)),
    }
  }

  fn peek(&self, buffer: &mut [u8]) -> nb::Result<Addrd<usize>, Self::Error> {
    self.sock.peek(buffer).map_err(|e| e.map(Error::Sock))
  }

  fn join_multicast(&self, addr: no_std_net::IpAddr) -> Result<(), Self::Error> {
    self.sock.join_multicast(addr).map_err(Error::Sock)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test::{dummy_addr, SockMock};

  /// XORs every byte with a per-session pad; close enough to
  /// observe that bytes pass through the provider.
  #[derive(Debug, Default)]
  struct XorProvider;

  impl SecurityProvider for XorProvider {
    type Handle = u8;
    type Error = core::convert::Infallible;

    fn client_session(&mut self, _: SocketAddr) -> Result<u8, Self::Error> {
      Ok(0xAA)
    }

    fn server_session(&mut self, _: SocketAddr) -> Result<u8, Self::Error> {
      Ok(0xAA)
    }

    fn handshake(&mut self, _: &mut u8) -> Handshake {
      Handshake::Done
    }

    fn encrypt(&mut self, pad: &mut u8, plain: &[u8]) -> Result<Vec<u8>, Self::Error> {
      Ok(plain.iter().map(|b| b ^ *pad).collect())
    }

    fn decrypt(&mut self, pad: &mut u8, cipher: &[u8]) -> Result<Vec<u8>, Self::Error> {
      Ok(cipher.iter().map(|b| b ^ *pad).collect())
    }

    fn close(&mut self, _: &mut u8) {}

    fn timeout(&self, _: &u8) -> Option<Millis> {
      None
    }
  }

  #[test]
  fn datagrams_pass_through_provider_once_established() {
    let sock = Secure::new(SockMock::new(), XorProvider);
    let peer = dummy_addr();

    assert_eq!(sock.handshake(peer).unwrap(), Handshake::Done);
    assert!(sock.established(peer));

    sock.send(Addrd(&[1u8, 2, 3][..], peer)).unwrap();
    let sent = sock.inner().tx.borrow().last().unwrap().clone();
    assert_eq!(sent.data(), &[1 ^ 0xAA, 2 ^ 0xAA, 3 ^ 0xAA]);
  }

  #[test]
  fn unknown_peers_bypass_encryption() {
    let sock = Secure::new(SockMock::new(), XorProvider);
    sock.send(Addrd(&[9u8][..], dummy_addr())).unwrap();
    assert_eq!(sock.inner().tx.borrow().last().unwrap().data(), &[9u8]);
  }
}
