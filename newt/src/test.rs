#![allow(dead_code)]

use core::cell::{Cell, RefCell};

use std::rc::Rc;

use embedded_time::rate::Fraction;
use embedded_time::Instant;
use newt_msg::{Code, Id, Message, Token, Type};
use no_std_net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::net::{Addrd, Socket};

pub fn dummy_addr() -> SocketAddr {
  SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 1), 8080))
}

pub fn dummy_addr_2() -> SocketAddr {
  SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 2), 8080))
}

pub fn dummy_addr_3() -> SocketAddr {
  SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 3), 8080))
}

/// A bare message fixture with no options or payload
pub fn msg(ty: Type, code: Code, id: u16, addr: SocketAddr) -> Addrd<Message> {
  Addrd(Message::new(ty, code, Id(id), Token::empty()), addr)
}

/// A clock that only moves when told to. Ticks are milliseconds.
///
/// Clones share the same underlying time, so a handle kept outside
/// a [`crate::core::Core`] can advance the clock inside it.
#[derive(Clone, Debug, Default)]
pub struct ClockMock(pub Rc<Cell<u64>>);

impl ClockMock {
  pub fn new() -> Self {
    Default::default()
  }

  pub fn set(&self, to: u64) {
    self.0.set(to);
  }

  pub fn instant(n: u64) -> Instant<Self> {
    Instant::new(n)
  }

  pub fn try_now_(&self) -> Instant<Self> {
    use embedded_time::Clock;
    self.try_now().unwrap()
  }
}

impl embedded_time::Clock for ClockMock {
  type T = u64;

  const SCALING_FACTOR: Fraction = Fraction::new(1, 1_000);

  fn try_now(&self) -> Result<Instant<Self>, embedded_time::clock::Error> {
    Ok(Instant::new(self.0.get()))
  }
}

/// A mocked socket.
///
/// `rx` holds inbound datagrams (the address is the sender); `tx`
/// collects outbound datagrams (the address is the destination).
#[derive(Clone, Debug)]
pub struct SockMock {
  pub rx: Rc<RefCell<Vec<Addrd<Vec<u8>>>>>,
  pub tx: Rc<RefCell<Vec<Addrd<Vec<u8>>>>>,
  pub addr: Rc<Cell<SocketAddr>>,
}

impl Default for SockMock {
  fn default() -> Self {
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 5683));
    Self { rx: Default::default(),
           tx: Default::default(),
           addr: Rc::new(Cell::new(addr)) }
  }
}

impl SockMock {
  pub fn new() -> Self {
    Default::default()
  }

  /// Pretend the socket is bound to `addr` (e.g. a multicast group)
  pub fn set_local_addr(&self, addr: SocketAddr) {
    self.addr.set(addr);
  }

  /// Queue `bytes` as if `from` had sent them to us
  pub fn rx_bytes(&self, from: SocketAddr, bytes: Vec<u8>) {
    self.rx.borrow_mut().push(Addrd(bytes, from));
  }

  /// Everything sent to `to`, drained
  pub fn sent_to(&self, to: SocketAddr) -> Vec<Vec<u8>> {
    let mut tx = self.tx.borrow_mut();
    let (matched, rest): (Vec<_>, Vec<_>) = tx.drain(..).partition(|d| d.addr() == to);
    *tx = rest;
    matched.into_iter().map(|d| d.unwrap()).collect()
  }
}

impl Socket for SockMock {
  type Error = ();

  fn local_addr(&self) -> SocketAddr {
    self.addr.get()
  }

  fn bind_raw<A: no_std_net::ToSocketAddrs>(_: A) -> Result<Self, Self::Error> {
    Ok(Self::new())
  }

  fn send(&self, buf: Addrd<&[u8]>) -> nb::Result<(), Self::Error> {
    self.tx.borrow_mut().push(buf.map(Vec::from));
    Ok(())
  }

  fn recv(&self, buf: &mut [u8]) -> nb::Result<Addrd<usize>, Self::Error> {
    let mut rx = self.rx.borrow_mut();

    if rx.is_empty() {
      return Err(nb::Error::WouldBlock);
    }

    let dgram = rx.remove(0);
    let n = dgram.data().len().min(buf.len());
    buf[..n].copy_from_slice(&dgram.data()[..n]);

    Ok(Addrd(n, dgram.addr()))
  }

  fn peek(&self, buf: &mut [u8]) -> nb::Result<Addrd<usize>, Self::Error> {
    let rx = self.rx.borrow();

    match rx.first() {
      | None => Err(nb::Error::WouldBlock),
      | Some(dgram) => {
        let n = dgram.data().len().min(buf.len());
        buf[..n].copy_from_slice(&dgram.data()[..n]);
        Ok(Addrd(n, dgram.addr()))
      },
    }
  }

  fn join_multicast(&self, _: no_std_net::IpAddr) -> Result<(), Self::Error> {
    Ok(())
  }
}

#[test]
fn sock_mock_roundtrip() {
  let sock = SockMock::new();
  sock.rx_bytes(dummy_addr(), vec![1, 2, 3]);

  let mut buf = [0u8; 8];
  let Addrd(n, from) = nb::block!(sock.recv(&mut buf)).unwrap();
  assert_eq!((&buf[..n], from), (&[1u8, 2, 3][..], dummy_addr()));

  nb::block!(sock.send(Addrd(&[4u8][..], dummy_addr_2()))).unwrap();
  assert_eq!(sock.sent_to(dummy_addr_2()), vec![vec![4u8]]);
}
