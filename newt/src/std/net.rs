use std::io;

use crate::net::{Addrd, Socket};

fn io_to_nb(err: io::Error) -> nb::Error<io::Error> {
  match err.kind() {
    | io::ErrorKind::WouldBlock => nb::Error::WouldBlock,
    | _ => nb::Error::Other(err),
  }
}

pub(crate) mod addr {
  /// std -> no_std
  pub(crate) fn from_std(addr: std::net::SocketAddr) -> no_std_net::SocketAddr {
    match addr {
      | std::net::SocketAddr::V4(v4) => {
        let [a, b, c, d] = v4.ip().octets();
        no_std_net::SocketAddr::V4(no_std_net::SocketAddrV4::new(no_std_net::Ipv4Addr::new(a, b, c, d),
                                                                 v4.port()))
      },
      | std::net::SocketAddr::V6(v6) => {
        let [a, b, c, d, e, f, g, h] = v6.ip().segments();
        no_std_net::SocketAddr::V6(no_std_net::SocketAddrV6::new(no_std_net::Ipv6Addr::new(a, b, c, d,
                                                                                           e, f, g, h),
                                                                 v6.port(),
                                                                 v6.flowinfo(),
                                                                 v6.scope_id()))
      },
    }
  }

  /// no_std -> std
  pub(crate) fn to_std(addr: no_std_net::SocketAddr) -> std::net::SocketAddr {
    match addr {
      | no_std_net::SocketAddr::V4(v4) => {
        let [a, b, c, d] = v4.ip().octets();
        std::net::SocketAddr::V4(std::net::SocketAddrV4::new(std::net::Ipv4Addr::new(a, b, c, d),
                                                             v4.port()))
      },
      | no_std_net::SocketAddr::V6(v6) => {
        let [a, b, c, d, e, f, g, h] = v6.ip().segments();
        std::net::SocketAddr::V6(std::net::SocketAddrV6::new(std::net::Ipv6Addr::new(a, b, c, d,
                                                                                     e, f, g, h),
                                                             v6.port(),
                                                             v6.flowinfo(),
                                                             v6.scope_id()))
      },
    }
  }

  pub(crate) fn ip_to_std(ip: no_std_net::IpAddr) -> std::net::IpAddr {
    match ip {
      | no_std_net::IpAddr::V4(v4) => {
        let [a, b, c, d] = v4.octets();
        std::net::IpAddr::V4(std::net::Ipv4Addr::new(a, b, c, d))
      },
      | no_std_net::IpAddr::V6(v6) => {
        let [a, b, c, d, e, f, g, h] = v6.segments();
        std::net::IpAddr::V6(std::net::Ipv6Addr::new(a, b, c, d, e, f, g, h))
      },
    }
  }
}

impl Socket for std::net::UdpSocket {
  type Error = io::Error;

  fn local_addr(&self) -> no_std_net::SocketAddr {
    addr::from_std(std::net::UdpSocket::local_addr(self).expect("bound socket has a local addr"))
  }

  fn bind_raw<A: no_std_net::ToSocketAddrs>(addr: A) -> Result<Self, Self::Error> {
    let addrs = addr.to_socket_addrs()
                    .unwrap()
                    .map(addr::to_std)
                    .collect::<Vec<std::net::SocketAddr>>();

    let sock = std::net::UdpSocket::bind(addrs.as_slice())?;
    sock.set_nonblocking(true)?;
    Ok(sock)
  }

  fn send(&self, msg: Addrd<&[u8]>) -> nb::Result<(), Self::Error> {
    self.send_to(msg.data(), addr::to_std(msg.addr()))
        .map(|_| ())
        .map_err(io_to_nb)
  }

  fn recv(&self, buffer: &mut [u8]) -> nb::Result<Addrd<usize>, Self::Error> {
    self.recv_from(buffer)
        .map(|(n, from)| Addrd(n, addr::from_std(from)))
        .map_err(io_to_nb)
  }

  fn peek(&self, buffer: &mut [u8]) -> nb::Result<Addrd<usize>, Self::Error> {
    self.peek_from(buffer)
        .map(|(n, from)| Addrd(n, addr::from_std(from)))
        .map_err(io_to_nb)
  }

  fn join_multicast(&self, ip: no_std_net::IpAddr) -> Result<(), Self::Error> {
    match addr::ip_to_std(ip) {
      | std::net::IpAddr::V4(v4) => {
        self.join_multicast_v4(&v4, &std::net::Ipv4Addr::UNSPECIFIED)
      },
      | std::net::IpAddr::V6(v6) => self.join_multicast_v6(&v6, 0),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::Socket as _;

  fn loopback() -> no_std_net::SocketAddr {
    "127.0.0.1:0".parse().unwrap()
  }

  #[test]
  fn udp_sockets_talk() {
    let a = std::net::UdpSocket::bind_raw(loopback()).unwrap();
    let b = std::net::UdpSocket::bind_raw(loopback()).unwrap();

    let b_addr = crate::net::Socket::local_addr(&b);
    nb::block!(crate::net::Socket::send(&a, Addrd(&[1u8, 2, 3][..], b_addr))).unwrap();

    let mut buf = [0u8; 16];
    let Addrd(n, from) = nb::block!(crate::net::Socket::recv(&b, &mut buf)).unwrap();
    assert_eq!(&buf[..n], &[1, 2, 3]);
    assert_eq!(from, crate::net::Socket::local_addr(&a));
  }

  #[test]
  fn empty_socket_would_block() {
    let sock = std::net::UdpSocket::bind_raw(loopback()).unwrap();
    let mut buf = [0u8; 16];
    assert!(matches!(crate::net::Socket::recv(&sock, &mut buf), Err(nb::Error::WouldBlock)));
  }
}
