//! `newt` is a Rust CoAP endpoint runtime that aims to be:
//! - Platform-independent
//! - Deterministic and highly testable
//! - Approachable
//!
//! ## CoAP
//! CoAP is an application-level network protocol that copies the semantics
//! of HTTP to an environment conducive to **constrained** devices. (weak
//! hardware, small battery capacity, etc.)
//!
//! This means that you can write and run two-way RESTful communication
//! between devices very similarly to the networking semantics you are
//! most likely very familiar with.
//!
//! ### Similarities to HTTP
//! CoAP has the same verbs and many of the same semantics as HTTP;
//! - GET, POST, PUT, DELETE
//! - Headers (renamed to Options)
//! - Data format independent (via the Content-Format Option)
//! - Response status codes
//!
//! ### Differences from HTTP
//! - CoAP customarily sits on top of UDP (although RFC 8323 maps it onto
//!   TCP/TLS byte streams, which the [`newt_msg::framed`] codec covers)
//! - Because UDP is a "connectionless" protocol, reliability is CoAP's own
//!   problem: Confirmable messages are retransmitted on an exponential
//!   backoff until acknowledged, and receivers deduplicate by message id
//! - While *classes* of status codes are the same (2xx -> 2.xx,
//!   4xx -> 4.xx, 5xx -> 5.xx), the semantics of the individual response
//!   codes differ
//!
//! ## Structure
//! A [`core::Core`] owns one socket, one clock, and all protocol state for
//! the peers behind that socket: [`session`]s, the retransmission
//! [`sendq`], [`dedup`] history, [`block`]-wise transfer state,
//! [`observe`] subscriptions, served [`resource`]s, and the response
//! [`cache`]. Everything is driven from [`core::Core::process`], which is
//! the only place the runtime will wait.

// -
// style
#![allow(clippy::unused_unit)]
// -
// deny
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(not(test), deny(unsafe_code))]
// -
// warnings
#![cfg_attr(not(test), warn(unreachable_pub))]
// -
// features
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc as std_alloc;

#[cfg(test)]
pub(crate) mod test;

pub(crate) mod logging;

/// retransmission schedules
pub mod retry;

/// configuring runtime behavior
pub mod config;

/// time abstractions
pub mod time;

/// network abstractions
pub mod net;

/// pluggable (D)TLS seam
pub mod secure;

/// per-peer protocol state
pub mod session;

/// the send queue & retransmit engine
pub mod sendq;

/// inbound message deduplication
pub mod dedup;

/// block-wise transfers
pub mod block;

/// observe registrations & notification fan-out
pub mod observe;

/// served resources & request dispatch
pub mod resource;

/// response caching & request coalescing
pub mod cache;

/// the context & event loop
pub mod core;

/// `std`-only newt stuff
#[cfg(feature = "std")]
pub mod std;

/// Helper constants and functions for creating multicast addresses
pub mod multicast {
  use no_std_net::{Ipv4Addr, SocketAddr, SocketAddrV4};

  /// IPv4 "All CoAP devices" multicast address.
  ///
  /// If using multicast to discover devices, it's recommended
  /// that you use this address with a port specific to your application.
  pub const ALL_COAP_DEVICES_IP: Ipv4Addr = Ipv4Addr::new(224, 0, 1, 187);

  /// Create a SocketAddr (IP + port) with the [`ALL_COAP_DEVICES_IP`] address
  pub const fn all_coap_devices(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(ALL_COAP_DEVICES_IP, port))
  }
}

/// Response codes used by the runtime itself
pub mod code {
  use newt_msg::Code;

  /// 2.03 Valid
  pub const VALID: Code = Code::new(2, 3);
  /// 2.05 Content
  pub const CONTENT: Code = Code::new(2, 5);
  /// 4.02 Bad Option
  pub const BAD_OPTION: Code = Code::new(4, 2);
  /// 4.04 Not Found
  pub const NOT_FOUND: Code = Code::new(4, 4);
  /// 4.05 Method Not Allowed
  pub const METHOD_NOT_ALLOWED: Code = Code::new(4, 5);
  /// 4.08 Request Entity Incomplete
  pub const REQUEST_ENTITY_INCOMPLETE: Code = Code::new(4, 8);
  /// 4.13 Request Entity Too Large
  pub const REQUEST_ENTITY_TOO_LARGE: Code = Code::new(4, 13);
  /// 5.03 Service Unavailable
  pub const SERVICE_UNAVAILABLE: Code = Code::new(5, 3);
}
