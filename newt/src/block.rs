//! Block-wise transfers (RFC 7959).
//!
//! Payloads bigger than the negotiated block size travel as a
//! sequence of Block1 (request body) or Block2 (response body)
//! options. [`Outbound`] slices an owned payload into blocks on
//! demand; [`Assemblers`] accumulates inbound sequences keyed by
//! `(peer, token, direction)` and yields the stitched payload when
//! the final block lands.

use newt_msg::known::Block;
use newt_msg::Token;
use no_std_net::SocketAddr;
use std_alloc::collections::BTreeMap;
use std_alloc::vec::Vec;

/// Which body a block option describes
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Direction {
  /// Block1: a request body flowing to a server
  Request,
  /// Block2: a response body flowing to a client
  Response,
}

/// A large payload being sent out in blocks.
///
/// Block size may be negotiated *down* mid-transfer (the peer echoed
/// a smaller SZX); it never goes back up.
#[derive(Clone, Debug, PartialEq)]
pub struct Outbound {
  payload: Vec<u8>,
  block_size: u16,
  direction: Direction,
}

impl Outbound {
  /// Stage `payload` for block-wise sending
  pub fn new(payload: Vec<u8>, block_size: u16, direction: Direction) -> Self {
    Self { payload,
           block_size: block_size.clamp(16, 1024),
           direction }
  }

  /// Which body this transfer carries
  pub fn direction(&self) -> Direction {
    self.direction
  }

  /// Total payload length (the Size1/Size2 advertisement)
  pub fn total_len(&self) -> usize {
    self.payload.len()
  }

  /// Number of blocks at the current block size
  pub fn block_count(&self) -> u32 {
    (self.payload.len() as u32).div_ceil(self.block_size as u32)
  }

  /// The descriptor + bytes of block `num`, or `None` past the end
  pub fn block(&self, num: u32) -> Option<(Block, &[u8])> {
    let start = num as usize * self.block_size as usize;
    if start >= self.payload.len() && !(start == 0 && self.payload.is_empty()) {
      return None;
    }

    let end = (start + self.block_size as usize).min(self.payload.len());
    let more = end < self.payload.len();
    Some((Block::new(self.block_size, num, more), &self.payload[start..end]))
  }

  /// The peer asked for a smaller block size; shrink and recompute.
  ///
  /// Block numbers refer to the *new* size afterwards, per RFC 7959
  /// section 2.5. Growing is refused.
  pub fn negotiate(&mut self, size: u16) {
    self.block_size = self.block_size.min(size.clamp(16, 1024));
  }

  /// Current block size
  pub fn block_size(&self) -> u16 {
    self.block_size
  }
}

/// Why an inbound block was rejected
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockError {
  /// NUM was not the next expected block number; answer
  /// 4.08 Request Entity Incomplete
  OutOfOrder {
    /// the block number we wanted
    expected: u32,
    /// the block number we got
    got: u32,
  },
  /// The staged body outgrew the configured cap; answer
  /// 5.03 Service Unavailable with Max-Age
  TooLarge,
}

/// Progress of an inbound transfer after feeding it a block
#[derive(Clone, Debug, PartialEq)]
pub enum Progress {
  /// More blocks expected; for Block2, ask for `next` next
  Partial {
    /// the next NUM to request/expect
    next: u32,
  },
  /// `M = 0` landed; here is the whole body
  Done(Vec<u8>),
}

/// One inbound transfer being stitched together
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Assembler {
  buf: Vec<u8>,
  next_num: u32,
}

impl Assembler {
  /// Feed the next block. `max_len` caps the staged body.
  pub fn feed(&mut self,
              block: Block,
              payload: &[u8],
              max_len: usize)
              -> Result<Progress, BlockError> {
    if block.num() != self.next_num {
      return Err(BlockError::OutOfOrder { expected: self.next_num,
                                          got: block.num() });
    }

    if self.buf.len() + payload.len() > max_len {
      return Err(BlockError::TooLarge);
    }

    self.buf.extend_from_slice(payload);
    self.next_num += 1;

    if block.more() {
      Ok(Progress::Partial { next: self.next_num })
    } else {
      Ok(Progress::Done(core::mem::take(&mut self.buf)))
    }
  }

  /// Bytes staged so far
  pub fn staged(&self) -> usize {
    self.buf.len()
  }
}

/// All in-flight inbound transfers behind an endpoint.
///
/// A fresh transfer under a token that already has state simply
/// replaces it: transfers are restartable and the new token's
/// accumulator starts clean.
#[derive(Debug, Default)]
pub struct Assemblers {
  transfers: BTreeMap<(SocketAddr, Token, Direction), Assembler>,
  /// Cap on any single staged body, in bytes
  pub max_body: usize,
}

impl Assemblers {
  /// An empty set with a staging cap
  pub fn new(max_body: usize) -> Self {
    Self { transfers: BTreeMap::new(),
           max_body }
  }

  /// Feed a block for `(peer, token, direction)`, creating the
  /// accumulator on NUM 0.
  ///
  /// Errors drop the accumulator; the peer restarts from scratch.
  pub fn feed(&mut self,
              peer: SocketAddr,
              token: Token,
              direction: Direction,
              block: Block,
              payload: &[u8])
              -> Result<Progress, BlockError> {
    let key = (peer, token, direction);

    if block.num() == 0 {
      self.transfers.insert(key, Assembler::default());
    }

    let max_body = self.max_body;
    let assembler = self.transfers.entry(key).or_default();

    match assembler.feed(block, payload, max_body) {
      | Ok(Progress::Done(body)) => {
        self.transfers.remove(&key);
        Ok(Progress::Done(body))
      },
      | Ok(partial) => Ok(partial),
      | Err(e) => {
        self.transfers.remove(&key);
        Err(e)
      },
    }
  }

  /// Drop all transfers with `peer` (session teardown)
  pub fn forget(&mut self, peer: SocketAddr) {
    self.transfers.retain(|(p, _, _), _| *p != peer);
  }

  /// Number of in-flight transfers
  pub fn len(&self) -> usize {
    self.transfers.len()
  }

  /// Whether no transfers are in flight
  pub fn is_empty(&self) -> bool {
    self.transfers.is_empty()
  }
}
