//! In-memory transport between two connections.
//!
//! Each direction moves through an [`OutBuf`] of `chunk` bytes, so a
//! `chunk` of 1 forces every scalar to suspend and resume.

use std::time::Instant;

use fabric_error::Result;

use crate::buf::OutBuf;
use crate::connection::Connection;

#[derive(Debug)]
pub struct Loopback {
    pub left: Connection,
    pub right: Connection,
    left_out: OutBuf,
    right_out: OutBuf,
}

impl Loopback {
    #[must_use]
    pub fn new(left: Connection, right: Connection, chunk: usize) -> Self {
        Self {
            left,
            right,
            left_out: OutBuf::with_capacity(chunk),
            right_out: OutBuf::with_capacity(chunk),
        }
    }

    /// Move one chunk each way. Returns the bytes moved.
    pub fn pump(&mut self, now: Instant) -> Result<usize> {
        let mut moved = 0;
        if !self.left.is_closed() || self.left.pending_sends() > 0 {
            self.left.poll_write(now, &mut self.left_out)?;
            let bytes = self.left_out.take();
            moved += bytes.len();
            self.right.on_bytes(now, &bytes)?;
        }
        if !self.right.is_closed() || self.right.pending_sends() > 0 {
            self.right.poll_write(now, &mut self.right_out)?;
            let bytes = self.right_out.take();
            moved += bytes.len();
            self.left.on_bytes(now, &bytes)?;
        }
        Ok(moved)
    }

    /// Pump until a round moves nothing and both ends are quiescent, or
    /// `max_rounds` is reached. Returns the rounds used.
    pub fn run_until_idle(&mut self, now: Instant, max_rounds: usize) -> Result<usize> {
        for round in 0..max_rounds {
            let moved = self.pump(now)?;
            if moved == 0 && self.left.is_quiescent() && self.right.is_quiescent() {
                return Ok(round + 1);
            }
        }
        Ok(max_rounds)
    }
}
