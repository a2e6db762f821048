//! Scalars that survive suspension halfway through.

use smallvec::SmallVec;

use crate::buf::{InBuf, OutBuf};

/// Reads fixed-width big-endian scalars, keeping the bytes of a scalar
/// that was cut off by the end of the input until the rest arrives.
#[derive(Debug, Default)]
pub struct ScalarReader {
    partial: SmallVec<[u8; 16]>,
}

impl ScalarReader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether no scalar is half read.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.partial.is_empty()
    }

    pub fn fixed<const N: usize>(&mut self, input: &mut InBuf) -> Option<[u8; N]> {
        let need = N - self.partial.len();
        self.partial.extend_from_slice(input.take_up_to(need));
        if self.partial.len() < N {
            return None;
        }
        let mut out = [0_u8; N];
        out.copy_from_slice(&self.partial);
        self.partial.clear();
        Some(out)
    }

    pub fn u8(&mut self, input: &mut InBuf) -> Option<u8> {
        self.fixed::<1>(input).map(|b| b[0])
    }

    pub fn u16(&mut self, input: &mut InBuf) -> Option<u16> {
        self.fixed::<2>(input).map(u16::from_be_bytes)
    }

    pub fn u32(&mut self, input: &mut InBuf) -> Option<u32> {
        self.fixed::<4>(input).map(u32::from_be_bytes)
    }

    pub fn i32(&mut self, input: &mut InBuf) -> Option<i32> {
        self.fixed::<4>(input).map(i32::from_be_bytes)
    }

    pub fn u64(&mut self, input: &mut InBuf) -> Option<u64> {
        self.fixed::<8>(input).map(u64::from_be_bytes)
    }

    pub fn i64(&mut self, input: &mut InBuf) -> Option<i64> {
        self.fixed::<8>(input).map(i64::from_be_bytes)
    }

    /// Append input to `dst` until it holds `len` bytes. Returns whether it
    /// does.
    pub fn bytes_into(input: &mut InBuf, dst: &mut Vec<u8>, len: usize) -> bool {
        let need = len.saturating_sub(dst.len());
        dst.extend_from_slice(input.take_up_to(need));
        dst.len() >= len
    }
}

/// Stages encoded bytes and drains them into an [`OutBuf`] as space
/// allows. Staging always succeeds; only draining can suspend.
#[derive(Debug, Default)]
pub struct ScalarWriter {
    pending: Vec<u8>,
    pos: usize,
}

impl ScalarWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.pending.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.pending.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.pending.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.pending.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.pending.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.pending.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Bytes staged but not yet written.
    #[must_use]
    pub fn staged(&self) -> usize {
        self.pending.len() - self.pos
    }

    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.staged() == 0
    }

    /// Remove and return the staged bytes instead of writing them.
    pub fn take_staged(&mut self) -> Vec<u8> {
        let staged = self.pending.split_off(self.pos);
        self.pending.clear();
        self.pos = 0;
        staged
    }

    /// Move staged bytes into `out`. Returns whether everything staged has
    /// been written.
    pub fn drain_into(&mut self, out: &mut OutBuf) -> bool {
        self.pos += out.put(&self.pending[self.pos..]);
        if self.pos < self.pending.len() {
            return false;
        }
        self.pending.clear();
        self.pos = 0;
        true
    }
}
