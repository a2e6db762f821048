//! Byte buffers between the codec and the transport.
//!
//! The transport feeds received bytes into an [`InBuf`] and drains an
//! [`OutBuf`] whenever it can send. Neither ever blocks; a codec that runs
//! out of input or output space suspends and reports [`Progress::Suspended`].

/// Outcome of driving a resumable codec step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Everything that was queued has been processed.
    Complete,
    /// Waiting for more input bytes or more output space.
    Suspended,
}

impl Progress {
    #[must_use]
    pub const fn is_complete(self) -> bool {
        matches!(self, Self::Complete)
    }
}

/// Received bytes not yet consumed by a reader.
#[derive(Debug, Default)]
pub struct InBuf {
    data: Vec<u8>,
    pos: usize,
}

impl InBuf {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes, dropping the consumed prefix first.
    pub fn feed(&mut self, bytes: &[u8]) {
        if self.pos > 0 {
            self.data.drain(..self.pos);
            self.pos = 0;
        }
        self.data.extend_from_slice(bytes);
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Consume up to `n` bytes.
    pub fn take_up_to(&mut self, n: usize) -> &[u8] {
        let end = self.pos + n.min(self.remaining());
        let taken = &self.data[self.pos..end];
        self.pos = end;
        taken
    }
}

impl From<Vec<u8>> for InBuf {
    fn from(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }
}

/// Bounded output window filled by a writer and drained by the transport.
#[derive(Debug)]
pub struct OutBuf {
    data: Vec<u8>,
    capacity: usize,
}

impl OutBuf {
    /// `capacity` is clamped to at least one byte.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            data: Vec::with_capacity(capacity.min(64 * 1024)),
            capacity,
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn space(&self) -> usize {
        self.capacity - self.data.len()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.space() == 0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copy as much of `bytes` as fits; returns the count copied.
    pub fn put(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.space());
        self.data.extend_from_slice(&bytes[..n]);
        n
    }

    /// Hand the buffered bytes to the transport.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }
}
