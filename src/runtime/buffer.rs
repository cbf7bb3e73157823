//! Fixed-capacity connection buffer.
//!
//! A `Buffer` holds one echo round: bytes are read into the spare region,
//! transformed in place, then drained through a write cursor. The valid
//! length marker never moves while bytes are being written, and the buffer
//! is only refilled after it has been fully drained and cleared.

/// Fixed-size byte region with a valid-length marker and a write cursor.
#[derive(Debug)]
pub struct Buffer {
    /// Backing storage. Never reallocated after construction.
    data: Box<[u8]>,
    /// Number of valid bytes, starting at offset 0.
    len: usize,
    /// Number of valid bytes already written out.
    written: usize,
}

impl Buffer {
    /// Create an empty buffer with `capacity` bytes of storage.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
            written: 0,
        }
    }

    /// Writable region past the valid bytes.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.len..]
    }

    /// Mark `n` more bytes of the spare region as valid.
    ///
    /// # Panics
    /// Panics if `n` exceeds the spare capacity.
    pub fn fill(&mut self, n: usize) {
        assert!(self.len + n <= self.data.len(), "fill past capacity");
        self.len += n;
    }

    /// All valid bytes, written or not.
    pub fn valid_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }

    /// Valid bytes not yet written.
    pub fn pending(&self) -> &[u8] {
        &self.data[self.written..self.len]
    }

    /// Record that `n` pending bytes were written.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.written + n <= self.len, "advance past valid bytes");
        self.written = (self.written + n).min(self.len);
    }

    pub fn has_pending(&self) -> bool {
        self.written < self.len
    }

    /// Reset to empty so the next read starts at offset 0.
    pub fn clear(&mut self) {
        self.len = 0;
        self.written = 0;
    }
}
