//! Fixed-capacity circular byte buffer.
//!
//! The ring holds bytes the application has handed to [`send`] but the
//! kernel has not yet accepted. Capacity is fixed at construction, so the
//! ring bounds per-connection memory and turns a full buffer into a
//! backpressure signal instead of unbounded queueing.
//!
//! [`send`]: crate::Connection::send

/// A FIFO byte ring with wrap-around storage.
///
/// `put` copies into free space, splitting across the storage boundary
/// into at most two copies. `get` hands out the largest contiguous
/// readable run and advances past it; when the occupied region wraps,
/// a second `get` retrieves the remainder.
pub struct RingBuffer {
    buf: Box<[u8]>,
    start: usize,
    len: usize,
}

impl RingBuffer {
    /// Creates an empty ring with a fixed capacity in bytes.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");

        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            start: 0,
            len: 0,
        }
    }

    /// Returns the fixed capacity of the ring.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Returns the number of occupied bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns the number of bytes `put` can currently accept.
    pub fn free_space(&self) -> usize {
        self.buf.len() - self.len
    }

    /// Returns `true` when no bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns `true` when the ring cannot accept another byte.
    pub fn is_full(&self) -> bool {
        self.len == self.buf.len()
    }

    /// Copies as many of `bytes` as fit into free space.
    ///
    /// Returns the count actually stored. A short count means the ring
    /// is full; the caller owns the unaccepted remainder and must retry
    /// it later rather than assume it was queued.
    pub fn put(&mut self, bytes: &[u8]) -> usize {
        let cap = self.buf.len();
        let mut remaining = bytes.len().min(self.free_space());
        let mut offset = 0;

        while remaining > 0 {
            let free_start = (self.start + self.len) % cap;
            let chunk = remaining.min(cap - free_start);

            self.buf[free_start..free_start + chunk]
                .copy_from_slice(&bytes[offset..offset + chunk]);

            self.len += chunk;
            offset += chunk;
            remaining -= chunk;
        }

        offset
    }

    /// Returns the next contiguous readable run without consuming it.
    ///
    /// The write path peeks, hands the run to one `write` syscall, then
    /// [`consume`](Self::consume)s only what the kernel accepted, so a
    /// partial write never loses or reorders bytes.
    pub fn peek(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }

        let run = (self.buf.len() - self.start).min(self.len);
        &self.buf[self.start..self.start + run]
    }

    /// Advances past `n` bytes at the front of the ring.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the current contiguous run.
    pub fn consume(&mut self, n: usize) {
        let run = (self.buf.len() - self.start).min(self.len);
        assert!(n <= run, "consume past contiguous run");

        self.start = (self.start + n) % self.buf.len();
        self.len -= n;
    }

    /// Takes the next contiguous readable run out of the ring.
    ///
    /// The returned slice may be shorter than [`len`](Self::len) when the
    /// occupied region wraps past the end of storage; call `get` again
    /// for the remainder. Returns an empty slice when the ring is empty.
    /// The view is valid until the next mutating call.
    pub fn get(&mut self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }

        let start = self.start;
        let run = (self.buf.len() - start).min(self.len);

        self.start = (start + run) % self.buf.len();
        self.len -= run;

        &self.buf[start..start + run]
    }

    /// Drops all buffered bytes without copying.
    ///
    /// Used on the abrupt close path, where unsent data is discarded.
    pub fn clear(&mut self) {
        self.start = 0;
        self.len = 0;
    }
}
