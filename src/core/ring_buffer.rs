//! Fixed-capacity byte ring used as an audio lookback window.
//!
//! Gated ASR filters keep the most recent capture audio here while no
//! provider connection is open, then drain it as pre-roll the moment voice
//! activity begins. Writes never block; once the ring is full the oldest
//! bytes are overwritten.

use parking_lot::Mutex;

struct Inner {
    buf: Vec<u8>,
    write_idx: usize,
    read_idx: usize,
    full: bool,
}

impl Inner {
    fn len(&self, capacity: usize) -> usize {
        if self.full {
            capacity
        } else if self.write_idx >= self.read_idx {
            self.write_idx - self.read_idx
        } else {
            capacity - self.read_idx + self.write_idx
        }
    }
}

/// Thread-safe overwrite-on-full byte ring.
pub struct RingBuffer {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl RingBuffer {
    /// Creates a ring holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buf: vec![0; capacity],
                write_idx: 0,
                read_idx: 0,
                full: false,
            }),
            capacity,
        }
    }

    /// Ring capacity suitable for `millis` of lookback at the given PCM
    /// format.
    pub fn for_lookback(format: &super::packet::StreamFormat, millis: u64) -> Self {
        Self::new(format.bytes_per_millisecond() * millis as usize)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends `data`, overwriting the oldest bytes once full. Input longer
    /// than the capacity keeps only its trailing `capacity` bytes.
    pub fn write(&self, data: &[u8]) {
        if self.capacity == 0 || data.is_empty() {
            return;
        }
        let data = if data.len() > self.capacity {
            &data[data.len() - self.capacity..]
        } else {
            data
        };

        let mut inner = self.inner.lock();
        for &byte in data {
            let idx = inner.write_idx;
            inner.buf[idx] = byte;
            if inner.full {
                // Overwriting unread data drags the read cursor forward.
                inner.read_idx = (inner.read_idx + 1) % self.capacity;
            }
            inner.write_idx = (inner.write_idx + 1) % self.capacity;
            if inner.write_idx == inner.read_idx {
                inner.full = true;
            }
        }
    }

    /// Number of unread bytes.
    pub fn len(&self) -> usize {
        self.inner.lock().len(self.capacity)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns up to `n` of the oldest unread bytes.
    pub fn read(&self, n: usize) -> Vec<u8> {
        // One lock acquisition: the available count must be computed under
        // the same guard that drains, or a concurrent reader could walk the
        // cursor past the write index.
        let mut inner = self.inner.lock();
        let count = n.min(inner.len(self.capacity));
        if count == 0 {
            return Vec::new();
        }

        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let idx = inner.read_idx;
            out.push(inner.buf[idx]);
            inner.read_idx = (idx + 1) % self.capacity;
        }
        inner.full = false;
        out
    }

    /// Removes and returns every unread byte.
    pub fn drain(&self) -> Vec<u8> {
        self.read(self.capacity)
    }

    /// Discards all unread bytes.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.read_idx = inner.write_idx;
        inner.full = false;
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
