//! Bounded raw output log with absolute offsets

use std::collections::VecDeque;

/// Append-only byte log that evicts its oldest bytes past a capacity.
///
/// Offsets count every byte ever appended, so a cursor handed out before an
/// eviction still points at the same position in the output afterwards.
#[derive(Debug)]
pub struct RawLog {
    buf: VecDeque<u8>,
    /// Absolute offset of `buf[0]`
    start: u64,
    capacity: usize,
}

impl RawLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::new(),
            start: 0,
            capacity: capacity.max(1),
        }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        let bytes = if bytes.len() > self.capacity {
            let skipped = bytes.len() - self.capacity;
            self.start += (self.buf.len() + skipped) as u64;
            self.buf.clear();
            &bytes[skipped..]
        } else {
            bytes
        };

        let overflow = (self.buf.len() + bytes.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.buf.drain(..overflow);
            self.start += overflow as u64;
        }
        self.buf.extend(bytes);
    }

    /// Offset of the oldest retained byte
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Offset one past the newest byte
    pub fn end(&self) -> u64 {
        self.start + self.buf.len() as u64
    }

    /// Retained bytes from `cursor` to the end.
    ///
    /// A cursor older than the retained window reads from the oldest byte
    /// still held; one past the end reads nothing.
    pub fn since(&self, cursor: u64) -> Vec<u8> {
        let from = cursor.clamp(self.start, self.end()) - self.start;
        self.buf.range(from as usize..).copied().collect()
    }
}
