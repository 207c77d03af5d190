//! Out-of-order chunk reassembly
//!
//! Large values travel as offset-tagged fragments over a lossy, unordered
//! transport. [`DynamicBuffer`] reassembles them: chunks landing at or below
//! the contiguous frontier extend it, chunks landing ahead are parked until
//! the frontier catches up, and exact duplicates are dropped.

use bytes::Bytes;

/// Reassembly buffer for one in-flight transfer.
///
/// `length` is the highest end offset seen so far (the transfer's total size
/// once the sender has emitted its last chunk); `filled` is the contiguous
/// byte count confirmed from offset 0. The transfer is complete when the
/// two meet.
#[derive(Debug, Default)]
pub struct DynamicBuffer {
    length: usize,
    filled: usize,
    ready: Vec<(usize, Bytes)>,
    future: Vec<(usize, Bytes)>,
}

impl DynamicBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn is_complete(&self) -> bool {
        self.filled == self.length
    }

    /// Place a chunk at the given byte offset.
    ///
    /// Advancing the frontier re-attempts every parked chunk in offset
    /// order, so one in-order arrival can cascade several parked ones into
    /// the ready set.
    pub fn add(&mut self, chunk: Bytes, pos: usize) {
        if !self.place(chunk, pos) {
            return;
        }

        while !self.future.is_empty() {
            let mut pending = std::mem::take(&mut self.future);
            pending.sort_by_key(|(pos, _)| *pos);

            let before = self.filled;
            for (pos, chunk) in pending {
                self.place(chunk, pos);
            }
            if self.filled == before {
                break;
            }
        }
    }

    /// Returns true iff the chunk advanced the contiguous frontier.
    fn place(&mut self, chunk: Bytes, pos: usize) -> bool {
        let Some(end) = pos.checked_add(chunk.len()) else {
            return false;
        };
        if end <= self.filled {
            // fully covered already
            return false;
        }
        if end > self.length {
            self.length = end;
        }
        if self.filled < pos {
            self.future.push((pos, chunk));
            return false;
        }
        if self.filled < end {
            self.filled = end;
        }
        self.ready.push((pos, chunk));
        true
    }

    /// Concatenate the contiguous prefix into one buffer.
    ///
    /// Callers must check [`is_complete`](Self::is_complete) first if they
    /// need the whole payload; before completion this covers only the bytes
    /// confirmed from offset 0. The result is memoized as a single ready
    /// chunk so repeated calls do not re-copy.
    pub fn join(&mut self) -> Bytes {
        if self.ready.is_empty() {
            return Bytes::new();
        }
        if self.ready.len() == 1 {
            return self.ready[0].1.clone();
        }

        self.ready.sort_by_key(|(pos, _)| *pos);

        let mut joined = vec![0u8; self.filled];
        for (pos, chunk) in &self.ready {
            joined[*pos..*pos + chunk.len()].copy_from_slice(chunk);
        }

        let joined = Bytes::from(joined);
        self.ready = vec![(0, joined.clone())];
        joined
    }
}
