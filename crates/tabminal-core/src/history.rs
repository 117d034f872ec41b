//! Bounded output history
//!
//! Ring buffer of cleaned terminal output replayed to clients on attach.
//! Overflow truncates at the head only; the tail always holds the most
//! recent bytes.

use std::collections::VecDeque;

pub struct HistoryRing {
    data: VecDeque<u8>,
    limit: usize,
}

impl HistoryRing {
    pub fn new(limit: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(limit.min(64 * 1024)),
            limit,
        }
    }

    /// Append data, evicting from the head when over the limit.
    pub fn push(&mut self, bytes: &[u8]) {
        if bytes.len() >= self.limit {
            self.data.clear();
            self.data.extend(&bytes[bytes.len() - self.limit..]);
            return;
        }
        self.data.extend(bytes);
        while self.data.len() > self.limit {
            self.data.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Full contents, oldest first.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_everything_under_the_limit() {
        let mut ring = HistoryRing::new(8);
        ring.push(b"abc");
        ring.push(b"de");
        assert_eq!(ring.snapshot(), b"abcde");
        assert_eq!(ring.len(), 5);
    }

    #[test]
    fn one_byte_past_the_limit_truncates_the_head() {
        let mut ring = HistoryRing::new(4);
        ring.push(b"abcd");
        assert_eq!(ring.len(), 4);
        ring.push(b"e");
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.snapshot(), b"bcde");
    }

    #[test]
    fn oversized_chunk_keeps_only_the_tail() {
        let mut ring = HistoryRing::new(4);
        ring.push(b"0123456789");
        assert_eq!(ring.snapshot(), b"6789");
    }
}
