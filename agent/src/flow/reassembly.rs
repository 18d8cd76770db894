//! Bounded out-of-order TCP reassembly for a single direction of a flow.
//!
//! Segments arrive out of order on the wire; this buffers them by sequence
//! number until the contiguous prefix can be drained. The window is
//! bounded so a single stalled flow can't grow its buffer unboundedly —
//! once the window is full, the oldest unacked gap is simply dropped and
//! reassembly resumes from the next contiguous point it can find.

use std::collections::BTreeMap;

pub struct ReorderBuffer {
    /// Sequence number expected next, once known (set by the first segment).
    next_seq: Option<u32>,
    /// Segments not yet contiguous with `next_seq`, keyed by sequence number.
    pending: BTreeMap<u32, Vec<u8>>,
    /// Total bytes currently buffered in `pending`.
    pending_bytes: usize,
    max_bytes: usize,
}

impl ReorderBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            next_seq: None,
            pending: BTreeMap::new(),
            pending_bytes: 0,
            max_bytes,
        }
    }

    /// Feed in a new segment (sequence number, payload). Returns any newly
    /// contiguous bytes ready to hand to the decoders, in order.
    pub fn push(&mut self, seq: u32, data: &[u8]) -> Vec<u8> {
        if data.is_empty() {
            return Vec::new();
        }

        let expected = *self.next_seq.get_or_insert(seq);

        // Already-seen data (retransmit) or before our window: ignore.
        if seq_lt(seq, expected) {
            return Vec::new();
        }

        if seq == expected {
            self.next_seq = Some(expected.wrapping_add(data.len() as u32));
            let mut out = data.to_vec();
            out.extend(self.drain_contiguous());
            out
        } else {
            self.pending_bytes += data.len();
            self.pending.insert(seq, data.to_vec());
            self.evict_if_over_budget();
            Vec::new()
        }
    }

    fn drain_contiguous(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let expected = match self.next_seq {
                Some(s) => s,
                None => break,
            };
            let Some(&seq) = self.pending.keys().find(|&&s| s == expected) else {
                break;
            };
            let data = self.pending.remove(&seq).unwrap();
            self.pending_bytes -= data.len();
            self.next_seq = Some(expected.wrapping_add(data.len() as u32));
            out.extend(data);
        }
        out
    }

    /// If the pending window has grown past its budget, drop the oldest
    /// buffered segment and re-anchor `next_seq` so forward progress can
    /// resume — we trade perfect ordering for bounded memory.
    fn evict_if_over_budget(&mut self) {
        while self.pending_bytes > self.max_bytes {
            let Some((&seq, _)) = self.pending.iter().next() else {
                break;
            };
            let data = self.pending.remove(&seq).unwrap();
            self.pending_bytes -= data.len();
            self.next_seq = Some(seq.wrapping_add(data.len() as u32));
        }
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }
}

fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_segments() {
        let mut buf = ReorderBuffer::new(4096);
        assert_eq!(buf.push(0, b"hello "), b"hello ".to_vec());
        assert_eq!(buf.push(6, b"world"), b"world".to_vec());
    }

    #[test]
    fn test_out_of_order_reassembles() {
        let mut buf = ReorderBuffer::new(4096);
        assert_eq!(buf.push(6, b"world"), Vec::<u8>::new());
        assert_eq!(buf.push(0, b"hello "), b"hello world".to_vec());
    }

    #[test]
    fn test_retransmit_ignored() {
        let mut buf = ReorderBuffer::new(4096);
        assert_eq!(buf.push(0, b"hello"), b"hello".to_vec());
        assert_eq!(buf.push(0, b"hello"), Vec::<u8>::new());
    }

    #[test]
    fn test_bounded_window_evicts_oldest_gap() {
        let mut buf = ReorderBuffer::new(8);
        // Gap at seq 0..4, then a segment far beyond the budget.
        let _ = buf.push(100, b"abcdefgh");
        assert!(buf.pending_bytes() <= 8);
    }
}
