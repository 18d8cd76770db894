//! Assembles raw captured frames into libpcap-formatted chunks for the
//! Agent Client's PCAP stream. No teacher analogue — the teacher never
//! forwarded raw bytes, only decoded metadata — so this follows the
//! standard libpcap global/per-record header layout directly (spec §6).

use chrono::{DateTime, Utc};

const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
const PCAP_VERSION_MAJOR: u16 = 2;
const PCAP_VERSION_MINOR: u16 = 4;
const LINKTYPE_ETHERNET: u32 = 1;

fn global_header(snap_length: u32) -> [u8; 24] {
    let mut h = [0u8; 24];
    h[0..4].copy_from_slice(&PCAP_MAGIC.to_le_bytes());
    h[4..6].copy_from_slice(&PCAP_VERSION_MAJOR.to_le_bytes());
    h[6..8].copy_from_slice(&PCAP_VERSION_MINOR.to_le_bytes());
    // thiszone, sigfigs left at 0
    h[16..20].copy_from_slice(&snap_length.to_le_bytes());
    h[20..24].copy_from_slice(&LINKTYPE_ETHERNET.to_le_bytes());
    h
}

fn record_header(ts: DateTime<Utc>, incl_len: u32, orig_len: u32) -> [u8; 16] {
    let mut h = [0u8; 16];
    h[0..4].copy_from_slice(&(ts.timestamp() as u32).to_le_bytes());
    h[4..8].copy_from_slice(&(ts.timestamp_subsec_micros()).to_le_bytes());
    h[8..12].copy_from_slice(&incl_len.to_le_bytes());
    h[12..16].copy_from_slice(&orig_len.to_le_bytes());
    h
}

/// Buffers raw frames into PCAP-formatted bytes, draining on demand. The
/// global file header is emitted exactly once, with the first drained
/// chunk, matching "a shared file header established during registration".
pub struct PcapChunker {
    snap_length: u32,
    buffer: Vec<u8>,
    header_sent: bool,
}

impl PcapChunker {
    pub fn new(snap_length: u32) -> Self {
        Self {
            snap_length,
            buffer: Vec::new(),
            header_sent: false,
        }
    }

    /// Append one captured frame's raw bytes.
    pub fn push(&mut self, timestamp: DateTime<Utc>, data: &[u8]) {
        let incl_len = data.len().min(self.snap_length as usize) as u32;
        self.buffer
            .extend_from_slice(&record_header(timestamp, incl_len, data.len() as u32));
        self.buffer.extend_from_slice(&data[..incl_len as usize]);
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drain whatever has been buffered since the last call, prefixed with
    /// the global header on the very first non-empty chunk.
    pub fn take(&mut self) -> Option<Vec<u8>> {
        if self.buffer.is_empty() {
            return None;
        }

        let mut chunk = Vec::with_capacity(self.buffer.len() + 24);
        if !self.header_sent {
            chunk.extend_from_slice(&global_header(self.snap_length));
            self.header_sent = true;
        }
        chunk.append(&mut self.buffer);
        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_chunk_carries_global_header() {
        let mut chunker = PcapChunker::new(65535);
        chunker.push(Utc::now(), &[0xde, 0xad, 0xbe, 0xef]);
        let chunk = chunker.take().expect("should produce a chunk");
        assert_eq!(&chunk[0..4], &PCAP_MAGIC.to_le_bytes());
    }

    #[test]
    fn test_second_chunk_has_no_repeated_header() {
        let mut chunker = PcapChunker::new(65535);
        chunker.push(Utc::now(), &[1, 2, 3]);
        let _ = chunker.take();
        chunker.push(Utc::now(), &[4, 5, 6]);
        let chunk = chunker.take().expect("should produce a chunk");
        assert_ne!(&chunk[0..4], &PCAP_MAGIC.to_le_bytes());
    }

    #[test]
    fn test_empty_buffer_yields_none() {
        let mut chunker = PcapChunker::new(65535);
        assert!(chunker.take().is_none());
    }

    #[test]
    fn test_oversized_frame_truncated_to_snaplen() {
        let mut chunker = PcapChunker::new(8);
        chunker.push(Utc::now(), &[0u8; 32]);
        let chunk = chunker.take().unwrap();
        // global header (24) + record header (16) + 8 bytes of payload
        assert_eq!(chunk.len(), 24 + 16 + 8);
    }
}
