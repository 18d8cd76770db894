//! PCAP Ring — a bounded, append-only accumulation of the raw PCAP bytes
//! forwarded by every connected agent, with filtered read-out.
//!
//! No teacher analogue (the teacher never stored raw packets, only decoded
//! metadata bound for Postgres). The storage shape mirrors the agent's own
//! `pcap_chunk` module: a single global file header plus a sequence of
//! per-record headers and payload bytes, standard libpcap layout (spec §6).
//! Internally records are kept individually (not as one flat byte blob) so
//! capacity accounting and filtered export don't require re-parsing the
//! whole buffer on every read.

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use std::net::Ipv4Addr;

const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
const PCAP_VERSION_MAJOR: u16 = 2;
const PCAP_VERSION_MINOR: u16 = 4;
const LINKTYPE_ETHERNET: u32 = 1;
const GLOBAL_HEADER_LEN: usize = 24;

fn global_header(snap_length: u32) -> [u8; GLOBAL_HEADER_LEN] {
    let mut h = [0u8; GLOBAL_HEADER_LEN];
    h[0..4].copy_from_slice(&PCAP_MAGIC.to_le_bytes());
    h[4..6].copy_from_slice(&PCAP_VERSION_MAJOR.to_le_bytes());
    h[6..8].copy_from_slice(&PCAP_VERSION_MINOR.to_le_bytes());
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

#[derive(Debug, Clone)]
struct Record {
    timestamp: DateTime<Utc>,
    data: Vec<u8>,
    orig_len: u32,
}

/// Decoded 5-tuple pulled out of a raw Ethernet frame, best-effort, purely
/// for filter matching — no relation to the agent's own flow assembly.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameTuple {
    pub protocol: Option<u8>,
    pub src_ip: Option<Ipv4Addr>,
    pub dst_ip: Option<Ipv4Addr>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
}

fn parse_ipv4_5tuple(frame: &[u8]) -> FrameTuple {
    if frame.len() < 14 {
        return FrameTuple::default();
    }
    let mut offset = 14;
    let mut ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    if ethertype == 0x8100 {
        if frame.len() < 18 {
            return FrameTuple::default();
        }
        offset = 18;
        ethertype = u16::from_be_bytes([frame[16], frame[17]]);
    }
    if ethertype != 0x0800 || frame.len() < offset + 20 {
        return FrameTuple::default();
    }

    let ip = &frame[offset..];
    let ihl = (ip[0] & 0x0f) as usize * 4;
    if ihl < 20 || ip.len() < ihl {
        return FrameTuple::default();
    }
    let protocol = ip[9];
    let src_ip = Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]);
    let dst_ip = Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]);

    let (src_port, dst_port) = if (protocol == 6 || protocol == 17) && ip.len() >= ihl + 4 {
        let l4 = &ip[ihl..];
        (
            Some(u16::from_be_bytes([l4[0], l4[1]])),
            Some(u16::from_be_bytes([l4[2], l4[3]])),
        )
    } else {
        (None, None)
    };

    FrameTuple {
        protocol: Some(protocol),
        src_ip: Some(src_ip),
        dst_ip: Some(dst_ip),
        src_port,
        dst_port,
    }
}

/// Predicate passed to `PcapRing::export`, built from the control API's
/// query parameters.
#[derive(Debug, Clone, Default)]
pub struct PcapFilter {
    pub only_http: bool,
    pub include_dns: bool,
    pub all_ports: bool,
    pub search: Option<String>,
}

impl PcapFilter {
    fn matches(&self, tuple: &FrameTuple, data: &[u8], agent_ingress_port: u16) -> bool {
        if !self.all_ports {
            if tuple.src_port == Some(agent_ingress_port) || tuple.dst_port == Some(agent_ingress_port) {
                return false;
            }
        }
        if self.only_http {
            let is_http_port = tuple.src_port == Some(80) || tuple.dst_port == Some(80);
            if !is_http_port {
                return false;
            }
        }
        if !self.include_dns {
            let is_dns = tuple.protocol == Some(17) && (tuple.src_port == Some(53) || tuple.dst_port == Some(53));
            if is_dns {
                return false;
            }
        }
        if let Some(ref needle) = self.search {
            if !needle.is_empty() {
                let haystack = String::from_utf8_lossy(data);
                if !haystack.contains(needle.as_str()) {
                    return false;
                }
            }
        }
        true
    }
}

/// Whether to drop new writes or rotate out the oldest records when the
/// ring is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullPolicy {
    DropNewest,
    RotateTail,
}

struct Inner {
    records: Vec<Record>,
    bytes_used: u64,
}

pub struct PcapRing {
    capacity_bytes: u64,
    snap_length: u32,
    policy: FullPolicy,
    agent_ingress_port: u16,
    inner: RwLock<Inner>,
}

impl PcapRing {
    pub fn new(capacity_bytes: u64, snap_length: u32, policy: FullPolicy, agent_ingress_port: u16) -> Self {
        Self {
            capacity_bytes,
            snap_length,
            policy,
            agent_ingress_port,
            inner: RwLock::new(Inner {
                records: Vec::new(),
                bytes_used: 0,
            }),
        }
    }

    /// Append one PCAPChunk from an agent: either a bare sequence of
    /// records, or (on an agent's first chunk) a chunk prefixed with its
    /// own global header, which is stripped before appending.
    pub fn append_chunk(&self, chunk: &[u8]) {
        let mut offset = 0;
        if chunk.len() >= GLOBAL_HEADER_LEN && chunk[0..4] == PCAP_MAGIC.to_le_bytes() {
            offset = GLOBAL_HEADER_LEN;
        }

        let mut inner = self.inner.write();
        while offset + 16 <= chunk.len() {
            let ts_sec = u32::from_le_bytes(chunk[offset..offset + 4].try_into().unwrap());
            let ts_usec = u32::from_le_bytes(chunk[offset + 4..offset + 8].try_into().unwrap());
            let incl_len = u32::from_le_bytes(chunk[offset + 8..offset + 12].try_into().unwrap()) as usize;
            let orig_len = u32::from_le_bytes(chunk[offset + 12..offset + 16].try_into().unwrap());
            offset += 16;
            if offset + incl_len > chunk.len() {
                break;
            }
            let data = chunk[offset..offset + incl_len].to_vec();
            offset += incl_len;

            let record_bytes = 16 + data.len() as u64;
            if inner.bytes_used + record_bytes > self.capacity_bytes {
                match self.policy {
                    FullPolicy::DropNewest => continue,
                    FullPolicy::RotateTail => {
                        while !inner.records.is_empty() && inner.bytes_used + record_bytes > self.capacity_bytes {
                            let evicted = inner.records.remove(0);
                            inner.bytes_used -= 16 + evicted.data.len() as u64;
                        }
                        if record_bytes > self.capacity_bytes {
                            continue;
                        }
                    }
                }
            }

            let timestamp = Utc
                .timestamp_opt(ts_sec as i64, ts_usec.saturating_mul(1000))
                .single()
                .unwrap_or_else(Utc::now);
            inner.bytes_used += record_bytes;
            inner.records.push(Record {
                timestamp,
                data,
                orig_len,
            });
        }
    }

    pub fn is_full(&self) -> bool {
        self.inner.read().bytes_used >= self.capacity_bytes
    }

    pub fn size_bytes(&self) -> u64 {
        self.inner.read().bytes_used
    }

    /// Clear the ring, preserving only the (implicit) global header.
    pub fn reset(&self) {
        let mut inner = self.inner.write();
        inner.records.clear();
        inner.bytes_used = 0;
    }

    /// Render a filtered PCAP byte stream: global header, then every
    /// record whose decoded 5-tuple (or raw payload, for the free-text
    /// search) matches `filter`. `flow_tuple` narrows to a single flow's
    /// packets when set (used by the single-flow export endpoint).
    pub fn export(&self, filter: &PcapFilter, flow_tuple: Option<FrameTuple>) -> Vec<u8> {
        let inner = self.inner.read();
        let mut out = Vec::with_capacity(GLOBAL_HEADER_LEN + inner.bytes_used as usize);
        out.extend_from_slice(&global_header(self.snap_length));

        for record in &inner.records {
            let tuple = parse_ipv4_5tuple(&record.data);
            if !filter.matches(&tuple, &record.data, self.agent_ingress_port) {
                continue;
            }
            if let Some(want) = flow_tuple {
                if !tuples_match(&tuple, &want) {
                    continue;
                }
            }
            out.extend_from_slice(&record_header(record.timestamp, record.data.len() as u32, record.orig_len));
            out.extend_from_slice(&record.data);
        }

        out
    }
}

fn tuples_match(a: &FrameTuple, b: &FrameTuple) -> bool {
    let forward = a.src_ip == b.src_ip && a.dst_ip == b.dst_ip && a.src_port == b.src_port && a.dst_port == b.dst_port;
    let reverse = a.src_ip == b.dst_ip && a.dst_ip == b.src_ip && a.src_port == b.dst_port && a.dst_port == b.src_port;
    a.protocol == b.protocol && (forward || reverse)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eth_ipv4_tcp(src_port: u16, dst_port: u16) -> Vec<u8> {
        let mut frame = vec![0u8; 14 + 20 + 4];
        frame[12] = 0x08;
        frame[13] = 0x00; // IPv4
        frame[14] = 0x45; // version 4, IHL 5
        frame[14 + 9] = 6; // TCP
        frame[14 + 12..14 + 16].copy_from_slice(&[10, 0, 0, 1]);
        frame[14 + 16..14 + 20].copy_from_slice(&[10, 0, 0, 2]);
        frame[34..36].copy_from_slice(&src_port.to_be_bytes());
        frame[36..38].copy_from_slice(&dst_port.to_be_bytes());
        frame
    }

    fn wrap_chunk(frames: &[Vec<u8>], with_header: bool) -> Vec<u8> {
        let mut chunk = Vec::new();
        if with_header {
            chunk.extend_from_slice(&global_header(65535));
        }
        for frame in frames {
            chunk.extend_from_slice(&record_header(Utc::now(), frame.len() as u32, frame.len() as u32));
            chunk.extend_from_slice(frame);
        }
        chunk
    }

    #[test]
    fn test_strips_embedded_global_header() {
        let ring = PcapRing::new(1 << 20, 65535, FullPolicy::DropNewest, 9090);
        let chunk = wrap_chunk(&[eth_ipv4_tcp(5000, 80)], true);
        ring.append_chunk(&chunk);
        assert_eq!(ring.size_bytes(), (16 + eth_ipv4_tcp(5000, 80).len()) as u64);
    }

    #[test]
    fn test_all_ports_false_excludes_agent_ingress_port() {
        let ring = PcapRing::new(1 << 20, 65535, FullPolicy::DropNewest, 9090);
        ring.append_chunk(&wrap_chunk(&[eth_ipv4_tcp(5000, 9090), eth_ipv4_tcp(6000, 80)], true));
        let filtered = ring.export(&PcapFilter::default(), None);
        // global header plus exactly one surviving record
        assert_eq!(filtered.len(), GLOBAL_HEADER_LEN + 16 + eth_ipv4_tcp(6000, 80).len());
    }

    #[test]
    fn test_all_ports_true_includes_agent_ingress_port() {
        let ring = PcapRing::new(1 << 20, 65535, FullPolicy::DropNewest, 9090);
        ring.append_chunk(&wrap_chunk(&[eth_ipv4_tcp(5000, 9090)], true));
        let filter = PcapFilter { all_ports: true, ..Default::default() };
        let filtered = ring.export(&filter, None);
        assert_eq!(filtered.len(), GLOBAL_HEADER_LEN + 16 + eth_ipv4_tcp(5000, 9090).len());
    }

    #[test]
    fn test_reset_empties_ring() {
        let ring = PcapRing::new(1 << 20, 65535, FullPolicy::DropNewest, 9090);
        ring.append_chunk(&wrap_chunk(&[eth_ipv4_tcp(5000, 80)], true));
        assert!(ring.size_bytes() > 0);
        ring.reset();
        assert_eq!(ring.size_bytes(), 0);
        assert!(!ring.is_full());
    }

    #[test]
    fn test_drop_newest_once_full() {
        let frame = eth_ipv4_tcp(5000, 80);
        let record_size = 16 + frame.len() as u64;
        let ring = PcapRing::new(record_size, 65535, FullPolicy::DropNewest, 9090);
        ring.append_chunk(&wrap_chunk(&[frame.clone()], true));
        assert!(ring.is_full());
        ring.append_chunk(&wrap_chunk(&[frame], false));
        assert_eq!(ring.size_bytes(), record_size);
    }
}
