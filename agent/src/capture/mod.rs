//! Capture module — live packet capture via libpcap

pub mod frame;
pub mod interface;
pub mod source;

pub use frame::{CapturedFrame, MacAddr, QinQInfo, TcpFlags, VlanInfo};
pub use interface::{print_interfaces, NetworkInterface};
pub use source::{validate_bpf, CaptureStats, CaptureStatsSnapshot, PacketSource, RawPacket};
