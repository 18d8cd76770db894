//! Frame decoding module
//!
//! Handles parsing of Ethernet frames including VLAN tags,
//! IPv4 headers, and TCP/UDP ports.

pub mod ethernet;
pub mod http;
pub mod ipv4;
pub mod tls;
pub mod transport;
pub mod vlan;

use anyhow::Result;
use crate::capture::frame::CapturedFrame;

pub use ethernet::parse_ethernet;
pub use http::{decode_http, decode_request, decode_response, HttpExchange, HttpRequest, HttpResponse};
pub use ipv4::parse_ipv4;
pub use tls::{decode_tls_client_hello, decode_tls_server_hello, TlsClientHello, TlsServerHello};
pub use transport::parse_transport;
pub use vlan::{parse_qinq, parse_vlan};

/// Parse a complete frame from raw bytes
pub fn parse_frame(interface: &str, data: &[u8]) -> Result<CapturedFrame> {
    ethernet::parse_frame(interface, data)
}
