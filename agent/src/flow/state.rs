//! Per-flow state machine and the event record emitted to the Hub.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use crate::capture::TcpFlags;
use crate::decode::{HttpExchange, TlsClientHello, TlsServerHello};

use super::id::FlowId;
use super::reassembly::ReorderBuffer;

/// Connection lifecycle, mirrored on the captured TCP handshake/teardown.
/// Internal only — never serialized. Subscribers and the Hub see the
/// reduced `FlowStatus` instead (see `to_event`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    New,
    SynSent,
    Established,
    HalfClosed,
    Closed,
    Reset,
    Timeout,
}

impl FlowState {
    /// Apply an observed segment's flags and return the resulting state.
    /// `Timeout` is never reached through this transition table — it's
    /// applied externally by the idle sweep.
    pub fn on_flags(self, flags: &TcpFlags) -> Self {
        if flags.rst {
            return FlowState::Reset;
        }

        match self {
            FlowState::New if flags.is_syn_only() => FlowState::SynSent,
            FlowState::New if flags.ack => FlowState::Established,
            FlowState::SynSent if flags.is_syn_ack() || flags.ack => FlowState::Established,
            FlowState::Established if flags.fin => FlowState::HalfClosed,
            FlowState::HalfClosed if flags.fin || flags.ack => FlowState::Closed,
            other => other,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, FlowState::Closed | FlowState::Reset | FlowState::Timeout)
    }
}

/// Wire-facing connection status: the internal state machine collapsed to
/// the four values spec'd for subscribers (`OPEN` covers everything short
/// of a terminal state, so e.g. HALF_CLOSED never leaks onto the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowStatus {
    Open,
    Closed,
    Reset,
    Timeout,
}

impl From<FlowState> for FlowStatus {
    fn from(state: FlowState) -> Self {
        match state {
            FlowState::New | FlowState::SynSent | FlowState::Established | FlowState::HalfClosed => {
                FlowStatus::Open
            }
            FlowState::Closed => FlowStatus::Closed,
            FlowState::Reset => FlowStatus::Reset,
            FlowState::Timeout => FlowStatus::Timeout,
        }
    }
}

/// Protocol tag upgraded as decoders recognize higher-layer traffic on the
/// flow. `Tls` is part of the data model but not produced by the decoders
/// here: once a handshake is recognized the flow is upgraded straight to
/// `Https`, per the TLS decoder's contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtocolTag {
    Tcp,
    Http,
    Https,
    Tls,
}

impl Default for ProtocolTag {
    fn default() -> Self {
        ProtocolTag::Tcp
    }
}

pub struct Flow {
    pub id: FlowId,
    pub protocol: ProtocolTag,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub state: FlowState,
    pub started_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,

    pub(super) client_to_server: ReorderBuffer,
    pub(super) server_to_client: ReorderBuffer,
    pub bytes_client_to_server: u64,
    pub bytes_server_to_client: u64,

    pub http: Option<HttpExchange>,
    pub tls_client: Option<TlsClientHello>,
    pub tls_server: Option<TlsServerHello>,

    /// Timestamp of the first bare SYN seen for this flow, used to compute
    /// `tcp_handshake_ms` once the SYN-ACK/ACK arrives. Absent when capture
    /// started mid-connection.
    pub(super) syn_at: Option<DateTime<Utc>>,
    /// Timestamp of the first client-to-server payload byte, the baseline
    /// for `ttfb_ms`.
    pub(super) client_first_byte_at: Option<DateTime<Utc>>,
    /// Timestamp the ClientHello was decoded, the baseline for
    /// `tls_handshake_ms`.
    pub(super) client_hello_at: Option<DateTime<Utc>>,

    pub tcp_handshake_ms: Option<i64>,
    pub tls_handshake_ms: Option<i64>,
    pub ttfb_ms: Option<i64>,

    /// Set when the remote endpoint is the agent's own Hub connection.
    /// The flow is still assembled and emitted (spec §4.2) rather than
    /// dropped; downstream consumers suppress it by default.
    pub is_agent_traffic: bool,
    pub agent_traffic_type: Option<String>,

    /// Set once a FlowEvent has been emitted reflecting the current state,
    /// so idle established flows don't get re-sent every sweep.
    pub(super) dirty: bool,
}

impl Flow {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: FlowId,
        protocol: ProtocolTag,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        reorder_window_bytes: usize,
        now: DateTime<Utc>,
        is_agent_traffic: bool,
    ) -> Self {
        Self {
            id,
            protocol,
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            state: FlowState::New,
            started_at: now,
            last_seen: now,
            client_to_server: ReorderBuffer::new(reorder_window_bytes),
            server_to_client: ReorderBuffer::new(reorder_window_bytes),
            bytes_client_to_server: 0,
            bytes_server_to_client: 0,
            http: None,
            tls_client: None,
            tls_server: None,
            syn_at: None,
            client_first_byte_at: None,
            client_hello_at: None,
            tcp_handshake_ms: None,
            tls_handshake_ms: None,
            ttfb_ms: None,
            is_agent_traffic,
            agent_traffic_type: if is_agent_traffic { Some("flow".to_string()) } else { None },
            dirty: true,
        }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn to_event(&self, pod_name: Option<&str>) -> FlowEvent {
        FlowEvent {
            flow_id: self.id,
            pod_name: pod_name.map(str::to_string),
            protocol: self.protocol,
            src_ip: self.src_ip,
            dst_ip: self.dst_ip,
            src_port: self.src_port,
            dst_port: self.dst_port,
            status: self.state.into(),
            started_at: self.started_at,
            last_seen_at: self.last_seen,
            bytes_client_to_server: self.bytes_client_to_server,
            bytes_server_to_client: self.bytes_server_to_client,
            tcp_handshake_ms: self.tcp_handshake_ms,
            tls_handshake_ms: self.tls_handshake_ms,
            ttfb_ms: self.ttfb_ms,
            is_agent_traffic: self.is_agent_traffic,
            agent_traffic_type: self.agent_traffic_type.clone(),
            http: self.http.clone(),
            tls_client: self.tls_client.clone(),
            tls_server: self.tls_server.clone(),
        }
    }
}

/// Wire-format record describing a flow's observed state, sent to the Hub
/// in batches by the uplink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEvent {
    pub flow_id: FlowId,
    pub pod_name: Option<String>,
    pub protocol: ProtocolTag,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub status: FlowStatus,
    pub started_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub bytes_client_to_server: u64,
    pub bytes_server_to_client: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_handshake_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_handshake_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttfb_ms: Option<i64>,
    #[serde(default)]
    pub is_agent_traffic: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_traffic_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpExchange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_client: Option<TlsClientHello>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_server: Option<TlsServerHello>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(syn: bool, ack: bool, fin: bool, rst: bool) -> TcpFlags {
        TcpFlags {
            fin,
            syn,
            rst,
            psh: false,
            ack,
            urg: false,
            ece: false,
            cwr: false,
        }
    }

    #[test]
    fn test_handshake_transitions() {
        let mut state = FlowState::New;
        state = state.on_flags(&flags(true, false, false, false));
        assert_eq!(state, FlowState::SynSent);
        state = state.on_flags(&flags(true, true, false, false));
        assert_eq!(state, FlowState::Established);
    }

    #[test]
    fn test_close_transitions() {
        let mut state = FlowState::Established;
        state = state.on_flags(&flags(false, true, true, false));
        assert_eq!(state, FlowState::HalfClosed);
        state = state.on_flags(&flags(false, true, true, false));
        assert_eq!(state, FlowState::Closed);
        assert!(state.is_terminal());
    }

    #[test]
    fn test_rst_from_any_state() {
        let state = FlowState::Established.on_flags(&flags(false, true, false, true));
        assert_eq!(state, FlowState::Reset);
        assert!(state.is_terminal());
    }

    #[test]
    fn test_status_projection_collapses_pre_terminal_states_to_open() {
        assert_eq!(FlowStatus::from(FlowState::New), FlowStatus::Open);
        assert_eq!(FlowStatus::from(FlowState::SynSent), FlowStatus::Open);
        assert_eq!(FlowStatus::from(FlowState::Established), FlowStatus::Open);
        assert_eq!(FlowStatus::from(FlowState::HalfClosed), FlowStatus::Open);
        assert_eq!(FlowStatus::from(FlowState::Closed), FlowStatus::Closed);
        assert_eq!(FlowStatus::from(FlowState::Reset), FlowStatus::Reset);
        assert_eq!(FlowStatus::from(FlowState::Timeout), FlowStatus::Timeout);
    }
}
