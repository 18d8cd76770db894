//! Wire envelopes for the agent ingress WebSocket.
//!
//! Deliberately redefined rather than shared via a library crate — `agent`
//! and `hub` are independent workspace members with no path dependency
//! between them, so each side owns its own mirror of the wire format and
//! they're kept in sync by hand.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowId(pub u64);

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Wire-facing connection status, already collapsed by the agent from its
/// internal state machine — the Hub never sees the pre-terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowStatus {
    Open,
    Closed,
    Reset,
    Timeout,
}

impl FlowStatus {
    /// Ordinal rank used by the Flow Table merge rule: status only ever
    /// advances, never regresses, on a newer event.
    pub fn rank(self) -> u8 {
        match self {
            FlowStatus::Open => 0,
            FlowStatus::Closed | FlowStatus::Reset | FlowStatus::Timeout => 1,
        }
    }
}

/// Protocol tag as upgraded by the agent's decoders. `Tls` is part of the
/// data model but never produced on this path — a recognized handshake
/// upgrades the flow straight to `Https`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtocolTag {
    Tcp,
    Http,
    Https,
    Tls,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub version: String,
    pub host: Option<String>,
    pub user_agent: Option<String>,
    pub content_length: Option<u64>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub version: String,
    pub status_code: u16,
    pub reason: String,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpExchange {
    pub request: Option<HttpRequest>,
    pub response: Option<HttpResponse>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsClientHello {
    pub version: String,
    pub sni: Option<String>,
    pub alpn: Vec<String>,
    pub cipher_suites: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsServerHello {
    pub version: String,
    pub alpn: Option<String>,
    pub cipher_suite: String,
}

/// Wire-format record describing a flow's observed state, received from an
/// agent in a batch. Field-for-field mirror of the agent's own `FlowEvent`.
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
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_handshake_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_handshake_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttfb_ms: Option<i64>,
    #[serde(default)]
    pub is_agent_traffic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_traffic_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpExchange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_client: Option<TlsClientHello>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_server: Option<TlsServerHello>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Register {
        agent_id: Uuid,
        pod_name: Option<String>,
        #[serde(default)]
        pod_namespace: Option<String>,
        #[serde(default)]
        pod_ip: Option<Ipv4Addr>,
        #[serde(default)]
        node_name: Option<String>,
    },
    FlowBatch {
        flows: Vec<FlowEvent>,
    },
    Heartbeat {
        agent_id: Uuid,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Registered { agent_id: Uuid },
    HeartbeatAck { bpf_filter: String, bpf_nonce: u64, paused: bool },
    SetBpfFilter { expression: String },
    Pause,
    Resume,
    Ack,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_event_roundtrips_through_json() {
        let event = FlowEvent {
            flow_id: FlowId(42),
            pod_name: Some("web-0".to_string()),
            protocol: ProtocolTag::Tcp,
            src_ip: Ipv4Addr::new(10, 0, 0, 1),
            dst_ip: Ipv4Addr::new(10, 0, 0, 2),
            src_port: 5000,
            dst_port: 80,
            status: FlowStatus::Open,
            started_at: Utc::now(),
            last_seen_at: Utc::now(),
            bytes_client_to_server: 100,
            bytes_server_to_client: 200,
            tcp_handshake_ms: Some(12),
            tls_handshake_ms: None,
            ttfb_ms: None,
            is_agent_traffic: false,
            agent_traffic_type: None,
            http: None,
            tls_client: None,
            tls_server: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: FlowEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.flow_id, FlowId(42));
        assert_eq!(back.status, FlowStatus::Open);
        assert_eq!(back.tcp_handshake_ms, Some(12));
    }

    #[test]
    fn test_flow_id_serializes_as_plain_number() {
        let json = serde_json::to_string(&FlowId(7)).unwrap();
        assert_eq!(json, "7");
    }

    #[test]
    fn test_client_message_tags_by_type() {
        let msg = ClientMessage::Heartbeat { agent_id: Uuid::nil() };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"heartbeat\""));
    }

    #[test]
    fn test_register_accepts_missing_optional_agent_info() {
        let json = r#"{"type":"register","agent_id":"00000000-0000-0000-0000-000000000000","pod_name":"web-0"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::Register { pod_namespace, pod_ip, node_name, .. } => {
                assert_eq!(pod_namespace, None);
                assert_eq!(pod_ip, None);
                assert_eq!(node_name, None);
            }
            _ => panic!("expected Register"),
        }
    }

    #[test]
    fn test_status_rank_orders_open_before_terminal() {
        assert!(FlowStatus::Open.rank() < FlowStatus::Closed.rank());
        assert_eq!(FlowStatus::Closed.rank(), FlowStatus::Reset.rank());
    }
}
