//! Wire envelopes exchanged between the agent and the Hub over the
//! ingress WebSocket. Tagged JSON keeps this readable over the wire and
//! matches the shape the Hub's control API already speaks for its own
//! REST responses. PCAP chunks bypass this envelope entirely and travel
//! as raw binary WebSocket frames, per the spec's "separate logical
//! stream" requirement.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use uuid::Uuid;

use crate::flow::FlowEvent;

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
    Registered {
        agent_id: Uuid,
    },
    /// Response to a `Heartbeat`: the Hub's authoritative BPF expression,
    /// bumped by a nonce every time it changes, plus the global pause flag.
    HeartbeatAck {
        bpf_filter: String,
        bpf_nonce: u64,
        paused: bool,
    },
    SetBpfFilter {
        expression: String,
    },
    Pause,
    Resume,
    Ack,
}
