//! Flow table — the in-memory set of active flows for this agent.
//!
//! Single-owner by design: one task drains the capture channel, decoded
//! frame by decoded frame, and drives this table directly. There's no
//! concurrent access to guard against, unlike the Hub's multi-writer
//! flow table.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::capture::CapturedFrame;
use crate::config::{DecodeConfig, FlowConfig};
use crate::decode;

use super::id::{FlowId, FlowTuple};
use super::state::{Flow, FlowEvent, FlowState, ProtocolTag};

const TCP: u8 = 6;

pub struct FlowTable {
    flows: HashMap<FlowId, Flow>,
    active: HashMap<FlowTuple, (FlowId, i64)>,
    flow_cfg: FlowConfig,
    decode_cfg: DecodeConfig,
    pod_name: Option<String>,
    /// The Hub's own (ip, port), once the uplink has resolved and
    /// connected to it — traffic to/from this pair is the agent's own
    /// control channel and is tagged `isAgentTraffic` instead of being
    /// excluded from flow reporting.
    hub_peer: Option<(Ipv4Addr, u16)>,
}

impl FlowTable {
    pub fn new(flow_cfg: FlowConfig, decode_cfg: DecodeConfig, pod_name: Option<String>) -> Self {
        Self {
            flows: HashMap::new(),
            active: HashMap::new(),
            flow_cfg,
            decode_cfg,
            pod_name,
            hub_peer: None,
        }
    }

    pub fn set_hub_peer(&mut self, ip: Ipv4Addr, port: u16) {
        self.hub_peer = Some((ip, port));
    }

    fn is_agent_traffic(&self, src_ip: Ipv4Addr, src_port: u16, dst_ip: Ipv4Addr, dst_port: u16) -> bool {
        match self.hub_peer {
            Some((hub_ip, hub_port)) => {
                (dst_ip == hub_ip && dst_port == hub_port) || (src_ip == hub_ip && src_port == hub_port)
            }
            None => false,
        }
    }

    /// Feed in one decoded frame. Only TCP/IPv4 frames participate in flow
    /// assembly; anything else is silently ignored here (counted upstream
    /// by capture stats instead).
    pub fn ingest(&mut self, frame: &CapturedFrame) {
        let (Some(src_ip), Some(dst_ip), Some(proto)) = (frame.src_ip, frame.dst_ip, frame.ip_protocol) else {
            return;
        };
        if proto != TCP {
            return;
        }
        let (Some(src_port), Some(dst_port)) = (frame.src_port, frame.dst_port) else {
            return;
        };

        let is_agent_traffic = self.is_agent_traffic(src_ip, src_port, dst_ip, dst_port);

        let tuple = FlowTuple::new(proto, src_ip, src_port, dst_ip, dst_port);
        let now = frame.timestamp;
        let flags = frame.tcp_flags.unwrap_or_default();

        let id = match self.active.get(&tuple) {
            Some(&(id, _)) => id,
            None => self.create_flow(tuple, src_ip, src_port, dst_ip, dst_port, flags, now, is_agent_traffic),
        };

        let Some(flow) = self.flows.get_mut(&id) else { return };

        if is_agent_traffic && !flow.is_agent_traffic {
            flow.is_agent_traffic = true;
            flow.agent_traffic_type = Some("flow".to_string());
            flow.mark_dirty();
        }

        flow.last_seen = now;
        let prev_state = flow.state;
        flow.state = flow.state.on_flags(&flags);
        if flow.state != prev_state {
            flow.mark_dirty();
            match (prev_state, flow.state) {
                (FlowState::New, FlowState::SynSent) => {
                    flow.syn_at = Some(now);
                }
                (FlowState::SynSent, FlowState::Established) => {
                    if let Some(syn_at) = flow.syn_at {
                        flow.tcp_handshake_ms = Some((now - syn_at).num_milliseconds().max(0));
                    }
                }
                _ => {}
            }
        }

        let is_client_to_server = src_ip == flow.src_ip && src_port == flow.src_port;
        if !frame.payload.is_empty() {
            if is_client_to_server {
                if flow.client_first_byte_at.is_none() {
                    flow.client_first_byte_at = Some(now);
                }
            } else if flow.ttfb_ms.is_none() {
                if let Some(first_byte) = flow.client_first_byte_at {
                    flow.ttfb_ms = Some((now - first_byte).num_milliseconds().max(0));
                    flow.mark_dirty();
                }
            }

            if let Some(seq) = frame.tcp_seq {
                let assembled = if is_client_to_server {
                    flow.bytes_client_to_server += frame.payload.len() as u64;
                    flow.client_to_server.push(seq, &frame.payload)
                } else {
                    flow.bytes_server_to_client += frame.payload.len() as u64;
                    flow.server_to_client.push(seq, &frame.payload)
                };

                if !assembled.is_empty() {
                    self.decode_payload(id, is_client_to_server, &assembled, now);
                }
            }
        }

        if flow.state.is_terminal() {
            flow.mark_dirty();
            self.active.remove(&tuple);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn create_flow(
        &mut self,
        tuple: FlowTuple,
        src_ip: Ipv4Addr,
        src_port: u16,
        dst_ip: Ipv4Addr,
        dst_port: u16,
        flags: crate::capture::TcpFlags,
        now: DateTime<Utc>,
        is_agent_traffic: bool,
    ) -> FlowId {
        let started_via_syn = flags.is_syn_only();

        let (client_ip, client_port, server_ip, server_port) =
            if !started_via_syn && self.flow_cfg.mid_connection_source_heuristic && dst_port > src_port {
                (dst_ip, dst_port, src_ip, src_port)
            } else {
                (src_ip, src_port, dst_ip, dst_port)
            };

        let id = FlowId::new(tuple, now.timestamp());
        self.active.insert(tuple, (id, now.timestamp()));

        let flow = Flow::new(
            id,
            ProtocolTag::Tcp,
            client_ip,
            server_ip,
            client_port,
            server_port,
            self.flow_cfg.reorder_window_bytes,
            now,
            is_agent_traffic,
        );
        self.flows.insert(id, flow);
        id
    }

    /// Hand reassembled payload bytes to the HTTP/TLS decoders and upgrade
    /// the flow's protocol tag on a match. Once TLS is detected the flow is
    /// marked HTTPS and no further payload decoding is attempted for it.
    fn decode_payload(&mut self, id: FlowId, is_client_to_server: bool, data: &[u8], now: DateTime<Utc>) {
        let Some(flow) = self.flows.get_mut(&id) else { return };

        if flow.protocol == ProtocolTag::Https {
            return;
        }

        if is_client_to_server {
            if let Some(req) = decode::decode_request(
                data,
                self.decode_cfg.max_http_header_bytes,
                self.decode_cfg.max_http_body_bytes,
            ) {
                flow.http.get_or_insert_with(Default::default).request = Some(req);
                flow.protocol = ProtocolTag::Http;
                flow.mark_dirty();
            }
            if let Some(hello) =
                decode::decode_tls_client_hello(data, self.decode_cfg.max_tls_hello_bytes)
            {
                flow.tls_client = Some(hello);
                flow.client_hello_at = Some(now);
                flow.protocol = ProtocolTag::Https;
                flow.mark_dirty();
            }
        } else {
            if let Some(resp) = decode::decode_response(
                data,
                self.decode_cfg.max_http_header_bytes,
                self.decode_cfg.max_http_body_bytes,
            ) {
                flow.http.get_or_insert_with(Default::default).response = Some(resp);
                flow.protocol = ProtocolTag::Http;
                flow.mark_dirty();
            }
            if let Some(hello) =
                decode::decode_tls_server_hello(data, self.decode_cfg.max_tls_hello_bytes)
            {
                flow.tls_server = Some(hello);
                if let Some(client_hello_at) = flow.client_hello_at {
                    flow.tls_handshake_ms = Some((now - client_hello_at).num_milliseconds().max(0));
                }
                flow.protocol = ProtocolTag::Https;
                flow.mark_dirty();
            }
        }
    }

    /// Transition any flow that's gone quiet into `Timeout`, and drop
    /// long-unacked gaps by age. Should be called periodically (e.g. every
    /// few seconds) from the assembler's main loop.
    pub fn sweep(&mut self, now: DateTime<Utc>) {
        let idle_timeout = chrono::Duration::seconds(self.flow_cfg.idle_timeout_secs as i64);

        for flow in self.flows.values_mut() {
            if flow.state.is_terminal() {
                continue;
            }
            if now - flow.last_seen > idle_timeout {
                flow.state = FlowState::Timeout;
                flow.mark_dirty();
            }
        }

        self.active.retain(|_, (id, _)| {
            self.flows
                .get(id)
                .map(|f| !f.state.is_terminal())
                .unwrap_or(false)
        });
    }

    /// Drain events for flows that changed since the last drain. Terminal
    /// flows are removed from the table after being returned once.
    pub fn drain_events(&mut self) -> Vec<FlowEvent> {
        let mut events = Vec::new();
        let mut to_remove = Vec::new();

        for (id, flow) in self.flows.iter_mut() {
            if !flow.dirty {
                continue;
            }
            events.push(flow.to_event(self.pod_name.as_deref()));
            flow.dirty = false;
            if flow.state.is_terminal() {
                to_remove.push(*id);
            }
        }

        for id in to_remove {
            self.flows.remove(&id);
        }

        events
    }

    pub fn active_flow_count(&self) -> usize {
        self.flows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::state::{FlowStatus, ProtocolTag as Proto};
    use crate::capture::{CapturedFrame, MacAddr, TcpFlags};

    fn frame(
        src_ip: Ipv4Addr,
        src_port: u16,
        dst_ip: Ipv4Addr,
        dst_port: u16,
        flags: TcpFlags,
        seq: u32,
        payload: &[u8],
    ) -> CapturedFrame {
        let mut f = CapturedFrame::new(
            "eth0",
            MacAddr::new([0, 0, 0, 0, 0, 1]),
            MacAddr::new([0, 0, 0, 0, 0, 2]),
            0x0800,
            64 + payload.len() as u32,
        );
        f.src_ip = Some(src_ip);
        f.dst_ip = Some(dst_ip);
        f.ip_protocol = Some(TCP);
        f.src_port = Some(src_port);
        f.dst_port = Some(dst_port);
        f.tcp_flags = Some(flags);
        f.tcp_seq = Some(seq);
        f.payload = payload.to_vec();
        f.payload_size = payload.len() as u32;
        f
    }

    fn flags(syn: bool, ack: bool) -> TcpFlags {
        TcpFlags {
            syn,
            ack,
            ..Default::default()
        }
    }

    #[test]
    fn test_new_flow_tracked_and_emits_event() {
        let mut table = FlowTable::new(FlowConfig::default(), DecodeConfig::default(), None);
        let client = Ipv4Addr::new(10, 0, 0, 1);
        let server = Ipv4Addr::new(10, 0, 0, 2);

        table.ingest(&frame(client, 51000, server, 443, flags(true, false), 0, &[]));
        assert_eq!(table.active_flow_count(), 1);

        let events = table.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, FlowStatus::Open);
    }

    #[test]
    fn test_http_request_decoded_and_protocol_upgraded() {
        let mut table = FlowTable::new(FlowConfig::default(), DecodeConfig::default(), None);
        let client = Ipv4Addr::new(10, 0, 0, 1);
        let server = Ipv4Addr::new(10, 0, 0, 2);

        table.ingest(&frame(client, 51000, server, 80, flags(true, false), 0, &[]));
        table.ingest(&frame(server, 80, client, 51000, flags(true, true), 0, &[]));

        let req = b"GET / HTTP/1.1\r\nHost: svc\r\n\r\n";
        table.ingest(&frame(client, 51000, server, 80, flags(false, true), 1, req));

        let events = table.drain_events();
        let with_http = events.iter().find(|e| e.http.is_some());
        assert!(with_http.is_some());
        assert_eq!(with_http.unwrap().protocol, Proto::Http);
    }

    #[test]
    fn test_tcp_handshake_ms_recorded_on_syn_ack() {
        let mut table = FlowTable::new(FlowConfig::default(), DecodeConfig::default(), None);
        let client = Ipv4Addr::new(10, 0, 0, 1);
        let server = Ipv4Addr::new(10, 0, 0, 2);

        let t0 = Utc::now();
        let mut syn = frame(client, 51000, server, 443, flags(true, false), 0, &[]);
        syn.timestamp = t0;
        table.ingest(&syn);

        let mut syn_ack = frame(server, 443, client, 51000, flags(true, true), 0, &[]);
        syn_ack.timestamp = t0 + chrono::Duration::milliseconds(42);
        table.ingest(&syn_ack);

        let events = table.drain_events();
        let established = events.iter().find(|e| e.tcp_handshake_ms.is_some()).unwrap();
        assert_eq!(established.tcp_handshake_ms, Some(42));
    }

    #[test]
    fn test_agent_traffic_is_tagged_and_still_assembled() {
        let mut table = FlowTable::new(FlowConfig::default(), DecodeConfig::default(), None);
        let hub_ip = Ipv4Addr::new(10, 0, 0, 99);
        table.set_hub_peer(hub_ip, 7000);

        let client = Ipv4Addr::new(10, 0, 0, 1);
        table.ingest(&frame(client, 51000, hub_ip, 7000, flags(true, false), 0, &[]));
        assert_eq!(table.active_flow_count(), 1);

        let events = table.drain_events();
        assert_eq!(events.len(), 1);
        assert!(events[0].is_agent_traffic);
        assert_eq!(events[0].agent_traffic_type.as_deref(), Some("flow"));
    }

    #[test]
    fn test_sweep_times_out_idle_flow() {
        let mut table = FlowTable::new(FlowConfig::default(), DecodeConfig::default(), None);
        let client = Ipv4Addr::new(10, 0, 0, 1);
        let server = Ipv4Addr::new(10, 0, 0, 2);

        let t0 = Utc::now();
        let mut f = frame(client, 51000, server, 443, flags(true, true), 0, &[]);
        f.timestamp = t0;
        table.ingest(&f);
        let _ = table.drain_events();

        table.sweep(t0 + chrono::Duration::seconds(3600));
        let events = table.drain_events();
        assert!(events.iter().any(|e| e.status == FlowStatus::Timeout));
    }
}
