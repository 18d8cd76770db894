//! Hub Ingress — accepts agent registrations, FlowEvent batches, and PCAP
//! binary chunks over one WebSocket connection per agent (spec §4.5).
//!
//! No teacher analogue (the teacher ingested over a Redis stream fed by an
//! upstream capture process it didn't define); the handler shape itself —
//! `WebSocketUpgrade` extractor, `on_upgrade` into a per-connection task —
//! follows the axum idiom already used by the agent's own metrics server
//! and by the pack's `ayaFlow`/`cthulu` HTTP surfaces.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::protocol::{ClientMessage, FlowEvent, ServerMessage};

const MAX_FLOWS_PER_BATCH: usize = 2000;
const MAX_STRING_LEN: usize = 8192;
const MAX_TIMESTAMP_SKEW_MINUTES: i64 = 5;

pub async fn handle(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let (agent_id, pod_name, pod_namespace, pod_ip, node_name) = match wait_for_registration(&mut socket).await {
        Some(reg) => reg,
        None => return,
    };

    state.agents.insert(agent_id, pod_name, pod_namespace, pod_ip, node_name);
    state.metrics.agents_connected.inc();
    info!("Agent {} registered", agent_id);

    while let Some(Ok(msg)) = socket.recv().await {
        match msg {
            Message::Text(text) => {
                if !handle_client_message(&text, &state, &mut socket).await {
                    break;
                }
            }
            Message::Binary(bytes) => {
                state.metrics.pcap_bytes_received_total.inc_by(bytes.len() as u64);
                state.pcap_ring.append_chunk(&bytes);
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.agents.remove(&agent_id);
    state.metrics.agents_connected.dec();
    info!("Agent {} disconnected", agent_id);
}

type Registration = (uuid::Uuid, Option<String>, Option<String>, Option<std::net::Ipv4Addr>, Option<String>);

async fn wait_for_registration(socket: &mut WebSocket) -> Option<Registration> {
    loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Register { agent_id, pod_name, pod_namespace, pod_ip, node_name }) => {
                    if let Some(name) = &pod_name {
                        debug!("Agent {} reports pod name '{}'", agent_id, name);
                    }
                    let ack = ServerMessage::Registered { agent_id };
                    if socket
                        .send(Message::Text(serde_json::to_string(&ack).ok()?))
                        .await
                        .is_err()
                    {
                        return None;
                    }
                    return Some((agent_id, pod_name, pod_namespace, pod_ip, node_name));
                }
                Ok(_) => {
                    warn!("First message from agent was not Register; dropping connection");
                    return None;
                }
                Err(e) => {
                    warn!("Malformed registration message: {}", e);
                    return None;
                }
            },
            Some(Ok(Message::Close(_))) | None => return None,
            Some(Ok(_)) => continue,
            Some(Err(_)) => return None,
        }
    }
}

/// Returns `false` if the connection should be torn down.
async fn handle_client_message(text: &str, state: &AppState, socket: &mut WebSocket) -> bool {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("Ignoring malformed message from agent: {}", e);
            return true;
        }
    };

    match msg {
        ClientMessage::Register { .. } => true,
        ClientMessage::FlowBatch { flows } => {
            if flows.len() > MAX_FLOWS_PER_BATCH {
                warn!("Rejecting oversized batch of {} flows", flows.len());
                state.metrics.flow_events_rejected_total.inc();
                return true;
            }
            let now = Utc::now();
            for event in flows {
                if let Err(reason) = validate_flow_event(&event, now) {
                    debug!("Rejecting invalid FlowEvent: {}", reason);
                    state.metrics.flow_events_rejected_total.inc();
                    continue;
                }
                let record = state.flow_table.apply(event, now);
                state.metrics.flow_events_received_total.inc();
                state.metrics.flows_active.set(state.flow_table.len() as i64);
                state.fanout.mark_changed(record);
            }
            true
        }
        ClientMessage::Heartbeat { .. } => {
            let (bpf_filter, bpf_nonce) = state.control.current();
            let ack = ServerMessage::HeartbeatAck {
                bpf_filter,
                bpf_nonce,
                paused: state.fanout.is_paused(),
            };
            match serde_json::to_string(&ack) {
                Ok(text) => socket.send(Message::Text(text)).await.is_ok(),
                Err(_) => true,
            }
        }
    }
}

/// Oversized or stale FlowEvents are rejected without disconnecting the
/// agent (spec §4.5/§7: `InvalidInput`, no agent effect).
fn validate_flow_event(event: &FlowEvent, now: DateTime<Utc>) -> Result<(), String> {
    let skew = ChronoDuration::minutes(MAX_TIMESTAMP_SKEW_MINUTES);
    if (event.last_seen_at - now).abs() > skew {
        return Err(format!("last_seen_at {} is outside the {}-minute clock skew window", event.last_seen_at, MAX_TIMESTAMP_SKEW_MINUTES));
    }
    if event.started_at > event.last_seen_at {
        return Err("started_at is after last_seen_at".to_string());
    }

    let string_fields: Vec<&str> = [
        event.pod_name.as_deref(),
        event.http.as_ref().and_then(|h| h.request.as_ref()).map(|r| r.path.as_str()),
        event.http.as_ref().and_then(|h| h.request.as_ref()).and_then(|r| r.host.as_deref()),
        event.http.as_ref().and_then(|h| h.request.as_ref()).and_then(|r| r.user_agent.as_deref()),
        event.tls_client.as_ref().and_then(|t| t.sni.as_deref()),
    ]
    .into_iter()
    .flatten()
    .collect();

    if string_fields.iter().any(|s| s.len() > MAX_STRING_LEN) {
        return Err("metadata field exceeds the size cap".to_string());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FlowId;
    use std::net::Ipv4Addr;

    fn base_event() -> FlowEvent {
        FlowEvent {
            flow_id: FlowId(1),
            pod_name: None,
            protocol: crate::protocol::ProtocolTag::Tcp,
            src_ip: Ipv4Addr::new(10, 0, 0, 1),
            dst_ip: Ipv4Addr::new(10, 0, 0, 2),
            src_port: 1000,
            dst_port: 80,
            status: crate::protocol::FlowStatus::Open,
            started_at: Utc::now(),
            last_seen_at: Utc::now(),
            bytes_client_to_server: 0,
            bytes_server_to_client: 0,
            tcp_handshake_ms: None,
            tls_handshake_ms: None,
            ttfb_ms: None,
            is_agent_traffic: false,
            agent_traffic_type: None,
            http: None,
            tls_client: None,
            tls_server: None,
        }
    }

    #[test]
    fn test_accepts_fresh_event() {
        assert!(validate_flow_event(&base_event(), Utc::now()).is_ok());
    }

    #[test]
    fn test_rejects_stale_timestamp() {
        let mut event = base_event();
        event.last_seen_at = Utc::now() - ChronoDuration::minutes(10);
        assert!(validate_flow_event(&event, Utc::now()).is_err());
    }

    #[test]
    fn test_rejects_inverted_timestamps() {
        let mut event = base_event();
        event.started_at = Utc::now() + ChronoDuration::seconds(10);
        assert!(validate_flow_event(&event, Utc::now()).is_err());
    }

    #[test]
    fn test_rejects_oversized_string_field() {
        let mut event = base_event();
        event.pod_name = Some("x".repeat(MAX_STRING_LEN + 1));
        assert!(validate_flow_event(&event, Utc::now()).is_err());
    }
}
