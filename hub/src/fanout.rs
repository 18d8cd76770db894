//! Fan-out Hub — catchup + coalesced live delivery to WebSocket subscribers.
//!
//! Grounded on the shared-state/broadcast-fanout shape used by other
//! aggregation-style services in the pack (an `AppState`-held
//! `broadcast::Sender` that every subscriber connection clones a receiver
//! from), generalized to the catchup/batch/pause semantics of spec §4.8.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

use crate::flow_table::FlowRecord;
use crate::protocol::{FlowStatus, HttpExchange, ProtocolTag, TlsClientHello, TlsServerHello};

/// Subscriber-facing flow representation. Deliberately camelCase, unlike
/// the snake_case agent wire protocol, to match the browser-facing JSON
/// shapes spelled out in the external interface (`pcapFull`, `bpfFilter`,
/// ...).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDto {
    pub flow_id: String,
    pub pod_name: Option<String>,
    pub protocol: ProtocolTag,
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub status: FlowStatus,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub last_seen_at: chrono::DateTime<chrono::Utc>,
    pub bytes_client_to_server: u64,
    pub bytes_server_to_client: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_handshake_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_handshake_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttfb_ms: Option<i64>,
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

impl From<&FlowRecord> for FlowDto {
    fn from(r: &FlowRecord) -> Self {
        Self {
            flow_id: r.flow_id.to_string(),
            pod_name: r.pod_name.clone(),
            protocol: r.protocol,
            src_ip: r.src_ip.to_string(),
            dst_ip: r.dst_ip.to_string(),
            src_port: r.src_port,
            dst_port: r.dst_port,
            status: r.status,
            started_at: r.started_at,
            last_seen_at: r.last_seen_at,
            bytes_client_to_server: r.bytes_client_to_server,
            bytes_server_to_client: r.bytes_server_to_client,
            tcp_handshake_ms: r.tcp_handshake_ms,
            tls_handshake_ms: r.tls_handshake_ms,
            ttfb_ms: r.ttfb_ms,
            is_agent_traffic: r.is_agent_traffic,
            agent_traffic_type: r.agent_traffic_type.clone(),
            http: r.http.clone(),
            tls_client: r.tls_client.clone(),
            tls_server: r.tls_server.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubscriberMessage {
    Catchup { flows: Vec<FlowDto> },
    Batch { flows: Vec<FlowDto> },
}

/// Live subscriber registry plus the coalescing buffer for pause/resume.
pub struct FanoutHub {
    tx: broadcast::Sender<SubscriberMessage>,
    pending: Mutex<Vec<FlowRecord>>,
    paused: AtomicBool,
}

impl FanoutHub {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            tx,
            pending: Mutex::new(Vec::new()),
            paused: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SubscriberMessage> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Flip the paused flag. Unpausing folds whatever accumulated while
    /// paused into the next coalesced batch rather than sending it
    /// immediately, per spec §4.8 ("pending changes are folded into one
    /// catch-up batch").
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    /// Record that a flow changed, to be included in the next coalesced
    /// batch tick. Called by the ingress writer on every `FlowTable::apply`.
    pub fn mark_changed(&self, record: FlowRecord) {
        self.pending.lock().push(record);
    }

    /// Called on the coalescing tick (default every 100 ms+). Drains the
    /// pending buffer and broadcasts it as one batch, unless paused — in
    /// which case changes keep accumulating silently.
    pub fn flush(&self) {
        if self.paused.load(Ordering::Relaxed) {
            return;
        }
        let pending = {
            let mut guard = self.pending.lock();
            if guard.is_empty() {
                return;
            }
            std::mem::take(&mut *guard)
        };
        let flows = pending.iter().map(FlowDto::from).collect();
        let _ = self.tx.send(SubscriberMessage::Batch { flows });
    }
}

impl Default for FanoutHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FlowEvent, FlowId};
    use std::net::Ipv4Addr;

    fn record(id: u64) -> FlowRecord {
        let table = crate::flow_table::FlowTable::new(10);
        table.apply(
            FlowEvent {
                flow_id: FlowId(id),
                pod_name: None,
                protocol: ProtocolTag::Tcp,
                src_ip: Ipv4Addr::new(10, 0, 0, 1),
                dst_ip: Ipv4Addr::new(10, 0, 0, 2),
                src_port: 1000,
                dst_port: 80,
                status: FlowStatus::Open,
                started_at: chrono::Utc::now(),
                last_seen_at: chrono::Utc::now(),
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
            },
            chrono::Utc::now(),
        )
    }

    #[test]
    fn test_flush_is_noop_when_nothing_pending() {
        let hub = FanoutHub::new();
        let mut rx = hub.subscribe();
        hub.flush();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_paused_suppresses_flush() {
        let hub = FanoutHub::new();
        let mut rx = hub.subscribe();
        hub.set_paused(true);
        hub.mark_changed(record(1));
        hub.flush();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unpaused_flush_delivers_batch() {
        let hub = FanoutHub::new();
        let mut rx = hub.subscribe();
        hub.mark_changed(record(1));
        hub.flush();
        match rx.try_recv().unwrap() {
            SubscriberMessage::Batch { flows } => assert_eq!(flows.len(), 1),
            _ => panic!("expected a batch message"),
        }
    }

    #[test]
    fn test_resume_folds_paused_changes_into_next_flush() {
        let hub = FanoutHub::new();
        let mut rx = hub.subscribe();

        hub.set_paused(true);
        hub.mark_changed(record(1));
        hub.mark_changed(record(2));
        hub.flush();
        assert!(rx.try_recv().is_err(), "paused flush must not deliver anything");

        hub.set_paused(false);
        hub.flush();
        match rx.try_recv().unwrap() {
            SubscriberMessage::Batch { flows } => assert_eq!(flows.len(), 2),
            _ => panic!("expected a batch message"),
        }
        assert!(rx.try_recv().is_err(), "nothing left pending after resume flush");
    }
}
