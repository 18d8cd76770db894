//! Server-side Flow Table (capacity-capped, merge-over-insert, LRU-by-
//! last-updated eviction).
//!
//! Unlike the agent's single-owner table, the Hub's table is written from
//! many concurrent ingress connections. The concurrency model calls for "a
//! single serialized writer... mutation is exclusive, read is by snapshot"
//! rather than per-key sharding, so this is a `parking_lot::RwLock` around
//! one `HashMap` plus its recency index — not a `DashMap` — which gives
//! exactly that: writers briefly hold the write lock, readers (stats,
//! fan-out catchup) take a read lock and clone out.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;

use crate::protocol::{FlowEvent, FlowId, FlowStatus, HttpExchange, ProtocolTag, TlsClientHello, TlsServerHello};

#[derive(Debug, Clone)]
pub struct FlowRecord {
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
    pub tcp_handshake_ms: Option<i64>,
    pub tls_handshake_ms: Option<i64>,
    pub ttfb_ms: Option<i64>,
    pub is_agent_traffic: bool,
    pub agent_traffic_type: Option<String>,
    pub http: Option<HttpExchange>,
    pub tls_client: Option<TlsClientHello>,
    pub tls_server: Option<TlsServerHello>,
    last_updated_ms: i64,
}

impl FlowRecord {
    fn from_event(event: FlowEvent, now_ms: i64) -> Self {
        Self {
            flow_id: event.flow_id,
            pod_name: event.pod_name,
            protocol: event.protocol,
            src_ip: event.src_ip,
            dst_ip: event.dst_ip,
            src_port: event.src_port,
            dst_port: event.dst_port,
            status: event.status,
            started_at: event.started_at,
            last_seen_at: event.last_seen_at,
            bytes_client_to_server: event.bytes_client_to_server,
            bytes_server_to_client: event.bytes_server_to_client,
            tcp_handshake_ms: event.tcp_handshake_ms,
            tls_handshake_ms: event.tls_handshake_ms,
            ttfb_ms: event.ttfb_ms,
            is_agent_traffic: event.is_agent_traffic,
            agent_traffic_type: event.agent_traffic_type,
            http: event.http,
            tls_client: event.tls_client,
            tls_server: event.tls_server,
            last_updated_ms: now_ms,
        }
    }

    /// Merge an incoming event over this record: counters take the max,
    /// timestamps take min(first-seen)/max(last-seen), status only
    /// advances, `isAgentTraffic` only ever turns on, and optional metadata
    /// is replaced when the event carries a fresh (non-null) value.
    fn merge(&mut self, event: FlowEvent, now_ms: i64) {
        self.bytes_client_to_server = self.bytes_client_to_server.max(event.bytes_client_to_server);
        self.bytes_server_to_client = self.bytes_server_to_client.max(event.bytes_server_to_client);
        self.started_at = self.started_at.min(event.started_at);
        self.last_seen_at = self.last_seen_at.max(event.last_seen_at);
        if event.status.rank() >= self.status.rank() {
            self.status = event.status;
        }
        self.protocol = event.protocol;
        if event.tcp_handshake_ms.is_some() {
            self.tcp_handshake_ms = event.tcp_handshake_ms;
        }
        if event.tls_handshake_ms.is_some() {
            self.tls_handshake_ms = event.tls_handshake_ms;
        }
        if event.ttfb_ms.is_some() {
            self.ttfb_ms = event.ttfb_ms;
        }
        self.is_agent_traffic = self.is_agent_traffic || event.is_agent_traffic;
        if event.agent_traffic_type.is_some() {
            self.agent_traffic_type = event.agent_traffic_type;
        }
        if event.pod_name.is_some() {
            self.pod_name = event.pod_name;
        }
        if event.http.is_some() {
            self.http = event.http;
        }
        if event.tls_client.is_some() {
            self.tls_client = event.tls_client;
        }
        if event.tls_server.is_some() {
            self.tls_server = event.tls_server;
        }
        self.last_updated_ms = now_ms;
    }
}

struct Inner {
    flows: HashMap<FlowId, FlowRecord>,
    recency: BTreeSet<(i64, FlowId)>,
    evictions: u64,
}

pub struct FlowTable {
    capacity: usize,
    inner: RwLock<Inner>,
}

impl FlowTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(Inner {
                flows: HashMap::new(),
                recency: BTreeSet::new(),
                evictions: 0,
            }),
        }
    }

    /// Apply one incoming FlowEvent: merge over the existing record if
    /// present, else insert — evicting the least-recently-updated flow
    /// first if the table is already at capacity. Returns a clone of the
    /// record as it stands after the merge, for fan-out to subscribers.
    pub fn apply(&self, event: FlowEvent, now: DateTime<Utc>) -> FlowRecord {
        let now_ms = now.timestamp_millis();
        let id = event.flow_id;
        let mut inner = self.inner.write();

        if let Some(existing) = inner.flows.get_mut(&id) {
            let prev_ts = existing.last_updated_ms;
            existing.merge(event, now_ms);
            let record = existing.clone();
            inner.recency.remove(&(prev_ts, id));
            inner.recency.insert((now_ms, id));
            return record;
        }

        if inner.flows.len() >= self.capacity {
            if let Some(&(oldest_ts, oldest_id)) = inner.recency.iter().next() {
                inner.recency.remove(&(oldest_ts, oldest_id));
                inner.flows.remove(&oldest_id);
                inner.evictions += 1;
            }
        }

        let record = FlowRecord::from_event(event, now_ms);
        inner.flows.insert(id, record.clone());
        inner.recency.insert((now_ms, id));
        record
    }

    pub fn len(&self) -> usize {
        self.inner.read().flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().flows.is_empty()
    }

    pub fn eviction_count(&self) -> u64 {
        self.inner.read().evictions
    }

    /// Consistent point-in-time snapshot of every tracked flow, for a
    /// subscriber's catchup message or the export path.
    pub fn snapshot(&self) -> Vec<FlowRecord> {
        self.inner.read().flows.values().cloned().collect()
    }

    pub fn get(&self, id: FlowId) -> Option<FlowRecord> {
        self.inner.read().flows.get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: u64, status: FlowStatus, bytes: u64) -> FlowEvent {
        FlowEvent {
            flow_id: FlowId(id),
            pod_name: None,
            protocol: ProtocolTag::Tcp,
            src_ip: Ipv4Addr::new(10, 0, 0, 1),
            dst_ip: Ipv4Addr::new(10, 0, 0, 2),
            src_port: 5000,
            dst_port: 80,
            status,
            started_at: Utc::now(),
            last_seen_at: Utc::now(),
            bytes_client_to_server: bytes,
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
    fn test_merge_takes_max_counters_and_advances_state() {
        let table = FlowTable::new(10);
        table.apply(event(1, FlowStatus::Open, 100), Utc::now());
        table.apply(event(1, FlowStatus::Open, 50), Utc::now());
        let record = table.get(FlowId(1)).unwrap();
        assert_eq!(record.bytes_client_to_server, 100);
        assert_eq!(record.status, FlowStatus::Open);
    }

    #[test]
    fn test_state_never_regresses() {
        let table = FlowTable::new(10);
        table.apply(event(1, FlowStatus::Closed, 0), Utc::now());
        table.apply(event(1, FlowStatus::Open, 0), Utc::now());
        assert_eq!(table.get(FlowId(1)).unwrap().status, FlowStatus::Closed);
    }

    #[test]
    fn test_capacity_evicts_least_recently_updated() {
        let table = FlowTable::new(2);
        table.apply(event(1, FlowStatus::Open, 0), Utc::now());
        table.apply(event(2, FlowStatus::Open, 0), Utc::now());
        table.apply(event(3, FlowStatus::Open, 0), Utc::now());
        assert_eq!(table.len(), 2);
        assert!(table.get(FlowId(1)).is_none());
        assert!(table.get(FlowId(2)).is_some());
        assert!(table.get(FlowId(3)).is_some());
        assert_eq!(table.eviction_count(), 1);
    }

    #[test]
    fn test_updating_a_flow_refreshes_its_recency() {
        let table = FlowTable::new(2);
        table.apply(event(1, FlowStatus::Open, 0), Utc::now());
        table.apply(event(2, FlowStatus::Open, 0), Utc::now());
        table.apply(event(1, FlowStatus::Open, 10), Utc::now());
        table.apply(event(3, FlowStatus::Open, 0), Utc::now());
        assert!(table.get(FlowId(1)).is_some());
        assert!(table.get(FlowId(2)).is_none());
    }

    #[test]
    fn test_is_agent_traffic_never_regresses_once_set() {
        let table = FlowTable::new(10);
        let mut first = event(1, FlowStatus::Open, 0);
        first.is_agent_traffic = true;
        first.agent_traffic_type = Some("flow".to_string());
        table.apply(first, Utc::now());

        let second = event(1, FlowStatus::Open, 10);
        table.apply(second, Utc::now());

        let record = table.get(FlowId(1)).unwrap();
        assert!(record.is_agent_traffic);
    }
}
