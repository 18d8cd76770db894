//! Shared application state wired into every axum handler.
//!
//! Grounded on the pack's own `AppState`-bundle-of-`Arc`s-passed-to-
//! `with_state` convention (an `Arc<Registry>`-equivalent per shared
//! structure rather than one big lock).

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::fanout::FanoutHub;
use crate::flow_table::FlowTable;
use crate::metrics::Metrics;
use crate::pcap_ring::PcapRing;

/// One connected agent, as tracked by the ingress registry. Unlike the
/// Flow Table (one serialized writer), this is written concurrently by
/// every agent's own connection task, so it's a natural fit for `DashMap`
/// rather than a single `RwLock`-guarded map.
#[derive(Debug, Clone)]
pub struct AgentSession {
    pub pod_name: Option<String>,
    pub pod_namespace: Option<String>,
    pub pod_ip: Option<Ipv4Addr>,
    pub node_name: Option<String>,
    pub connected_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct AgentRegistry {
    sessions: DashMap<Uuid, AgentSession>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert(
        &self,
        agent_id: Uuid,
        pod_name: Option<String>,
        pod_namespace: Option<String>,
        pod_ip: Option<Ipv4Addr>,
        node_name: Option<String>,
    ) {
        self.sessions.insert(
            agent_id,
            AgentSession { pod_name, pod_namespace, pod_ip, node_name, connected_at: Utc::now() },
        );
    }

    pub fn remove(&self, agent_id: &Uuid) {
        self.sessions.remove(agent_id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// The Hub's authoritative BPF expression plus the nonce agents use to
/// detect changes, and the feedback-loop-only default it resets to.
pub struct ControlState {
    filter: RwLock<String>,
    nonce: AtomicU64,
    default_filter: String,
}

impl ControlState {
    pub fn new(default_filter: String) -> Self {
        Self {
            filter: RwLock::new(default_filter.clone()),
            nonce: AtomicU64::new(1),
            default_filter,
        }
    }

    pub fn current(&self) -> (String, u64) {
        (self.filter.read().clone(), self.nonce.load(Ordering::Relaxed))
    }

    /// Install a new, already-validated BPF expression. Setting the exact
    /// same expression twice bumps nothing (spec: "Setting the same BPF
    /// expression twice is a no-op at the agent").
    pub fn set(&self, expression: String) -> u64 {
        let mut current = self.filter.write();
        if *current == expression {
            return self.nonce.load(Ordering::Relaxed);
        }
        *current = expression;
        self.nonce.fetch_add(1, Ordering::Relaxed)
    }

    pub fn clear(&self) -> u64 {
        self.set(self.default_filter.clone())
    }
}

#[derive(Clone)]
pub struct AppState {
    pub flow_table: Arc<FlowTable>,
    pub pcap_ring: Arc<PcapRing>,
    pub fanout: Arc<FanoutHub>,
    pub control: Arc<ControlState>,
    pub metrics: Arc<Metrics>,
    pub agents: Arc<AgentRegistry>,
    pub agent_ingress_port: u16,
    pub start_time: DateTime<Utc>,
}

impl AppState {
    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.start_time).num_seconds().max(0)
    }
}
