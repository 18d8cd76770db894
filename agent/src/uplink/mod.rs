//! Agent Client — the sidecar's single outbound connection to the Hub.
//!
//! One WebSocket duplex connection carries a registration handshake,
//! batched FlowEvents, and periodic heartbeats. Reconnects with linear
//! backoff bounded by `reconnect_initial_ms`/`reconnect_max_ms`; while
//! disconnected, flow events keep accumulating in the bounded channel and
//! are flushed as soon as the connection comes back.

mod protocol;

pub use protocol::{ClientMessage, ServerMessage};

/// Why `AgentClient::run` returned. `ShutdownRequested` is a clean exit the
/// caller already expects; `HubDisconnected` means the agent should trigger
/// its own shutdown, per the spec's "when the Hub disconnects" contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UplinkOutcome {
    ShutdownRequested,
    HubDisconnected,
}

const MAX_CONNECT_ATTEMPTS: u32 = 30;
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const HEARTBEAT_READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectOutcome {
    Shutdown,
    Disconnected,
}

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use url::Url;
use uuid::Uuid;

use crate::capture::PacketSource;
use crate::config::HubConfig;
use crate::flow::FlowEvent;

#[derive(Debug, Default)]
pub struct UplinkStats {
    pub batches_sent: AtomicU64,
    pub events_sent: AtomicU64,
    pub reconnects: AtomicU64,
    pub send_errors: AtomicU64,
    pub connected: AtomicBool,
}

impl UplinkStats {
    pub fn snapshot(&self) -> UplinkStatsSnapshot {
        UplinkStatsSnapshot {
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            events_sent: self.events_sent.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            connected: self.connected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UplinkStatsSnapshot {
    pub batches_sent: u64,
    pub events_sent: u64,
    pub reconnects: u64,
    pub send_errors: u64,
    pub connected: bool,
}

/// Resolve the Hub's WebSocket URL down to a concrete IPv4/port, so the
/// flow table can recognize and suppress the agent's own control traffic.
pub fn resolve_hub_peer(address: &str) -> Option<(Ipv4Addr, u16)> {
    let url = Url::parse(address).ok()?;
    let host = url.host_str()?;
    let port = url.port_or_known_default().unwrap_or(7000);
    let resolved = format!("{}:{}", host, port);
    std::net::ToSocketAddrs::to_socket_addrs(&resolved)
        .ok()?
        .find_map(|addr| match addr.ip() {
            std::net::IpAddr::V4(ip) => Some((ip, addr.port())),
            _ => None,
        })
}

/// Compose the agent's own startup BPF expression so captured packets never
/// describe the capture itself (spec §6 "Feedback-loop filter"). Both
/// directions are covered by a single `host`+`host`+`port` clause, since BPF
/// matches either direction for those predicates. If the Hub's IP couldn't
/// be resolved but its port is still known, falls back to a port+pod-IP
/// exclusion without the Hub host clause; returns `None` (capture
/// everything, caller logs a warning) only if the pod IP itself is unknown.
pub fn compose_feedback_filter(pod_ip: Option<Ipv4Addr>, hub_address: &str) -> Option<String> {
    let pod_ip = pod_ip?;
    match resolve_hub_peer(hub_address) {
        Some((hub_ip, port)) => Some(format!(
            "not (tcp and host {} and host {} and port {})",
            pod_ip, hub_ip, port
        )),
        None => match Url::parse(hub_address).ok().and_then(|u| u.port_or_known_default()) {
            Some(port) => Some(format!("not (tcp and host {} and port {})", pod_ip, port)),
            None => Some(format!("not (tcp and host {})", pod_ip)),
        },
    }
}

pub struct AgentClient {
    config: HubConfig,
    agent_id: Uuid,
    pod_name: Option<String>,
    pod_namespace: Option<String>,
    pod_ip: Option<Ipv4Addr>,
    node_name: Option<String>,
    stats: Arc<UplinkStats>,
    packet_source: Arc<PacketSource>,
    bpf_nonce: AtomicU64,
}

impl AgentClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: HubConfig,
        pod_name: Option<String>,
        pod_namespace: Option<String>,
        pod_ip: Option<Ipv4Addr>,
        node_name: Option<String>,
        packet_source: Arc<PacketSource>,
    ) -> Self {
        Self {
            config,
            agent_id: Uuid::new_v4(),
            pod_name,
            pod_namespace,
            pod_ip,
            node_name,
            stats: Arc::new(UplinkStats::default()),
            packet_source,
            bpf_nonce: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> Arc<UplinkStats> {
        Arc::clone(&self.stats)
    }

    /// Drive the connection until `shutdown` fires or the Hub disconnects.
    /// Flow events arrive on `flow_rx` and are coalesced into batches of up
    /// to `batch_size`, or flushed early every `flush_interval_ms`. PCAP
    /// chunks arrive on `pcap_rx` and are forwarded as binary frames on the
    /// same socket, a logically separate stream per spec.
    ///
    /// Connection attempts retry with linear backoff up to
    /// `MAX_CONNECT_ATTEMPTS` before giving up fatally. Once connected, any
    /// subsequent disconnect is NOT retried — the caller is expected to
    /// shut the agent process down, per the Hub-disconnect contract.
    pub async fn run(
        &self,
        mut flow_rx: mpsc::Receiver<FlowEvent>,
        mut pcap_rx: mpsc::Receiver<Vec<u8>>,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) -> Result<UplinkOutcome> {
        let mut backoff_ms = self.config.reconnect_initial_ms;
        let mut attempt = 0u32;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Uplink shutting down");
                    return Ok(UplinkOutcome::ShutdownRequested);
                }
                outcome = self.connect_and_serve(&mut flow_rx, &mut pcap_rx, &mut shutdown) => {
                    self.stats.connected.store(false, Ordering::Relaxed);
                    match outcome {
                        Ok(ConnectOutcome::Shutdown) => return Ok(UplinkOutcome::ShutdownRequested),
                        Ok(ConnectOutcome::Disconnected) => return Ok(UplinkOutcome::HubDisconnected),
                        Err(e) => {
                            attempt += 1;
                            if attempt >= MAX_CONNECT_ATTEMPTS {
                                return Err(e).with_context(|| {
                                    format!(
                                        "failed to connect to Hub at {} after {} attempts",
                                        self.config.address, attempt
                                    )
                                });
                            }
                            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(
                                "Hub connect attempt {}/{} failed: {}, retrying in {}ms",
                                attempt, MAX_CONNECT_ATTEMPTS, e, backoff_ms
                            );
                            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                            backoff_ms = (backoff_ms + self.config.reconnect_initial_ms)
                                .min(self.config.reconnect_max_ms);
                        }
                    }
                }
            }
        }
    }

    /// Apply a BPF expression pushed by the Hub, if its nonce is newer than
    /// the last one we applied. Setting the same filter twice is a no-op.
    fn maybe_apply_bpf(&self, expression: &str, nonce: u64) {
        let previous = self.bpf_nonce.swap(nonce, Ordering::Relaxed);
        if previous == nonce {
            return;
        }
        if let Err(e) = self.packet_source.set_bpf(expression) {
            tracing::warn!("Hub pushed an invalid BPF filter '{}': {}", expression, e);
            self.bpf_nonce.store(previous, Ordering::Relaxed);
        } else {
            tracing::info!("Applied Hub-pushed BPF filter: {}", expression);
        }
    }

    /// One connection attempt plus its serve loop. A failure to establish
    /// the connection itself is returned as `Err` (the caller retries with
    /// backoff); any failure or disconnect after that is reported as
    /// `ConnectOutcome::Disconnected` (the caller does not retry).
    async fn connect_and_serve(
        &self,
        flow_rx: &mut mpsc::Receiver<FlowEvent>,
        pcap_rx: &mut mpsc::Receiver<Vec<u8>>,
        shutdown: &mut tokio::sync::broadcast::Receiver<()>,
    ) -> Result<ConnectOutcome> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.config.address)
            .await
            .with_context(|| format!("failed to connect to Hub at {}", self.config.address))?;
        let (mut write, mut read) = ws_stream.split();

        let register = ClientMessage::Register {
            agent_id: self.agent_id,
            pod_name: self.pod_name.clone(),
            pod_namespace: self.pod_namespace.clone(),
            pod_ip: self.pod_ip,
            node_name: self.node_name.clone(),
        };
        if send_with_timeout(&mut write, Message::Text(serde_json::to_string(&register)?))
            .await
            .is_err()
        {
            return Ok(ConnectOutcome::Disconnected);
        }
        self.stats.connected.store(true, Ordering::Relaxed);
        tracing::info!("Registered with Hub as {}", self.agent_id);

        let mut flush = tokio::time::interval(Duration::from_millis(self.config.flush_interval_ms));
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat = tokio::time::interval(Duration::from_millis(self.config.heartbeat_interval_ms));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Set while a heartbeat is outstanding; cleared on its ack. A
        // heartbeat left unanswered past HEARTBEAT_READ_TIMEOUT means the
        // Hub has stopped responding even if the TCP connection looks alive.
        let mut heartbeat_deadline: Option<tokio::time::Instant> = None;

        let mut pending: Vec<FlowEvent> = Vec::with_capacity(self.config.batch_size);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    if !pending.is_empty() {
                        let _ = self.send_batch(&mut write, std::mem::take(&mut pending)).await;
                    }
                    let _ = send_with_timeout(&mut write, Message::Close(None)).await;
                    return Ok(ConnectOutcome::Shutdown);
                }
                _ = async {
                    match heartbeat_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    tracing::warn!("No heartbeat ack from Hub within {:?}", HEARTBEAT_READ_TIMEOUT);
                    return Ok(ConnectOutcome::Disconnected);
                }
                maybe_event = flow_rx.recv() => {
                    match maybe_event {
                        Some(event) => {
                            pending.push(event);
                            if pending.len() >= self.config.batch_size
                                && self.send_batch(&mut write, std::mem::take(&mut pending)).await.is_err()
                            {
                                return Ok(ConnectOutcome::Disconnected);
                            }
                        }
                        None => {
                            if !pending.is_empty() {
                                let _ = self.send_batch(&mut write, std::mem::take(&mut pending)).await;
                            }
                            return Ok(ConnectOutcome::Shutdown);
                        }
                    }
                }
                _ = flush.tick() => {
                    if !pending.is_empty()
                        && self.send_batch(&mut write, std::mem::take(&mut pending)).await.is_err()
                    {
                        return Ok(ConnectOutcome::Disconnected);
                    }
                }
                _ = heartbeat.tick() => {
                    let msg = ClientMessage::Heartbeat { agent_id: self.agent_id };
                    if send_with_timeout(&mut write, Message::Text(serde_json::to_string(&msg)?)).await.is_err() {
                        return Ok(ConnectOutcome::Disconnected);
                    }
                    heartbeat_deadline = Some(tokio::time::Instant::now() + HEARTBEAT_READ_TIMEOUT);
                }
                maybe_chunk = pcap_rx.recv() => {
                    if let Some(chunk) = maybe_chunk {
                        if send_with_timeout(&mut write, Message::Binary(chunk)).await.is_err() {
                            return Ok(ConnectOutcome::Disconnected);
                        }
                    }
                }
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(Message::Close(_))) | None => {
                            return Ok(ConnectOutcome::Disconnected);
                        }
                        Some(Ok(Message::Text(text))) => {
                            if self.handle_server_message(&text) {
                                heartbeat_deadline = None;
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(_)) => return Ok(ConnectOutcome::Disconnected),
                    }
                }
            }
        }
    }

    /// Returns `true` if the message was a `HeartbeatAck`, so the caller can
    /// clear the pending heartbeat read-timeout deadline.
    fn handle_server_message(&self, text: &str) -> bool {
        let msg: ServerMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Ignoring malformed message from Hub: {}", e);
                return false;
            }
        };
        match msg {
            ServerMessage::HeartbeatAck { bpf_filter, bpf_nonce, paused } => {
                self.maybe_apply_bpf(&bpf_filter, bpf_nonce);
                if paused {
                    tracing::debug!("Hub reports capture paused");
                }
                return true;
            }
            ServerMessage::SetBpfFilter { expression } => {
                if let Err(e) = self.packet_source.set_bpf(&expression) {
                    tracing::warn!("Hub pushed an invalid BPF filter '{}': {}", expression, e);
                }
            }
            ServerMessage::Pause => {
                tracing::info!("Hub requested pause; capture continues locally, uplink unaffected");
            }
            ServerMessage::Resume => {
                tracing::info!("Hub requested resume");
            }
            ServerMessage::Registered { .. } | ServerMessage::Ack => {}
        }
        false
    }

    async fn send_batch(
        &self,
        write: &mut (impl futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
        batch: Vec<FlowEvent>,
    ) -> Result<()> {
        let count = batch.len() as u64;
        let msg = ClientMessage::FlowBatch { flows: batch };
        match send_with_timeout(write, Message::Text(serde_json::to_string(&msg)?)).await {
            Ok(()) => {
                self.stats.batches_sent.fetch_add(1, Ordering::Relaxed);
                self.stats.events_sent.fetch_add(count, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }
}

/// A stalled Hub write (e.g. a wedged TCP connection) must not block
/// capture indefinitely; a write that doesn't complete within
/// `WRITE_TIMEOUT` is treated the same as a send error (spec §5: "Uplink
/// operations use a 10 s write timeout").
async fn send_with_timeout(
    write: &mut (impl futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    message: Message,
) -> Result<()> {
    match tokio::time::timeout(WRITE_TIMEOUT, write.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => anyhow::bail!("Hub write timed out after {:?}", WRITE_TIMEOUT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_hub_peer_rejects_bad_url() {
        assert!(resolve_hub_peer("not a url").is_none());
    }

    #[test]
    fn test_feedback_filter_none_without_pod_ip() {
        assert!(compose_feedback_filter(None, "ws://hub.podscope.svc:7000/ingress").is_none());
    }

    #[test]
    fn test_feedback_filter_falls_back_to_port_only_when_host_unresolvable() {
        let pod_ip: Ipv4Addr = "10.1.2.3".parse().unwrap();
        let expr = compose_feedback_filter(Some(pod_ip), "ws://unresolvable.invalid:7000/ingress").unwrap();
        assert_eq!(expr, "not (tcp and host 10.1.2.3 and port 7000)");
    }

    #[test]
    fn test_feedback_filter_falls_back_to_pod_ip_only_when_port_unknown() {
        let pod_ip: Ipv4Addr = "10.1.2.3".parse().unwrap();
        let expr = compose_feedback_filter(Some(pod_ip), "not a url").unwrap();
        assert_eq!(expr, "not (tcp and host 10.1.2.3)");
    }

    #[test]
    fn test_uplink_stats_snapshot() {
        let stats = UplinkStats::default();
        stats.batches_sent.fetch_add(3, Ordering::Relaxed);
        stats.events_sent.fetch_add(120, Ordering::Relaxed);
        let snap = stats.snapshot();
        assert_eq!(snap.batches_sent, 3);
        assert_eq!(snap.events_sent, 120);
        assert!(!snap.connected);
    }
}
