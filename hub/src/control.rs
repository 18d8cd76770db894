//! Control API — stats, BPF filter management, pause/resume, PCAP
//! reset/export, health, and the subscriber live-feed WebSocket (spec §4.9,
//! §6 "Hub HTTP control surface").
//!
//! Router composition follows the pack's `AppState` + `fn router(state) ->
//! Router` idiom (grounded on `ayaFlow`'s `api::router` and `cthulu`'s
//! `create_app`), reusing the agent's own small-axum-router style from its
//! metrics endpoint.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use pcap::{Capture, Linktype};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::fanout::{FlowDto, SubscriberMessage};
use crate::pcap_ring::{FrameTuple, PcapFilter};
use crate::protocol::FlowId;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/stats", get(get_stats))
        .route("/api/bpf-filter", get(get_bpf_filter).post(set_bpf_filter))
        .route("/api/bpf-filter/clear", post(clear_bpf_filter))
        .route("/api/pause", post(set_paused))
        .route("/api/pcap/reset", post(reset_pcap))
        .route("/api/pcap", get(export_pcap))
        .route("/api/pcap/{flow_id}", get(export_flow_pcap))
        .route("/api/health", get(health))
        .route("/metrics", get(metrics))
        .route("/ws", get(subscribe))
        .route("/ingress", get(crate::ingress::handle))
        .with_state(state)
}

/// Compile a BPF expression against an offline (dead) capture handle before
/// ever trusting it — same approach the agent uses client-side, now run
/// authoritatively on the Hub so invalid expressions never reach an agent.
fn validate_bpf(expr: &str) -> Result<(), String> {
    let cap = Capture::dead(Linktype::ETHERNET).map_err(|e| e.to_string())?;
    cap.compile(expr, true).map(|_| ()).map_err(|e| e.to_string())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    flow_count: usize,
    subscriber_count: usize,
    agent_count: usize,
    pcap_size: u64,
    pcap_full: bool,
    paused: bool,
    #[serde(rename = "currentBPF")]
    current_bpf: String,
}

async fn get_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let (current_bpf, _) = state.control.current();
    Json(StatsResponse {
        flow_count: state.flow_table.len(),
        subscriber_count: state.fanout.subscriber_count(),
        agent_count: state.agents.len(),
        pcap_size: state.pcap_ring.size_bytes(),
        pcap_full: state.pcap_ring.is_full(),
        paused: state.fanout.is_paused(),
        current_bpf,
    })
}

#[derive(Debug, Serialize)]
struct BpfFilterResponse {
    filter: String,
}

async fn get_bpf_filter(State(state): State<AppState>) -> Json<BpfFilterResponse> {
    let (filter, _) = state.control.current();
    Json(BpfFilterResponse { filter })
}

#[derive(Debug, Deserialize)]
struct SetBpfFilterRequest {
    filter: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

async fn set_bpf_filter(
    State(state): State<AppState>,
    Json(body): Json<SetBpfFilterRequest>,
) -> impl IntoResponse {
    match validate_bpf(&body.filter) {
        Ok(()) => {
            state.control.set(body.filter.clone());
            info!("BPF filter updated to '{}'", body.filter);
            (StatusCode::OK, Json(BpfFilterResponse { filter: body.filter })).into_response()
        }
        Err(e) => {
            warn!("Rejected invalid BPF filter '{}': {}", body.filter, e);
            (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: e })).into_response()
        }
    }
}

async fn clear_bpf_filter(State(state): State<AppState>) -> Json<BpfFilterResponse> {
    state.control.clear();
    let (filter, _) = state.control.current();
    Json(BpfFilterResponse { filter })
}

#[derive(Debug, Deserialize)]
struct SetPauseRequest {
    paused: bool,
}

#[derive(Debug, Serialize)]
struct PauseResponse {
    paused: bool,
}

async fn set_paused(State(state): State<AppState>, Json(body): Json<SetPauseRequest>) -> Json<PauseResponse> {
    state.fanout.set_paused(body.paused);
    Json(PauseResponse { paused: body.paused })
}

async fn reset_pcap(State(state): State<AppState>) -> StatusCode {
    state.pcap_ring.reset();
    StatusCode::OK
}

#[derive(Debug, Deserialize)]
struct PcapExportQuery {
    #[serde(default, rename = "onlyHTTP")]
    only_http: bool,
    #[serde(default, rename = "includeDNS")]
    include_dns: bool,
    #[serde(default, rename = "allPorts")]
    all_ports: bool,
    #[serde(default)]
    search: Option<String>,
}

impl From<PcapExportQuery> for PcapFilter {
    fn from(q: PcapExportQuery) -> Self {
        PcapFilter {
            only_http: q.only_http,
            include_dns: q.include_dns,
            all_ports: q.all_ports,
            search: q.search,
        }
    }
}

async fn export_pcap(State(state): State<AppState>, Query(query): Query<PcapExportQuery>) -> impl IntoResponse {
    let filter: PcapFilter = query.into();
    let bytes = state.pcap_ring.export(&filter, None);
    (
        [
            (header::CONTENT_TYPE, "application/vnd.tcpdump.pcap".to_string()),
            (header::CONTENT_DISPOSITION, "attachment; filename=\"podscope-capture.pcap\"".to_string()),
        ],
        bytes,
    )
}

async fn export_flow_pcap(
    State(state): State<AppState>,
    axum::extract::Path(flow_id): axum::extract::Path<String>,
) -> impl IntoResponse {
    let Ok(id) = u64::from_str_radix(flow_id.trim_start_matches("0x"), 16).or_else(|_| flow_id.parse::<u64>()) else {
        return (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: "malformed flow id".to_string() })).into_response();
    };
    let Some(record) = state.flow_table.get(FlowId(id)) else {
        return (StatusCode::NOT_FOUND, Json(ErrorResponse { error: "unknown flow id".to_string() })).into_response();
    };

    let tuple = FrameTuple {
        // The Flow Table only ever holds TCP flows (the agent's assembler
        // enforces this at ingest), and `record.protocol` is the
        // application-layer tag (TCP/HTTP/HTTPS/TLS), not a raw IP
        // protocol number — hardcode TCP for the PCAP 5-tuple match.
        protocol: Some(6),
        src_ip: Some(record.src_ip),
        dst_ip: Some(record.dst_ip),
        src_port: Some(record.src_port),
        dst_port: Some(record.dst_port),
    };
    let filter = PcapFilter { all_ports: true, ..Default::default() };
    let bytes = state.pcap_ring.export(&filter, Some(tuple));
    (
        [
            (header::CONTENT_TYPE, "application/vnd.tcpdump.pcap".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"flow-{}.pcap\"", flow_id)),
        ],
        bytes,
    )
        .into_response()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    session_id: String,
    timestamp: chrono::DateTime<Utc>,
    bpf_filter: String,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let (bpf_filter, _) = state.control.current();
    Json(HealthResponse {
        status: "ok",
        session_id: std::env::var("SESSION_ID").unwrap_or_else(|_| "unknown".to_string()),
        timestamp: Utc::now(),
        bpf_filter,
    })
}

async fn metrics(State(state): State<AppState>) -> String {
    state.metrics.render()
}

#[derive(Debug, Deserialize)]
struct SubscribeQuery {
    /// By default, flows tagged `isAgentTraffic` (the agent's own Hub
    /// connection) are suppressed from the live feed; pass `allPorts=true`
    /// to see them.
    #[serde(default, rename = "allPorts")]
    all_ports: bool,
}

async fn subscribe(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<SubscribeQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_subscriber(socket, state, query.all_ports))
}

fn filter_flows(flows: Vec<FlowDto>, all_ports: bool) -> Vec<FlowDto> {
    if all_ports {
        return flows;
    }
    flows.into_iter().filter(|f| !f.is_agent_traffic).collect()
}

async fn handle_subscriber(mut socket: WebSocket, state: AppState, all_ports: bool) {
    // Subscribe before snapshotting: any flow change racing the catchup
    // arrives as a (possibly redundant) later batch instead of being missed
    // entirely, since `broadcast::Receiver` only sees sends after it exists.
    let mut rx = state.fanout.subscribe();
    let flows: Vec<FlowDto> = state.flow_table.snapshot().iter().map(FlowDto::from).collect();
    let catchup = SubscriberMessage::Catchup { flows: filter_flows(flows, all_ports) };
    let Ok(text) = serde_json::to_string(&catchup) else { return };
    if socket.send(Message::Text(text)).await.is_err() {
        return;
    }

    state.metrics.subscribers_active.inc();

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            batch = rx.recv() => {
                match batch {
                    Ok(SubscriberMessage::Batch { flows }) => {
                        let flows = filter_flows(flows, all_ports);
                        if flows.is_empty() {
                            continue;
                        }
                        let msg = SubscriberMessage::Batch { flows };
                        let Ok(text) = serde_json::to_string(&msg) else { continue };
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Ok(msg @ SubscriberMessage::Catchup { .. }) => {
                        let Ok(text) = serde_json::to_string(&msg) else { continue };
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    state.metrics.subscribers_active.dec();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_bpf_accepts_simple_expression() {
        assert!(validate_bpf("tcp port 80").is_ok());
    }

    #[test]
    fn test_validate_bpf_rejects_garbage() {
        assert!(validate_bpf("tcp prt 80").is_err());
    }
}
