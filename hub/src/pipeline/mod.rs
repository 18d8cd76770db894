//! Pipeline — wires the Flow Table, PCAP Ring, Fan-out Hub, and Control API
//! into one running Hub process, and owns the shutdown broadcast.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::app_state::{AgentRegistry, AppState, ControlState};
use crate::config::Config;
use crate::control;
use crate::fanout::FanoutHub;
use crate::flow_table::FlowTable;
use crate::metrics::Metrics;
use crate::pcap_ring::{FullPolicy, PcapRing};

pub struct Pipeline {
    config: Config,
    state: AppState,
    shutdown_tx: broadcast::Sender<()>,
}

impl Pipeline {
    pub fn new(config: Config) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(4);

        let full_policy = if config.pcap_ring.full_policy == "rotate" {
            FullPolicy::RotateTail
        } else {
            FullPolicy::DropNewest
        };
        let default_bpf = format!("not (tcp port {})", config.hub.agent_ingress_port);

        let state = AppState {
            flow_table: Arc::new(FlowTable::new(config.flow_table.capacity)),
            pcap_ring: Arc::new(PcapRing::new(
                config.pcap_ring.capacity_bytes,
                config.pcap_ring.snap_length,
                full_policy,
                config.hub.agent_ingress_port,
            )),
            fanout: Arc::new(FanoutHub::new()),
            control: Arc::new(ControlState::new(default_bpf)),
            metrics: Arc::new(Metrics::new().context("failed to initialize metrics")?),
            agents: Arc::new(AgentRegistry::new()),
            agent_ingress_port: config.hub.agent_ingress_port,
            start_time: chrono::Utc::now(),
        };

        Ok(Self { config, state, shutdown_tx })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Run the HTTP/WS server and the fan-out coalescing ticker until a
    /// shutdown signal arrives.
    pub async fn run(&self) -> Result<()> {
        let addr: SocketAddr = self
            .config
            .hub
            .bind_address
            .parse()
            .with_context(|| format!("invalid bind address: {}", self.config.hub.bind_address))?;

        let router = control::router(self.state.clone());
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        info!("Hub listening on {}", addr);

        let mut server_shutdown = self.shutdown_tx.subscribe();
        let server = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
                let _ = server_shutdown.recv().await;
            });
            if let Err(e) = serve.await {
                error!("Hub HTTP server error: {}", e);
            }
        });

        let fanout = Arc::clone(&self.state.fanout);
        let interval = Duration::from_millis(self.config.fanout.coalesce_interval_ms);
        let mut fanout_shutdown = self.shutdown_tx.subscribe();
        let fanout_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = fanout_shutdown.recv() => break,
                    _ = ticker.tick() => fanout.flush(),
                }
            }
        });

        let _ = server.await;
        fanout_task.abort();

        Ok(())
    }
}
