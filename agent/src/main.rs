//! PodScope Agent — ephemeral per-pod capture sidecar.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use podscope_agent::capture::{print_interfaces, CapturedFrame, PacketSource};
use podscope_agent::config::Config;
use podscope_agent::decode;
use podscope_agent::flow::FlowTable;
use podscope_agent::metrics::Metrics;
use podscope_agent::pcap_chunk::PcapChunker;
use podscope_agent::uplink::{resolve_hub_peer, AgentClient, UplinkOutcome};

#[derive(Parser, Debug)]
#[command(name = "podscope-agent")]
#[command(author = "PodScope")]
#[command(version)]
#[command(about = "Ephemeral per-pod capture sidecar for PodScope", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/podscope/agent.toml")]
    config: PathBuf,

    /// List available network interfaces and exit
    #[arg(long)]
    list_interfaces: bool,

    /// Run in debug mode (verbose logging)
    #[arg(short, long)]
    debug: bool,

    /// Capture and assemble flows but don't connect to the Hub
    #[arg(long)]
    dry_run: bool,

    /// Pod name to report to the Hub; defaults to the POD_NAME env var
    #[arg(long)]
    pod_name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.list_interfaces {
        print_interfaces();
        return Ok(());
    }

    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    config.apply_env_overrides();
    config.validate()?;

    setup_logging(&config, args.debug)?;

    let pod_name = args.pod_name.or_else(|| std::env::var("POD_NAME").ok());
    let pod_namespace = std::env::var("POD_NAMESPACE").ok();
    let pod_ip: Option<std::net::Ipv4Addr> =
        std::env::var("POD_IP").ok().and_then(|s| s.parse().ok());
    let session_id = std::env::var("SESSION_ID").ok();
    // Not in the spec's env var list; read via the standard Kubernetes
    // downward-API convention since AgentInfo needs a node name too.
    let node_name = std::env::var("NODE_NAME").ok();

    info!("PodScope Agent starting on interface '{}'", config.capture.interface);
    if let Some(ref name) = pod_name {
        info!("Reporting as pod '{}'{}", name, pod_namespace.as_deref().map(|ns| format!(" (namespace {})", ns)).unwrap_or_default());
    }
    if let Some(ref sid) = session_id {
        info!("Session id: {}", sid);
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(4);

    let metrics = Arc::new(Metrics::new().context("Failed to initialize metrics")?);
    let metrics_handle = if config.metrics.enabled {
        Some(spawn_metrics_server(&config, Arc::clone(&metrics), shutdown_tx.subscribe()))
    } else {
        None
    };

    let packet_source = Arc::new(
        PacketSource::new(
            &config.capture.interface,
            config.capture.promiscuous,
            config.capture.snap_length,
        )
        .context("Failed to open packet source")?,
    );

    let initial_filter = if !config.capture.bpf_filter.is_empty() {
        Some(config.capture.bpf_filter.clone())
    } else {
        match podscope_agent::uplink::compose_feedback_filter(pod_ip, &config.hub.address) {
            Some(expr) => Some(expr),
            None => {
                warn!("Pod IP unknown; capturing without a feedback-loop exclusion filter");
                None
            }
        }
    };
    if let Some(ref expr) = initial_filter {
        info!("Installing initial BPF filter: {}", expr);
        packet_source.set_bpf(expr).context("Invalid initial BPF filter")?;
    }

    let (capture_handle, raw_rx) = Arc::clone(&packet_source)
        .start_threaded(config.capture.ring_buffer_size)
        .context("Failed to start capture")?;

    // Bridge the capture thread's crossbeam channel into an async channel
    // of decoded frames, and fork raw bytes into a PCAP chunker on the side.
    let (frame_tx, frame_rx) = mpsc::channel::<CapturedFrame>(config.capture.ring_buffer_size);
    let (pcap_tx, pcap_rx) = mpsc::channel::<Vec<u8>>(64);
    let interface_name = config.capture.interface.clone();
    let pcap_flush_interval = std::time::Duration::from_millis(config.hub.flush_interval_ms);
    let snap_length = config.capture.snap_length;
    let bridge_handle = tokio::spawn(async move {
        let mut chunker = PcapChunker::new(snap_length.max(0) as u32);
        let mut last_flush = std::time::Instant::now();
        loop {
            match raw_rx.recv_timeout(pcap_flush_interval) {
                Ok(raw) => {
                    chunker.push(raw.timestamp, &raw.data);
                    match decode::parse_frame(&interface_name, &raw.data) {
                        Ok(mut frame) => {
                            frame.timestamp = raw.timestamp;
                            if frame_tx.send(frame).await.is_err() {
                                warn!("Frame channel closed");
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::debug!("Failed to decode frame: {}", e);
                        }
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }

            if last_flush.elapsed() >= pcap_flush_interval && !chunker.is_empty() {
                if let Some(chunk) = chunker.take() {
                    if pcap_tx.try_send(chunk).is_err() {
                        tracing::debug!("PCAP channel full or closed, dropping chunk");
                    }
                }
                last_flush = std::time::Instant::now();
            }
        }
    });

    let hub_peer = resolve_hub_peer(&config.hub.address);
    if hub_peer.is_none() {
        warn!("Could not resolve Hub address '{}' ahead of connecting", config.hub.address);
    }

    let (flow_tx, flow_rx) = mpsc::channel(config.hub.batch_size * 4);
    let flow_handle = spawn_flow_assembler(
        config.clone(),
        pod_name.clone(),
        hub_peer,
        frame_rx,
        flow_tx,
        Arc::clone(&metrics),
        shutdown_tx.subscribe(),
    );

    let running = Arc::new(std::sync::atomic::AtomicBool::new(true));

    let uplink_handle = if !args.dry_run {
        let client = AgentClient::new(
            config.hub.clone(),
            pod_name.clone(),
            pod_namespace.clone(),
            pod_ip,
            node_name.clone(),
            Arc::clone(&packet_source),
        );
        let uplink_shutdown = shutdown_tx.subscribe();
        let running_for_uplink = Arc::clone(&running);
        Some(tokio::spawn(async move {
            match client.run(flow_rx, pcap_rx, uplink_shutdown).await {
                Ok(UplinkOutcome::ShutdownRequested) => {}
                Ok(UplinkOutcome::HubDisconnected) => {
                    warn!("Hub disconnected; triggering agent shutdown");
                    running_for_uplink.store(false, std::sync::atomic::Ordering::SeqCst);
                }
                Err(e) => {
                    error!("Uplink error: {}", e);
                    running_for_uplink.store(false, std::sync::atomic::Ordering::SeqCst);
                }
            }
        }))
    } else {
        info!("Dry run mode - flow events will not be sent to the Hub");
        let mut rx = flow_rx;
        let mut pcap_rx = pcap_rx;
        Some(tokio::spawn(async move {
            let mut count = 0u64;
            loop {
                tokio::select! {
                    maybe_event = rx.recv() => {
                        match maybe_event {
                            Some(_) => count += 1,
                            None => break,
                        }
                    }
                    maybe_chunk = pcap_rx.recv() => {
                        if maybe_chunk.is_none() {
                            break;
                        }
                    }
                }
            }
            info!("Dry run: {} flow events observed", count);
        }))
    };

    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, std::sync::atomic::Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    while running.load(std::sync::atomic::Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }

    info!("Shutting down...");
    let _ = shutdown_tx.send(());
    packet_source.stop();

    let stats = packet_source.stats().snapshot();
    info!(
        "Final capture stats: packets={}, bytes={}, dropped={}, errors={}",
        stats.packets_captured, stats.bytes_captured, stats.packets_dropped, stats.parse_errors
    );

    let _ = capture_handle.join();
    bridge_handle.abort();
    flow_handle.abort();
    if let Some(h) = uplink_handle {
        let _ = h.await;
    }
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("PodScope Agent stopped");
    Ok(())
}

fn spawn_flow_assembler(
    config: Config,
    pod_name: Option<String>,
    hub_peer: Option<(std::net::Ipv4Addr, u16)>,
    mut frame_rx: mpsc::Receiver<CapturedFrame>,
    flow_tx: mpsc::Sender<podscope_agent::flow::FlowEvent>,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut table = FlowTable::new(config.flow.clone(), config.decode.clone(), pod_name);
        if let Some((ip, port)) = hub_peer {
            table.set_hub_peer(ip, port);
        }

        let mut sweep = tokio::time::interval(tokio::time::Duration::from_secs(5));

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                maybe_frame = frame_rx.recv() => {
                    match maybe_frame {
                        Some(frame) => table.ingest(&frame),
                        None => break,
                    }
                }
                _ = sweep.tick() => {
                    table.sweep(chrono::Utc::now());
                    metrics.flows_active.set(table.active_flow_count() as i64);
                }
            }

            for event in table.drain_events() {
                metrics.flow_events_sent_total.inc();
                if flow_tx.send(event).await.is_err() {
                    warn!("Flow event channel closed");
                    return;
                }
            }
        }
    })
}

fn spawn_metrics_server(
    config: &Config,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.metrics.port));
    let path = config.metrics.path.clone();

    tokio::spawn(async move {
        let router = podscope_agent::metrics::router(metrics, &path);
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
                    let _ = shutdown.recv().await;
                });
                if let Err(e) = serve.await {
                    error!("Metrics server error: {}", e);
                }
            }
            Err(e) => error!("Failed to bind metrics listener on {}: {}", addr, e),
        }
    })
}

fn setup_logging(config: &Config, debug: bool) -> Result<()> {
    let level = if debug {
        Level::DEBUG
    } else {
        match config.logging.level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" | "warning" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("podscope_agent={}", level).parse().unwrap())
        .add_directive("tungstenite=warn".parse().unwrap())
        .add_directive("tokio_tungstenite=warn".parse().unwrap());

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.logging.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().with_target(true)).init();
    }

    Ok(())
}
