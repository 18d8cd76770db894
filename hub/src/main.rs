//! PodScope Hub — central aggregator for per-pod capture agents.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use podscope_hub::config::Config;
use podscope_hub::Pipeline;

#[derive(Parser, Debug)]
#[command(name = "podscope-hub")]
#[command(author = "PodScope")]
#[command(version)]
#[command(about = "PodScope Hub: agent ingress, flow table, PCAP ring, fan-out and control API", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/podscope/hub.toml")]
    config: PathBuf,

    /// Run in debug mode (verbose logging)
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    config.validate()?;

    setup_logging(&config, args.debug)?;

    info!("PodScope Hub starting, binding {}", config.hub.bind_address);
    info!(
        "Flow Table capacity: {}, PCAP ring: {} bytes ({})",
        config.flow_table.capacity, config.pcap_ring.capacity_bytes, config.pcap_ring.full_policy
    );

    let pipeline = Arc::new(Pipeline::new(config)?);

    let shutdown_pipeline = Arc::clone(&pipeline);
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        shutdown_pipeline.shutdown();
    })
    .context("Failed to set Ctrl+C handler")?;

    pipeline.run().await?;

    info!("PodScope Hub stopped");
    Ok(())
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
        .add_directive(format!("podscope_hub={}", level).parse().unwrap())
        .add_directive("tungstenite=warn".parse().unwrap())
        .add_directive("tokio_tungstenite=warn".parse().unwrap())
        .add_directive("axum=warn".parse().unwrap());

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.logging.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().with_target(true)).init();
    }

    Ok(())
}
