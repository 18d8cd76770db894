//! Configuration module for the PodScope agent

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub capture: CaptureConfig,
    pub hub: HubConfig,
    #[serde(default)]
    pub flow: FlowConfig,
    #[serde(default)]
    pub decode: DecodeConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Capture settings
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Interface to capture on inside the pod's network namespace
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Ring buffer size (number of frames) between the capture thread and
    /// the flow assembler
    #[serde(default = "default_ring_buffer_size")]
    pub ring_buffer_size: usize,

    /// Maximum frame size to capture
    #[serde(default = "default_snap_length")]
    pub snap_length: i32,

    /// Capture in promiscuous mode
    #[serde(default = "default_true")]
    pub promiscuous: bool,

    /// Initial BPF filter expression, empty string means "capture everything"
    #[serde(default)]
    pub bpf_filter: String,
}

/// Hub uplink settings
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Hub WebSocket address, e.g. "ws://podscope-hub:7000/ingress"
    #[serde(default = "default_hub_address")]
    pub address: String,

    /// Maximum FlowEvents per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Flush interval in milliseconds, used as the upper bound on batch
    /// coalescing even when the batch hasn't filled up
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Initial reconnect backoff in milliseconds
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,

    /// Maximum reconnect backoff in milliseconds
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

/// Flow assembler settings
#[derive(Debug, Clone, Deserialize)]
pub struct FlowConfig {
    /// Bounded out-of-order reassembly window, per direction, in bytes
    #[serde(default = "default_reorder_window")]
    pub reorder_window_bytes: usize,

    /// How long to wait for a reassembly gap to close before giving up on it
    #[serde(default = "default_gap_timeout")]
    pub gap_timeout_secs: u64,

    /// Flow idle timeout before it transitions to TIMEOUT
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Whether the "larger port number is the connection initiator" source
    /// heuristic applies when capture starts mid-connection
    #[serde(default = "default_true")]
    pub mid_connection_source_heuristic: bool,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            reorder_window_bytes: default_reorder_window(),
            gap_timeout_secs: default_gap_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            mid_connection_source_heuristic: true,
        }
    }
}

/// Protocol decoder settings
#[derive(Debug, Clone, Deserialize)]
pub struct DecodeConfig {
    /// Maximum bytes of HTTP header block to inspect per exchange
    #[serde(default = "default_max_http_header_bytes")]
    pub max_http_header_bytes: usize,

    /// Maximum bytes of request/response body to retain per direction
    #[serde(default = "default_max_http_body_bytes")]
    pub max_http_body_bytes: usize,

    /// Maximum bytes of a TLS ClientHello/ServerHello to inspect
    #[serde(default = "default_max_tls_hello_bytes")]
    pub max_tls_hello_bytes: usize,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            max_http_header_bytes: default_max_http_header_bytes(),
            max_http_body_bytes: default_max_http_body_bytes(),
            max_tls_hello_bytes: default_max_tls_hello_bytes(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path
    #[serde(default)]
    pub file: Option<String>,

    /// Log to stdout
    #[serde(default = "default_true")]
    pub stdout: bool,

    /// Log format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Metrics configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MetricsConfig {
    /// Enable metrics endpoint
    #[serde(default)]
    pub enabled: bool,

    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub port: u16,

    /// Metrics path
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

// Default value functions
fn default_interface() -> String { "eth0".to_string() }
fn default_ring_buffer_size() -> usize { 8192 }
fn default_snap_length() -> i32 { 65535 }
fn default_hub_address() -> String { "ws://localhost:7000/ingress".to_string() }
fn default_batch_size() -> usize { 200 }
fn default_flush_interval() -> u64 { 200 }
fn default_heartbeat_interval() -> u64 { 5000 }
fn default_reconnect_initial_ms() -> u64 { 500 }
fn default_reconnect_max_ms() -> u64 { 30_000 }
fn default_reorder_window() -> usize { 65536 }
fn default_gap_timeout() -> u64 { 1 }
fn default_idle_timeout() -> u64 { 300 }
fn default_max_http_header_bytes() -> usize { 16384 }
fn default_max_http_body_bytes() -> usize { 8192 }
fn default_max_tls_hello_bytes() -> usize { 16384 }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "pretty".to_string() }
fn default_true() -> bool { true }
fn default_metrics_port() -> u16 { 9100 }
fn default_metrics_path() -> String { "/metrics".to_string() }

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        toml::from_str(&content).with_context(|| "Failed to parse configuration")
    }

    /// Apply the environment variables the agent consumes (spec §6): `HUB_ADDRESS`
    /// and `INTERFACE` override their file-config counterparts when set.
    /// `POD_NAME`, `POD_NAMESPACE`, `POD_IP` and `SESSION_ID` carry runtime
    /// identity rather than tunables, so they're read directly where needed
    /// (`main`) instead of living on `Config`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(address) = std::env::var("HUB_ADDRESS") {
            if !address.is_empty() {
                self.hub.address = address;
            }
        }
        if let Ok(interface) = std::env::var("INTERFACE") {
            if !interface.is_empty() {
                self.capture.interface = interface;
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.capture.interface.is_empty() {
            anyhow::bail!("Capture interface cannot be empty");
        }

        if self.capture.snap_length < 64 {
            anyhow::bail!("Snap length must be at least 64");
        }

        if self.hub.address.is_empty() {
            anyhow::bail!("Hub address cannot be empty");
        }

        if self.flow.reorder_window_bytes < 1024 {
            anyhow::bail!("Reorder window must be at least 1024 bytes");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml_content = r#"
[capture]
interface = "eth0"
ring_buffer_size = 4096
snap_length = 4096

[hub]
address = "ws://hub.podscope.svc:7000/ingress"
batch_size = 100
flush_interval_ms = 150

[logging]
level = "debug"
stdout = true
format = "pretty"
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.capture.interface, "eth0");
        assert_eq!(config.hub.batch_size, 100);
        assert!(config.flow.mid_connection_source_heuristic);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides_hub_address_and_interface() {
        let toml_content = r#"
[capture]
interface = "eth0"

[hub]
address = "ws://default:7000/ingress"

[logging]
level = "info"
"#;
        let mut config: Config = toml::from_str(toml_content).unwrap();

        std::env::set_var("HUB_ADDRESS", "ws://override:7000/ingress");
        std::env::set_var("INTERFACE", "eth1");
        config.apply_env_overrides();
        std::env::remove_var("HUB_ADDRESS");
        std::env::remove_var("INTERFACE");

        assert_eq!(config.hub.address, "ws://override:7000/ingress");
        assert_eq!(config.capture.interface, "eth1");
    }

    #[test]
    fn test_invalid_interface() {
        let toml_content = r#"
[capture]
interface = ""

[hub]
address = "ws://hub:7000/ingress"

[logging]
level = "info"
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert!(config.validate().is_err());
    }
}
