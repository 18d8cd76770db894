//! Configuration module for the PodScope Hub

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub flow_table: FlowTableConfig,
    #[serde(default)]
    pub pcap_ring: PcapRingConfig,
    #[serde(default)]
    pub fanout: FanoutConfig,
    pub logging: LoggingConfig,
}

/// Bind address and the agent-facing ingress port, used both to accept
/// connections and to recognize (and by default exclude from exports) the
/// agents' own control traffic.
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_agent_ingress_port")]
    pub agent_ingress_port: u16,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            agent_ingress_port: default_agent_ingress_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlowTableConfig {
    /// Maximum number of concurrently tracked flows before the
    /// least-recently-updated one is evicted.
    #[serde(default = "default_flow_table_capacity")]
    pub capacity: usize,
}

impl Default for FlowTableConfig {
    fn default() -> Self {
        Self { capacity: default_flow_table_capacity() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PcapRingConfig {
    #[serde(default = "default_pcap_ring_capacity_bytes")]
    pub capacity_bytes: u64,

    /// "drop" (default) or "rotate"
    #[serde(default = "default_pcap_full_policy")]
    pub full_policy: String,

    #[serde(default = "default_snap_length")]
    pub snap_length: u32,
}

impl Default for PcapRingConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: default_pcap_ring_capacity_bytes(),
            full_policy: default_pcap_full_policy(),
            snap_length: default_snap_length(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FanoutConfig {
    /// Minimum interval between coalesced batch deliveries to subscribers.
    #[serde(default = "default_coalesce_interval_ms")]
    pub coalesce_interval_ms: u64,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self { coalesce_interval_ms: default_coalesce_interval_ms() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub file: Option<String>,

    #[serde(default = "default_true")]
    pub stdout: bool,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_bind_address() -> String { "0.0.0.0:7000".to_string() }
fn default_agent_ingress_port() -> u16 { 7000 }
fn default_flow_table_capacity() -> usize { 10_000 }
fn default_pcap_ring_capacity_bytes() -> u64 { 256 * 1024 * 1024 }
fn default_pcap_full_policy() -> String { "drop".to_string() }
fn default_snap_length() -> u32 { 65535 }
fn default_coalesce_interval_ms() -> u64 { 100 }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "pretty".to_string() }
fn default_true() -> bool { true }

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        toml::from_str(&content).with_context(|| "Failed to parse configuration")
    }

    pub fn validate(&self) -> Result<()> {
        if self.hub.bind_address.is_empty() {
            anyhow::bail!("Hub bind address cannot be empty");
        }
        if self.flow_table.capacity < 1 {
            anyhow::bail!("Flow Table capacity must be at least 1");
        }
        if self.pcap_ring.capacity_bytes < 1024 {
            anyhow::bail!("PCAP ring capacity must be at least 1024 bytes");
        }
        if self.pcap_ring.full_policy != "drop" && self.pcap_ring.full_policy != "rotate" {
            anyhow::bail!("pcap_ring.full_policy must be 'drop' or 'rotate'");
        }
        if self.fanout.coalesce_interval_ms < 1 {
            anyhow::bail!("fanout.coalesce_interval_ms must be at least 1");
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
[hub]
bind_address = "0.0.0.0:7000"
agent_ingress_port = 7000

[flow_table]
capacity = 5000

[logging]
level = "debug"
stdout = true
format = "pretty"
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.flow_table.capacity, 5000);
        assert_eq!(config.pcap_ring.full_policy, "drop");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_full_policy() {
        let toml_content = r#"
[pcap_ring]
full_policy = "nonsense"

[logging]
level = "info"
"#;
        let config: Config = toml::from_str(toml_content).unwrap();
        assert!(config.validate().is_err());
    }
}
