//! Network interface enumeration, backed by libpcap's device list

use anyhow::{bail, Context, Result};
use std::net::IpAddr;
use tracing::{info, warn};

/// Represents a network interface available for capture
#[derive(Debug, Clone)]
pub struct NetworkInterface {
    /// Interface name (e.g., "eth0")
    pub name: String,

    /// Human-readable description, if libpcap reports one
    pub description: Option<String>,

    /// IP addresses assigned to this interface
    pub ips: Vec<IpAddr>,

    /// Whether libpcap considers the interface usable (up, not disconnected)
    pub is_up: bool,

    /// Whether the interface is a loopback
    pub is_loopback: bool,
}

impl NetworkInterface {
    /// Get a network interface by name
    pub fn by_name(name: &str) -> Result<Self> {
        Self::list_all()
            .into_iter()
            .find(|i| i.name == name)
            .with_context(|| format!("Interface '{}' not found", name))
    }

    /// Get all available network interfaces
    pub fn list_all() -> Vec<Self> {
        match pcap::Device::list() {
            Ok(devices) => devices.into_iter().map(Self::from_pcap).collect(),
            Err(e) => {
                warn!("Failed to list capture devices: {}", e);
                Vec::new()
            }
        }
    }

    fn from_pcap(device: pcap::Device) -> Self {
        let ips: Vec<IpAddr> = device.addresses.iter().map(|a| a.addr).collect();
        let flags = device.flags;

        Self {
            name: device.name,
            description: device.desc,
            ips,
            is_up: flags.is_up() && flags.is_running(),
            is_loopback: flags.is_loopback(),
        }
    }

    /// Check if the interface is valid for capture
    pub fn validate_for_capture(&self) -> Result<()> {
        if !self.is_up {
            bail!("Interface '{}' is not up", self.name);
        }

        if self.is_loopback {
            warn!("Interface '{}' is a loopback interface", self.name);
        }

        info!(
            "Interface '{}' validated: IPs={:?}",
            self.name, self.ips
        );

        Ok(())
    }
}

/// Print information about all interfaces
pub fn print_interfaces() {
    println!("Available network interfaces:");
    println!("{:-<60}", "");

    for iface in NetworkInterface::list_all() {
        let status = if iface.is_up { "UP" } else { "DOWN" };
        let loopback = if iface.is_loopback { " (loopback)" } else { "" };

        println!(
            "{}: {}[{}{}]",
            iface.name,
            iface.description.as_deref().unwrap_or(""),
            status,
            loopback
        );

        for ip in &iface.ips {
            println!("    {}", ip);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_interfaces_does_not_panic() {
        // libpcap may require privileges in some test environments; this
        // merely asserts the call completes without panicking.
        let _ = NetworkInterface::list_all();
    }
}
