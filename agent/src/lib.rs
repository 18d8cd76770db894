//! PodScope Agent
//!
//! Per-pod sidecar: captures raw traffic from a pod's network namespace,
//! reassembles TCP flows, decodes HTTP/TLS metadata, and streams flow
//! records and PCAP data to the Hub.

pub mod capture;
pub mod config;
pub mod decode;
pub mod error;
pub mod flow;
pub mod metrics;
pub mod pcap_chunk;
pub mod uplink;

pub use config::Config;
pub use error::{AgentError, Kind};
