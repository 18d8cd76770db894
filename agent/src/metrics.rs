//! Prometheus metrics endpoint, served over a small axum router.

use axum::{routing::get, Router};
use prometheus::{IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

pub struct Metrics {
    pub registry: Registry,
    pub packets_captured_total: IntCounter,
    pub packets_dropped_total: IntCounter,
    pub bytes_captured_total: IntCounter,
    pub flows_active: IntGauge,
    pub flow_events_sent_total: IntCounter,
    pub uplink_reconnects_total: IntCounter,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let packets_captured_total =
            IntCounter::new("podscope_agent_packets_captured_total", "Packets captured")?;
        let packets_dropped_total =
            IntCounter::new("podscope_agent_packets_dropped_total", "Packets dropped due to backpressure")?;
        let bytes_captured_total =
            IntCounter::new("podscope_agent_bytes_captured_total", "Bytes captured")?;
        let flows_active = IntGauge::new("podscope_agent_flows_active", "Currently tracked flows")?;
        let flow_events_sent_total =
            IntCounter::new("podscope_agent_flow_events_sent_total", "FlowEvents sent to the Hub")?;
        let uplink_reconnects_total =
            IntCounter::new("podscope_agent_uplink_reconnects_total", "Hub uplink reconnect attempts")?;

        registry.register(Box::new(packets_captured_total.clone()))?;
        registry.register(Box::new(packets_dropped_total.clone()))?;
        registry.register(Box::new(bytes_captured_total.clone()))?;
        registry.register(Box::new(flows_active.clone()))?;
        registry.register(Box::new(flow_events_sent_total.clone()))?;
        registry.register(Box::new(uplink_reconnects_total.clone()))?;

        Ok(Self {
            registry,
            packets_captured_total,
            packets_dropped_total,
            bytes_captured_total,
            flows_active,
            flow_events_sent_total,
            uplink_reconnects_total,
        })
    }

    fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode_to_string(&metric_families).unwrap_or_default()
    }
}

async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<Arc<Metrics>>,
) -> String {
    metrics.render()
}

pub fn router(metrics: Arc<Metrics>, path: &str) -> Router {
    Router::new().route(path, get(metrics_handler)).with_state(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render_includes_registered_names() {
        let metrics = Metrics::new().unwrap();
        metrics.packets_captured_total.inc_by(5);
        let rendered = metrics.render();
        assert!(rendered.contains("podscope_agent_packets_captured_total"));
        assert!(rendered.contains('5'));
    }
}
