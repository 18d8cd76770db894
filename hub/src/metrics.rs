//! Prometheus metrics, served over the same axum router as the control API.
//!
//! Same shape as the agent's `metrics` module: a `Registry` plus a handful
//! of `IntCounter`/`IntGauge` fields, rendered with `TextEncoder`.

use prometheus::{IntCounter, IntGauge, Registry, TextEncoder};

pub struct Metrics {
    pub registry: Registry,
    pub flow_events_received_total: IntCounter,
    pub flow_events_rejected_total: IntCounter,
    pub pcap_bytes_received_total: IntCounter,
    pub flows_active: IntGauge,
    pub flows_evicted_total: IntCounter,
    pub subscribers_active: IntGauge,
    pub agents_connected: IntGauge,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let flow_events_received_total =
            IntCounter::new("podscope_hub_flow_events_received_total", "FlowEvents accepted from agents")?;
        let flow_events_rejected_total =
            IntCounter::new("podscope_hub_flow_events_rejected_total", "FlowEvents rejected by validation")?;
        let pcap_bytes_received_total =
            IntCounter::new("podscope_hub_pcap_bytes_received_total", "Raw PCAP bytes appended to the ring")?;
        let flows_active = IntGauge::new("podscope_hub_flows_active", "Flows currently tracked in the Flow Table")?;
        let flows_evicted_total =
            IntCounter::new("podscope_hub_flows_evicted_total", "Flows evicted from the Flow Table due to capacity")?;
        let subscribers_active = IntGauge::new("podscope_hub_subscribers_active", "Connected live subscribers")?;
        let agents_connected = IntGauge::new("podscope_hub_agents_connected", "Connected capture agents")?;

        registry.register(Box::new(flow_events_received_total.clone()))?;
        registry.register(Box::new(flow_events_rejected_total.clone()))?;
        registry.register(Box::new(pcap_bytes_received_total.clone()))?;
        registry.register(Box::new(flows_active.clone()))?;
        registry.register(Box::new(flows_evicted_total.clone()))?;
        registry.register(Box::new(subscribers_active.clone()))?;
        registry.register(Box::new(agents_connected.clone()))?;

        Ok(Self {
            registry,
            flow_events_received_total,
            flow_events_rejected_total,
            pcap_bytes_received_total,
            flows_active,
            flows_evicted_total,
            subscribers_active,
            agents_connected,
        })
    }

    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode_to_string(&metric_families).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render_includes_registered_names() {
        let metrics = Metrics::new().unwrap();
        metrics.flow_events_received_total.inc_by(3);
        let rendered = metrics.render();
        assert!(rendered.contains("podscope_hub_flow_events_received_total"));
        assert!(rendered.contains('3'));
    }
}
