use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

pub struct MetricsCollector {
    registry: Registry,

    // Request metrics
    pub requests_total: CounterVec,
    pub request_duration: HistogramVec,

    // Decision metrics
    pub decisions_total: CounterVec,
    pub budget_utilization: GaugeVec,
    pub circuit_breaker_state: GaugeVec,

    // Spend path metrics
    pub spend_tracked_cents: Counter,
    pub degraded_mode: Gauge,
}

impl MetricsCollector {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            Opts::new("pacer_requests_total", "Total number of HTTP requests"),
            &["endpoint", "method", "status"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "pacer_request_duration_seconds",
                "Duration of HTTP requests",
            ),
            &["endpoint", "method"],
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        let decisions_total = CounterVec::new(
            Opts::new("pacer_decisions_total", "Pacing decisions by outcome"),
            &["reason"],
        )?;
        registry.register(Box::new(decisions_total.clone()))?;

        let budget_utilization = GaugeVec::new(
            Opts::new(
                "pacer_budget_utilization_percentage",
                "Current budget utilization percentage",
            ),
            &["campaign_id"],
        )?;
        registry.register(Box::new(budget_utilization.clone()))?;

        let circuit_breaker_state = GaugeVec::new(
            Opts::new(
                "pacer_circuit_breaker_state",
                "Circuit breaker state (0=closed, 1=open, 2=half-open)",
            ),
            &["campaign_id"],
        )?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        let spend_tracked_cents = Counter::new(
            "pacer_spend_tracked_cents_total",
            "Total spend reported through /spend/track, in cents",
        )?;
        registry.register(Box::new(spend_tracked_cents.clone()))?;

        let degraded_mode = Gauge::new(
            "pacer_degraded_mode",
            "1 while decisions are served from the in-process fallback cache",
        )?;
        registry.register(Box::new(degraded_mode.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration,
            decisions_total,
            budget_utilization,
            circuit_breaker_state,
            spend_tracked_cents,
            degraded_mode,
        })
    }

    pub fn encode(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics collector")
    }
}

pub struct MetricsHandler {
    collector: Arc<MetricsCollector>,
}

impl MetricsHandler {
    pub fn new(collector: Arc<MetricsCollector>) -> Self {
        Self { collector }
    }

    pub async fn metrics(&self) -> String {
        self.collector.encode().unwrap_or_else(|e| {
            tracing::error!("Failed to encode metrics: {}", e);
            String::from("# Error encoding metrics\n")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_collector_creation() {
        assert!(MetricsCollector::new().is_ok());
    }

    #[test]
    fn test_metrics_encoding() {
        let collector = MetricsCollector::new().unwrap();

        collector
            .requests_total
            .with_label_values(&["/pacing/decision", "POST", "200"])
            .inc();
        collector
            .decisions_total
            .with_label_values(&["throttled"])
            .inc();
        collector
            .budget_utilization
            .with_label_values(&["c1"])
            .set(42.5);

        let text = collector.encode().unwrap();
        assert!(text.contains("pacer_requests_total"));
        assert!(text.contains("pacer_decisions_total"));
        assert!(text.contains("pacer_budget_utilization_percentage"));
    }

    #[tokio::test]
    async fn test_metrics_handler() {
        let collector = Arc::new(MetricsCollector::new().unwrap());
        let handler = MetricsHandler::new(collector.clone());

        collector.spend_tracked_cents.inc_by(1500.0);

        let metrics = handler.metrics().await;
        assert!(metrics.contains("pacer_spend_tracked_cents_total"));
    }
}
