// src/metrics/collector.rs
use anyhow::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

pub struct MetricsRegistry {
    registry: Registry,
    collector: Arc<MetricsCollector>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let collector = Arc::new(MetricsCollector::new(&registry)?);

        Ok(Self {
            registry,
            collector,
        })
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    pub fn gather(&self) -> Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

pub struct MetricsCollector {
    // Inbound metrics
    pub requests_total: IntCounterVec,
    pub request_duration_seconds: HistogramVec,

    // Upstream metrics
    pub upstream_requests_total: IntCounterVec,
    pub upstream_request_duration_seconds: HistogramVec,
    pub upstream_active_requests: IntGaugeVec,
    pub pool_servers: IntGaugeVec,

    // Filter metrics
    pub filter_failures_total: IntCounterVec,
}

impl MetricsCollector {
    pub fn new(registry: &Registry) -> Result<Self> {
        let requests_total = IntCounterVec::new(
            Opts::new("gateway_requests_total", "Total number of inbound requests"),
            &["method", "status_code"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "gateway_request_duration_seconds",
                "Inbound request duration in seconds",
            ),
            &["method", "status_code"],
        )?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        let upstream_requests_total = IntCounterVec::new(
            Opts::new("upstream_requests_total", "Total outbound dispatch attempts"),
            &["target", "server", "outcome"],
        )?;
        registry.register(Box::new(upstream_requests_total.clone()))?;

        let upstream_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "upstream_request_duration_seconds",
                "Outbound call duration until response headers",
            ),
            &["target"],
        )?;
        registry.register(Box::new(upstream_request_duration_seconds.clone()))?;

        let upstream_active_requests = IntGaugeVec::new(
            Opts::new("upstream_active_requests", "In-flight outbound calls"),
            &["target", "server"],
        )?;
        registry.register(Box::new(upstream_active_requests.clone()))?;

        let pool_servers = IntGaugeVec::new(
            Opts::new("pool_servers", "Servers currently in a target's pool"),
            &["target"],
        )?;
        registry.register(Box::new(pool_servers.clone()))?;

        let filter_failures_total = IntCounterVec::new(
            Opts::new("filter_failures_total", "Filter executions that failed"),
            &["filter"],
        )?;
        registry.register(Box::new(filter_failures_total.clone()))?;

        Ok(Self {
            requests_total,
            request_duration_seconds,
            upstream_requests_total,
            upstream_request_duration_seconds,
            upstream_active_requests,
            pool_servers,
            filter_failures_total,
        })
    }

    pub fn record_request(&self, method: &str, status_code: u16, duration: Duration) {
        let status = status_code.to_string();
        self.requests_total
            .with_label_values(&[method, &status])
            .inc();

        self.request_duration_seconds
            .with_label_values(&[method, &status])
            .observe(duration.as_secs_f64());
    }

    pub fn record_upstream(&self, target: &str, server: &str, outcome: &str, duration: Duration) {
        self.upstream_requests_total
            .with_label_values(&[target, server, outcome])
            .inc();

        self.upstream_request_duration_seconds
            .with_label_values(&[target])
            .observe(duration.as_secs_f64());
    }

    pub fn update_upstream_active(&self, target: &str, server: &str, count: u64) {
        self.upstream_active_requests
            .with_label_values(&[target, server])
            .set(count as i64);
    }

    pub fn update_pool_size(&self, target: &str, servers: usize) {
        self.pool_servers
            .with_label_values(&[target])
            .set(servers as i64);
    }

    pub fn record_filter_failure(&self, filter: &str) {
        self.filter_failures_total
            .with_label_values(&[filter])
            .inc();
    }
}
