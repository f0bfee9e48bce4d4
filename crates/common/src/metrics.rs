//! Metrics collection for the TRT-LLM client
//!
//! This module provides Prometheus metrics for observability.
//! Counters are touched from the stream delivery path, so every metric here is
//! a plain atomic update with no allocation.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for the client
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub client: ClientMetrics,
}

/// Client-side request and stream metrics
#[derive(Debug, Clone)]
pub struct ClientMetrics {
    /// Total number of generation calls (streaming and batch)
    pub requests_total: IntCounter,

    /// Total number of generation calls that ended in an error
    pub requests_failed: IntCounter,

    /// Batch request duration histogram
    pub request_duration: Histogram,

    /// Streams opened against the server
    pub streams_opened: IntCounter,

    /// Streams currently open
    pub active_streams: IntGauge,

    /// Chunks delivered to stream consumers
    pub tokens_streamed: IntCounter,

    /// Streams that terminated with a transport or decode error
    pub stream_errors: IntCounter,

    /// Streams closed before the server finished
    pub stream_cancellations: IntCounter,

    /// Time spent waiting for a model to become ready
    pub model_ready_wait: Histogram,

    /// Generated tokens per second for completed generations
    pub tokens_per_second: Histogram,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let metric = IntCounter::new(name, help).expect("static metric definition is valid");
    register(registry, &metric);
    metric
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let metric = IntGauge::new(name, help).expect("static metric definition is valid");
    register(registry, &metric);
    metric
}

fn histogram(registry: &Registry, name: &str, help: &str, buckets: Vec<f64>) -> Histogram {
    let metric = Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))
        .expect("static metric definition is valid");
    register(registry, &metric);
    metric
}

fn register<M>(registry: &Registry, metric: &M)
where
    M: prometheus::core::Collector + Clone + 'static,
{
    // A fresh registry never holds duplicates
    let _ = registry.register(Box::new(metric.clone()));
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let client = ClientMetrics {
            requests_total: counter(
                &registry,
                "trtllm_requests_total",
                "Total number of generation requests",
            ),
            requests_failed: counter(
                &registry,
                "trtllm_requests_failed_total",
                "Total number of failed generation requests",
            ),
            request_duration: histogram(
                &registry,
                "trtllm_request_duration_seconds",
                "Batch request duration in seconds",
                vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0],
            ),
            streams_opened: counter(
                &registry,
                "trtllm_streams_opened_total",
                "Total number of streams opened",
            ),
            active_streams: gauge(
                &registry,
                "trtllm_active_streams",
                "Current number of open streams",
            ),
            tokens_streamed: counter(
                &registry,
                "trtllm_tokens_streamed_total",
                "Total number of chunks delivered to stream consumers",
            ),
            stream_errors: counter(
                &registry,
                "trtllm_stream_errors_total",
                "Total number of streams that failed mid-generation",
            ),
            stream_cancellations: counter(
                &registry,
                "trtllm_stream_cancellations_total",
                "Total number of streams closed before completion",
            ),
            model_ready_wait: histogram(
                &registry,
                "trtllm_model_ready_wait_seconds",
                "Time spent waiting for a model to report ready",
                vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0],
            ),
            tokens_per_second: histogram(
                &registry,
                "trtllm_tokens_per_second",
                "Tokens generated per second",
                vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0],
            ),
        };

        MetricsRegistry { registry, client }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            return format!("# failed to encode metrics: {}\n", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry() {
        let metrics = MetricsRegistry::new();

        metrics.client.requests_total.inc();
        metrics.client.active_streams.inc();
        metrics.client.tokens_streamed.inc_by(3);

        let output = metrics.gather();
        assert!(output.contains("trtllm_requests_total 1"));
        assert!(output.contains("trtllm_active_streams 1"));
        assert!(output.contains("trtllm_tokens_streamed_total 3"));
    }
}
