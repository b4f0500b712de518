//! Prometheus metrics for the gateway.

use std::time::Duration;

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder};

/// Latency buckets in seconds; LLM calls range from sub-second to minutes.
const LATENCY_BUCKETS: &[f64] = &[0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];

pub struct Metrics {
    registry: Registry,
    requests: IntCounterVec,
    generation_seconds: Histogram,
    first_token_seconds: Histogram,
    last_token_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new("llm_gateway_requests_total", "Gateway requests by endpoint and outcome"),
            &["endpoint", "outcome"],
        )?;
        let generation_seconds = latency_histogram(
            "llm_gateway_generation_seconds",
            "Synchronous generation latency",
        )?;
        let first_token_seconds = latency_histogram(
            "llm_gateway_time_to_first_token_seconds",
            "Time from stream start to the first chunk",
        )?;
        let last_token_seconds = latency_histogram(
            "llm_gateway_time_to_last_token_seconds",
            "Time from stream start to the end-of-sequence chunk",
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(generation_seconds.clone()))?;
        registry.register(Box::new(first_token_seconds.clone()))?;
        registry.register(Box::new(last_token_seconds.clone()))?;

        Ok(Self {
            registry,
            requests,
            generation_seconds,
            first_token_seconds,
            last_token_seconds,
        })
    }

    pub fn record_request(&self, endpoint: &str, outcome: &str) {
        self.requests.with_label_values(&[endpoint, outcome]).inc();
    }

    pub fn request_count(&self, endpoint: &str, outcome: &str) -> u64 {
        self.requests.with_label_values(&[endpoint, outcome]).get()
    }

    pub fn observe_generation(&self, elapsed: Duration) {
        self.generation_seconds.observe(elapsed.as_secs_f64());
    }

    pub fn observe_first_token(&self, elapsed: Duration) {
        self.first_token_seconds.observe(elapsed.as_secs_f64());
    }

    pub fn observe_last_token(&self, elapsed: Duration) {
        self.last_token_seconds.observe(elapsed.as_secs_f64());
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn latency_histogram(name: &str, help: &str) -> Result<Histogram, prometheus::Error> {
    Histogram::with_opts(HistogramOpts::new(name, help).buckets(LATENCY_BUCKETS.to_vec()))
}
