//! Prometheus metrics recorder for the gateway.
//!
//! Metrics live in a gateway-owned registry so several routers (tests, CLI)
//! can coexist in one process. `/metrics` renders it in text format.

use prometheus::{
    histogram_opts, opts, CounterVec, Encoder, HistogramVec, IntCounterVec, Registry,
    TextEncoder,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::models::usage::TokenUsage;

pub struct GatewayMetrics {
    registry: Registry,
    requests_total: IntCounterVec,
    request_duration_seconds: HistogramVec,
    credits_deducted_total: CounterVec,
    upstream_failures_total: IntCounterVec,
    tokens_total: IntCounterVec,
}

impl GatewayMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            opts!("aiapi_requests_total", "Total number of API requests"),
            &["method", "status_code"],
        )?;
        let request_duration_seconds = HistogramVec::new(
            histogram_opts!(
                "aiapi_request_duration_seconds",
                "Request latency in seconds",
                // upstream AI calls dominate: 10ms to 120s
                vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
            ),
            &["method"],
        )?;
        let credits_deducted_total = CounterVec::new(
            opts!("aiapi_credits_deducted_total", "Credits deducted from user balances"),
            &["service"],
        )?;
        let upstream_failures_total = IntCounterVec::new(
            opts!("aiapi_upstream_failures_total", "Failed upstream service calls"),
            &["service"],
        )?;
        let tokens_total = IntCounterVec::new(
            opts!("aiapi_llm_tokens_total", "Chat completion tokens consumed"),
            &["type"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration_seconds.clone()))?;
        registry.register(Box::new(credits_deducted_total.clone()))?;
        registry.register(Box::new(upstream_failures_total.clone()))?;
        registry.register(Box::new(tokens_total.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration_seconds,
            credits_deducted_total,
            upstream_failures_total,
            tokens_total,
        })
    }

    /// Record a completed `/api/v1` request.
    pub fn record_request(&self, method: &str, status: u16, latency_ms: u64) {
        self.requests_total
            .with_label_values(&[method, &status.to_string()])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[method])
            .observe(latency_ms as f64 / 1000.0);
    }

    pub fn record_usage(&self, usage: &TokenUsage) {
        self.tokens_total
            .with_label_values(&["prompt"])
            .inc_by(usage.prompt_tokens as u64);
        self.tokens_total
            .with_label_values(&["completion"])
            .inc_by(usage.completion_tokens as u64);
    }

    /// Credits kept for a successful service call. Refunded reservations are
    /// never recorded.
    pub fn record_credits(&self, service: &str, amount: Decimal) {
        if let Some(value) = amount.to_f64() {
            if value > 0.0 {
                self.credits_deducted_total
                    .with_label_values(&[service])
                    .inc_by(value);
            }
        }
    }

    pub fn record_upstream_failure(&self, service: &str) {
        self.upstream_failures_total
            .with_label_values(&[service])
            .inc();
    }

    /// Encode all registered metrics as Prometheus text format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .unwrap_or_default();
        String::from_utf8(buffer).unwrap_or_default()
    }
}
