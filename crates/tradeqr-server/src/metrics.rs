use prometheus::{
    register_counter_with_registry, register_histogram_with_registry, Counter, Encoder, Histogram,
    Registry, TextEncoder,
};
use std::sync::Arc;

pub struct ServiceMetrics {
    pub sessions_created: Counter,
    pub sessions_joined: Counter,
    pub sessions_cancelled: Counter,
    pub sessions_expired: Counter,
    pub request_latency: Histogram,
    pub rate_limit_hits: Counter,
    pub error_counts: Counter,
    pub registry: Arc<Registry>,
}

impl ServiceMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::new());

        let sessions_created = register_counter_with_registry!(
            "tradeqr_sessions_created_total",
            "Total number of pairing sessions created",
            registry
        )?;

        let sessions_joined = register_counter_with_registry!(
            "tradeqr_sessions_joined_total",
            "Total number of pairing codes redeemed",
            registry
        )?;

        let sessions_cancelled = register_counter_with_registry!(
            "tradeqr_sessions_cancelled_total",
            "Total number of sessions cancelled by their creator",
            registry
        )?;

        let sessions_expired = register_counter_with_registry!(
            "tradeqr_sessions_expired_total",
            "Total number of waiting sessions expired by the sweep",
            registry
        )?;

        let request_latency = register_histogram_with_registry!(
            "tradeqr_request_latency_seconds",
            "Request latency in seconds",
            registry
        )?;

        let rate_limit_hits = register_counter_with_registry!(
            "tradeqr_rate_limit_hits_total",
            "Total number of session creations rejected by the rate limiter",
            registry
        )?;

        let error_counts = register_counter_with_registry!(
            "tradeqr_errors_total",
            "Total number of failed requests",
            registry
        )?;

        Ok(Self {
            sessions_created,
            sessions_joined,
            sessions_cancelled,
            sessions_expired,
            request_latency,
            rate_limit_hits,
            error_counts,
            registry,
        })
    }

    pub fn export_prometheus(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
