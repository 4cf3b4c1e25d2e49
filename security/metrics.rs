//! Prometheus metrics for the security core
//!
//! # Metrics
//!
//! - `security_audit_events_recorded_total` - Events written by the audit sink
//! - `security_audit_events_dropped_total` - Events lost to queue overflow
//! - `security_audit_sink_failures_total` - Sink write failures
//! - `security_audit_queue_depth` - Events waiting for the consumer
//! - `security_rate_limit_rejections_total` - Attempts rejected by the limiter
//! - `security_tokens_issued_total` - Session tokens signed (login and refresh)
//! - `security_tokens_refreshed_total` - Tokens re-issued near expiry
//! - `security_token_refresh_skipped_total` - Refreshes skipped after a failed lookup
//! - `security_token_validation_failures_total{reason}` - Rejected tokens
//! - `security_login_failures_total` - Failed credential checks

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, Encoder, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;

/// Metrics collector
pub struct SecurityMetrics {
    /// Prometheus registry
    pub registry: Registry,

    /// Events written by the audit sink
    pub audit_events_recorded_total: IntCounter,

    /// Events lost to queue overflow
    pub audit_events_dropped_total: IntCounter,

    /// Sink write failures
    pub audit_sink_failures_total: IntCounter,

    /// Events waiting for the consumer
    pub audit_queue_depth: IntGauge,

    /// Attempts rejected by the limiter
    pub rate_limit_rejections_total: IntCounter,

    /// Session tokens signed
    pub tokens_issued_total: IntCounter,

    /// Tokens re-issued near expiry
    pub tokens_refreshed_total: IntCounter,

    /// Refreshes skipped after a failed identity lookup
    pub token_refresh_skipped_total: IntCounter,

    /// Rejected tokens by reason
    pub token_validation_failures_total: IntCounterVec,

    /// Failed credential checks
    pub login_failures_total: IntCounter,
}

impl SecurityMetrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let audit_events_recorded_total = register_int_counter_with_registry!(
            Opts::new(
                "security_audit_events_recorded_total",
                "Audit events written by the sink"
            ),
            registry
        )?;

        let audit_events_dropped_total = register_int_counter_with_registry!(
            Opts::new(
                "security_audit_events_dropped_total",
                "Audit events dropped because the queue was full"
            ),
            registry
        )?;

        let audit_sink_failures_total = register_int_counter_with_registry!(
            Opts::new(
                "security_audit_sink_failures_total",
                "Audit sink write failures"
            ),
            registry
        )?;

        let audit_queue_depth = register_int_gauge_with_registry!(
            Opts::new(
                "security_audit_queue_depth",
                "Audit events waiting for the consumer"
            ),
            registry
        )?;

        let rate_limit_rejections_total = register_int_counter_with_registry!(
            Opts::new(
                "security_rate_limit_rejections_total",
                "Attempts rejected by the rate limiter"
            ),
            registry
        )?;

        let tokens_issued_total = register_int_counter_with_registry!(
            Opts::new("security_tokens_issued_total", "Session tokens signed"),
            registry
        )?;

        let tokens_refreshed_total = register_int_counter_with_registry!(
            Opts::new(
                "security_tokens_refreshed_total",
                "Session tokens re-issued near expiry"
            ),
            registry
        )?;

        let token_refresh_skipped_total = register_int_counter_with_registry!(
            Opts::new(
                "security_token_refresh_skipped_total",
                "Refreshes skipped because the identity lookup failed"
            ),
            registry
        )?;

        let token_validation_failures_total = register_int_counter_vec_with_registry!(
            Opts::new(
                "security_token_validation_failures_total",
                "Rejected session tokens"
            ),
            &["reason"],
            registry
        )?;

        let login_failures_total = register_int_counter_with_registry!(
            Opts::new("security_login_failures_total", "Failed credential checks"),
            registry
        )?;

        Ok(Self {
            registry,
            audit_events_recorded_total,
            audit_events_dropped_total,
            audit_sink_failures_total,
            audit_queue_depth,
            rate_limit_rejections_total,
            tokens_issued_total,
            tokens_refreshed_total,
            token_refresh_skipped_total,
            token_validation_failures_total,
            login_failures_total,
        })
    }

    /// Export all metrics in Prometheus text format
    pub fn export(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Global metrics instance
pub static METRICS: Lazy<Arc<SecurityMetrics>> =
    Lazy::new(|| Arc::new(SecurityMetrics::new().expect("Failed to initialize metrics")));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_metrics() {
        let metrics = SecurityMetrics::new().unwrap();
        metrics.tokens_issued_total.inc();
        metrics
            .token_validation_failures_total
            .with_label_values(&["token_expired"])
            .inc();

        let text = metrics.export().unwrap();
        assert!(text.contains("security_tokens_issued_total 1"));
        assert!(text.contains("reason=\"token_expired\""));
    }
}
