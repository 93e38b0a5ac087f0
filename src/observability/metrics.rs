//! # Metrics
//!
//! Prometheus metrics for monitoring applies and destroys.
//!
//! ## Metrics Exposed
//!
//! - `compliance_lake_applies_total` - Total number of graph applies
//! - `compliance_lake_apply_errors_total` - Graph applies that failed, by error kind
//! - `compliance_lake_apply_duration_seconds` - Duration of whole-graph applies
//! - `compliance_lake_resource_operations_total` - Resource operations by type and action
//! - `compliance_lake_resource_operation_duration_seconds` - Duration of single resource operations
//! - `compliance_lake_retries_total` - Transient control-plane failures that were retried
//! - `compliance_lake_resources_managed` - Resources tracked in deployment state

use anyhow::Result;
use prometheus::{
    Encoder, Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder,
};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static APPLIES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("compliance_lake_applies_total", "Total number of graph applies")
        .expect("Failed to create APPLIES_TOTAL metric - this should never happen")
});

static APPLY_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "compliance_lake_apply_errors_total",
            "Total number of failed graph applies",
        ),
        &["kind"],
    )
    .expect("Failed to create APPLY_ERRORS_TOTAL metric - this should never happen")
});

static APPLY_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "compliance_lake_apply_duration_seconds",
            "Duration of graph applies in seconds",
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
    )
    .expect("Failed to create APPLY_DURATION metric - this should never happen")
});

static RESOURCE_OPERATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "compliance_lake_resource_operations_total",
            "Total number of resource operations",
        ),
        &["resource_type", "action"],
    )
    .expect("Failed to create RESOURCE_OPERATIONS_TOTAL metric - this should never happen")
});

static RESOURCE_OPERATION_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new(
            "compliance_lake_resource_operation_duration_seconds",
            "Duration of resource operations in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 180.0]),
        &["resource_type"],
    )
    .expect("Failed to create RESOURCE_OPERATION_DURATION metric - this should never happen")
});

static RETRIES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "compliance_lake_retries_total",
            "Total number of retried transient control-plane failures",
        ),
        &["resource_type"],
    )
    .expect("Failed to create RETRIES_TOTAL metric - this should never happen")
});

static RESOURCES_MANAGED: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "compliance_lake_resources_managed",
        "Current number of resources tracked in deployment state",
    )
    .expect("Failed to create RESOURCES_MANAGED metric - this should never happen")
});

/// Register all metrics with the crate registry
///
/// Call once per process; a second call fails with an already-registered error.
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(APPLIES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(APPLY_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(APPLY_DURATION.clone()))?;
    REGISTRY.register(Box::new(RESOURCE_OPERATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RESOURCE_OPERATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(RETRIES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RESOURCES_MANAGED.clone()))?;
    Ok(())
}

/// Registered metrics in the text exposition format
pub fn render() -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

pub fn increment_applies() {
    APPLIES_TOTAL.inc();
}

pub fn increment_apply_errors(kind: &str) {
    APPLY_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn observe_apply_duration(duration: f64) {
    APPLY_DURATION.observe(duration);
}

pub fn record_resource_operation(resource_type: &str, action: &str, duration: f64) {
    RESOURCE_OPERATIONS_TOTAL
        .with_label_values(&[resource_type, action])
        .inc();
    RESOURCE_OPERATION_DURATION
        .with_label_values(&[resource_type])
        .observe(duration);
}

pub fn increment_retries(resource_type: &str) {
    RETRIES_TOTAL.with_label_values(&[resource_type]).inc();
}

pub fn set_resources_managed(count: i64) {
    RESOURCES_MANAGED.set(count);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_metrics_and_render() {
        assert!(register_metrics().is_ok());
        increment_applies();
        let text = render().unwrap();
        assert!(text.contains("compliance_lake_applies_total"));
    }

    #[test]
    fn test_record_resource_operation() {
        let before = RESOURCE_OPERATIONS_TOTAL
            .with_label_values(&["AWS::S3::Bucket", "created"])
            .get();
        record_resource_operation("AWS::S3::Bucket", "created", 0.3);
        let after = RESOURCE_OPERATIONS_TOTAL
            .with_label_values(&["AWS::S3::Bucket", "created"])
            .get();
        assert_eq!(after, before + 1u64);
    }

    #[test]
    fn test_increment_retries() {
        let before = RETRIES_TOTAL.with_label_values(&["AWS::KMS::Key"]).get();
        increment_retries("AWS::KMS::Key");
        let after = RETRIES_TOTAL.with_label_values(&["AWS::KMS::Key"]).get();
        assert_eq!(after, before + 1u64);
    }

    #[test]
    fn test_increment_apply_errors() {
        let before = APPLY_ERRORS_TOTAL.with_label_values(&["transient"]).get();
        increment_apply_errors("transient");
        let after = APPLY_ERRORS_TOTAL.with_label_values(&["transient"]).get();
        assert_eq!(after, before + 1u64);
    }

    #[test]
    fn test_set_resources_managed() {
        set_resources_managed(10);
        assert_eq!(RESOURCES_MANAGED.get(), 10);
        set_resources_managed(20);
        assert_eq!(RESOURCES_MANAGED.get(), 20);
    }
}
