//! # Observability
//!
//! Prometheus metrics for applies and destroys. Tracing is initialized by the
//! binary; library code only emits spans and events.

pub mod metrics;
