//! Tributary Observability
//!
//! Prometheus metrics for the ingestion pipeline.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use tributary_observability::{metrics, PrometheusStatsSink};
//!
//! metrics::init();
//! let sink = Arc::new(PrometheusStatsSink::new());
//! // hand `sink` to the ingestion context as its stats sink
//! ```

pub mod metrics;
pub mod sink;

pub use metrics::{init as init_metrics, REGISTRY};
pub use sink::PrometheusStatsSink;
