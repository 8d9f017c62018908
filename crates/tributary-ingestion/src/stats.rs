//! Ingestion Stats Sink
//!
//! The pipeline reports counters and latencies through this abstraction so
//! the hot path never depends on a concrete metrics backend. A Prometheus
//! implementation lives in `tributary-observability`; tests use
//! [`NullStatsSink`] or a recording fake.

/// Sentinel reported by a sink that has no backing data for a metric.
pub const NULL_INGESTION_STATS: i64 = -1;

/// Counter and latency surface of the ingestion pipeline.
///
/// Implementations must be cheap and non-blocking; these are called inline
/// on the record-processing path.
pub trait StatsSink: Send + Sync {
    fn record_success_msg(&self) {}
    fn record_fatal_div(&self) {}
    fn record_duplicate_msg(&self) {}
    fn record_storage_quota_used(&self, _usage_ratio: f64) {}
    fn record_leader_produce_latency_ms(&self, _ms: f64) {}
    fn record_queue_put_latency_ms(&self, _ms: f64) {}
    fn record_leader_preprocessing_latency_ms(&self, _ms: f64) {}
    fn record_view_produce_latency_ms(&self, _ms: f64) {}
    fn record_region_hybrid_bytes_consumed(&self, _upstream_cluster_id: i32, _bytes: u64) {}
    fn record_tombstone_created_dcr(&self) {}

    /// Current value of a named counter, or [`NULL_INGESTION_STATS`] when
    /// the sink does not track it.
    fn counter(&self, _name: &str) -> i64 {
        NULL_INGESTION_STATS
    }
}

/// Sink that drops everything and reports the null sentinel.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStatsSink;

impl StatsSink for NullStatsSink {}
