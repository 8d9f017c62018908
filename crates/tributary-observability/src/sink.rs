//! Prometheus-backed stats sink for the ingestion pipeline.

use tributary_ingestion::stats::{StatsSink, NULL_INGESTION_STATS};

use crate::metrics;

/// Reports ingestion counters and latencies into the Prometheus registry.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusStatsSink;

impl PrometheusStatsSink {
    pub fn new() -> Self {
        metrics::init();
        Self
    }
}

impl StatsSink for PrometheusStatsSink {
    fn record_success_msg(&self) {
        metrics::DIV_SUCCESS_MSG.inc();
    }

    fn record_fatal_div(&self) {
        metrics::DIV_FATAL.inc();
    }

    fn record_duplicate_msg(&self) {
        metrics::DIV_DUPLICATE_MSG.inc();
    }

    fn record_storage_quota_used(&self, usage_ratio: f64) {
        metrics::STORAGE_QUOTA_USED.set(usage_ratio);
    }

    fn record_leader_produce_latency_ms(&self, ms: f64) {
        metrics::LEADER_PRODUCE_LATENCY_MS.observe(ms);
    }

    fn record_queue_put_latency_ms(&self, ms: f64) {
        metrics::QUEUE_PUT_LATENCY_MS.observe(ms);
    }

    fn record_leader_preprocessing_latency_ms(&self, ms: f64) {
        metrics::LEADER_PREPROCESSING_LATENCY_MS.observe(ms);
    }

    fn record_view_produce_latency_ms(&self, ms: f64) {
        metrics::VIEW_PRODUCE_LATENCY_MS.observe(ms);
    }

    fn record_region_hybrid_bytes_consumed(&self, upstream_cluster_id: i32, bytes: u64) {
        metrics::REGION_HYBRID_BYTES_CONSUMED
            .with_label_values(&[&upstream_cluster_id.to_string()])
            .inc_by(bytes);
    }

    fn record_tombstone_created_dcr(&self) {
        metrics::TOMBSTONE_CREATED_DCR.inc();
    }

    fn counter(&self, name: &str) -> i64 {
        match name {
            "success_msg" => metrics::DIV_SUCCESS_MSG.get() as i64,
            "fatal_div" => metrics::DIV_FATAL.get() as i64,
            "duplicate_msg" => metrics::DIV_DUPLICATE_MSG.get() as i64,
            "tombstone_created_dcr" => metrics::TOMBSTONE_CREATED_DCR.get() as i64,
            _ => NULL_INGESTION_STATS,
        }
    }
}
