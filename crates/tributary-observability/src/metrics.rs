use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Once;
use tracing::warn;

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Data Integrity Validation
    // ============================================================================

    /// Records that passed integrity validation
    pub static ref DIV_SUCCESS_MSG: IntCounter = IntCounter::new(
        "tributary_ingestion_success_msg_total",
        "Records that passed data integrity validation"
    )
    .expect("metric can be created");

    /// Fatal integrity violations
    pub static ref DIV_FATAL: IntCounter = IntCounter::new(
        "tributary_ingestion_fatal_div_total",
        "Fatal data integrity violations"
    )
    .expect("metric can be created");

    /// Duplicate records dropped
    pub static ref DIV_DUPLICATE_MSG: IntCounter = IntCounter::new(
        "tributary_ingestion_duplicate_msg_total",
        "Duplicate records dropped before downstream processing"
    )
    .expect("metric can be created");

    // ============================================================================
    // Leader Produce Path
    // ============================================================================

    /// Latency of queueing a produce call to the version topic
    pub static ref LEADER_PRODUCE_LATENCY_MS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "tributary_ingestion_leader_produce_latency_ms",
            "Latency of queueing a version-topic produce call, in milliseconds"
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0])
    )
    .expect("metric can be created");

    /// Leader preprocessing latency per record
    pub static ref LEADER_PREPROCESSING_LATENCY_MS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "tributary_ingestion_leader_preprocessing_latency_ms",
            "Per-record latency before heavy leader processing, in milliseconds"
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0])
    )
    .expect("metric can be created");

    /// Latency of handing records to the drainer queue
    pub static ref QUEUE_PUT_LATENCY_MS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "tributary_ingestion_consumer_records_queue_put_latency_ms",
            "Latency of blocking on the drainer queue, in milliseconds"
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 50.0, 250.0, 1000.0])
    )
    .expect("metric can be created");

    /// Latency of the view fan-out stage
    pub static ref VIEW_PRODUCE_LATENCY_MS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "tributary_ingestion_view_produce_latency_ms",
            "Latency from view fan-out start to the gated version-topic produce, in milliseconds"
        )
        .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 500.0])
    )
    .expect("metric can be created");

    // ============================================================================
    // Hybrid Consumption and Conflict Resolution
    // ============================================================================

    /// Bytes consumed from real-time topics, by upstream region
    pub static ref REGION_HYBRID_BYTES_CONSUMED: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "tributary_ingestion_region_hybrid_bytes_consumed_total",
            "Bytes consumed from real-time topics, labeled by upstream cluster id"
        ),
        &["upstream_cluster"]
    )
    .expect("metric can be created");

    /// Tombstones created by conflict resolution
    pub static ref TOMBSTONE_CREATED_DCR: IntCounter = IntCounter::new(
        "tributary_ingestion_tombstone_created_dcr_total",
        "Tombstones produced by deterministic conflict resolution"
    )
    .expect("metric can be created");

    // ============================================================================
    // Storage Quota
    // ============================================================================

    /// Disk quota usage ratio as observed at the last poll
    pub static ref STORAGE_QUOTA_USED: prometheus::Gauge = prometheus::Gauge::new(
        "tributary_ingestion_storage_quota_used_ratio",
        "Fraction of the storage quota currently used"
    )
    .expect("metric can be created");
}

/// Register all metrics with the global registry. Safe to call repeatedly.
pub fn init() {
    INIT.call_once(|| {
        register(Box::new(DIV_SUCCESS_MSG.clone()), "success_msg");
        register(Box::new(DIV_FATAL.clone()), "fatal_div");
        register(Box::new(DIV_DUPLICATE_MSG.clone()), "duplicate_msg");
        register(
            Box::new(LEADER_PRODUCE_LATENCY_MS.clone()),
            "leader_produce_latency_ms",
        );
        register(
            Box::new(LEADER_PREPROCESSING_LATENCY_MS.clone()),
            "leader_preprocessing_latency_ms",
        );
        register(
            Box::new(QUEUE_PUT_LATENCY_MS.clone()),
            "consumer_records_queue_put_latency_ms",
        );
        register(
            Box::new(VIEW_PRODUCE_LATENCY_MS.clone()),
            "view_produce_latency_ms",
        );
        register(
            Box::new(REGION_HYBRID_BYTES_CONSUMED.clone()),
            "region_hybrid_bytes_consumed",
        );
        register(
            Box::new(TOMBSTONE_CREATED_DCR.clone()),
            "tombstone_created_dcr",
        );
        register(Box::new(STORAGE_QUOTA_USED.clone()), "storage_quota_used");
    });
}

fn register(collector: Box<dyn prometheus::core::Collector>, name: &str) {
    if let Err(error) = REGISTRY.register(collector) {
        warn!(metric = name, %error, "Failed to register metric");
    }
}
