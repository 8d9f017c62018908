//! Consumed Capabilities
//!
//! The ingestion pipeline talks to its environment exclusively through the
//! narrow traits in this module: the commit-log consumer and producer, the
//! local storage engine, the schema registry, view writers and the quota
//! manager. Production wires real clients behind these seams; tests wire
//! in-memory fakes.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::sync::Arc;
use tributary_core::{ConsumedRecord, RecordHeaders, RecordKey, StoreVersionState, TopicPartition, ValueEnvelope};

use crate::error::{ProduceError, Result};

/// Source-cluster coordinates stamped on every leader-produced record, used
/// downstream to track which upstream offset a derived record came from.
///
/// `upstream_offset` is `-1` when offset advancement must be suppressed
/// (e.g. a forwarded TOPIC_SWITCH, whose upstream position comes from the
/// message body instead).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderMetadata {
    pub upstream_offset: i64,
    pub upstream_cluster_id: i32,
}

impl LeaderMetadata {
    /// Sentinel upstream offset that no legal record can carry.
    pub const UPSTREAM_OFFSET_UNKNOWN: i64 = -1;

    pub fn new(upstream_offset: i64, upstream_cluster_id: i32) -> Self {
        Self {
            upstream_offset,
            upstream_cluster_id,
        }
    }

    pub fn suppressed(upstream_cluster_id: i32) -> Self {
        Self {
            upstream_offset: Self::UPSTREAM_OFFSET_UNKNOWN,
            upstream_cluster_id,
        }
    }
}

/// Acknowledgement returned by the downstream producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceAck {
    pub topic: String,
    pub partition: u32,
    pub offset: i64,
}

/// Invoked from the producer's acknowledgement context, exactly once per
/// produce call.
#[async_trait]
pub trait ProduceCallback: Send + Sync {
    async fn on_completion(&self, outcome: std::result::Result<ProduceAck, ProduceError>);
}

/// Commit-log consumer for one or more topic-partitions.
#[async_trait]
pub trait LogConsumer: Send + Sync {
    async fn poll(&self, topic_partition: &TopicPartition) -> Result<Vec<ConsumedRecord>>;
    async fn pause(&self, topic_partition: &TopicPartition) -> Result<()>;
    async fn resume(&self, topic_partition: &TopicPartition) -> Result<()>;
    async fn seek(&self, topic_partition: &TopicPartition, offset: i64) -> Result<()>;
}

/// Commit-log producer for the local version topic.
///
/// Two produce modes exist:
/// - **pass-through** forwards the consumed record with its upstream
///   producer metadata intact, keeping validation state continuous for
///   followers across a leadership failover;
/// - **regenerated** stamps fresh local producer metadata.
///
/// The mode is selected per call site, never globally.
#[async_trait]
pub trait LogProducer: Send + Sync {
    /// Forward `record` preserving its upstream producer metadata.
    async fn send_pass_through(
        &self,
        topic: &str,
        partition: u32,
        record: &ConsumedRecord,
        leader_metadata: LeaderMetadata,
        callback: Arc<dyn ProduceCallback>,
    ) -> Result<()>;

    /// Send a freshly stamped record with local producer metadata.
    #[allow(clippy::too_many_arguments)]
    async fn send(
        &self,
        topic: &str,
        partition: u32,
        key: RecordKey,
        value: ValueEnvelope,
        headers: RecordHeaders,
        logical_timestamp_ms: i64,
        leader_metadata: LeaderMetadata,
        callback: Arc<dyn ProduceCallback>,
    ) -> Result<()>;

    /// Block until every previously queued record is acknowledged.
    async fn flush(&self) -> Result<()>;
}

/// A stored value with its replication metadata, as read back for conflict
/// resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueRecord {
    pub value: Bytes,
    pub schema_id: i32,
    pub replication_metadata: Option<Bytes>,
}

impl ValueRecord {
    pub fn new(value: impl Into<Bytes>, schema_id: i32) -> Self {
        Self {
            value: value.into(),
            schema_id,
            replication_metadata: None,
        }
    }

    pub fn with_replication_metadata(mut self, rmd: impl Into<Bytes>) -> Self {
        self.replication_metadata = Some(rmd.into());
        self
    }
}

/// Local storage engine for one store version.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    async fn get(&self, partition: u32, key: &[u8]) -> Result<Option<ValueRecord>>;
    async fn put(&self, partition: u32, key: Bytes, value: ValueRecord) -> Result<()>;
    async fn delete(&self, partition: u32, key: &[u8]) -> Result<()>;

    fn get_store_version_state(&self) -> Option<StoreVersionState>;
    fn put_store_version_state(&self, state: StoreVersionState);
}

/// Value-schema lookup.
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    async fn is_schema_known(&self, schema_id: i32) -> bool;
}

/// Side-channel writer materializing a derived projection of the store.
///
/// `process_record` returns a future so the caller can fan out to all views
/// concurrently and gate the version-topic produce on their completion.
pub trait ViewWriter: Send + Sync {
    fn name(&self) -> &str;

    #[allow(clippy::too_many_arguments)]
    fn process_record(
        &self,
        new_value: Option<Bytes>,
        old_value: Option<Bytes>,
        key: Bytes,
        version: i32,
        new_schema_id: i32,
        old_schema_id: i32,
        replication_metadata: Option<Bytes>,
    ) -> BoxFuture<'static, std::result::Result<(), String>>;
}

/// Storage-quota enforcement for ingested bytes.
pub trait QuotaManager: Send + Sync {
    fn enforce_partition_quota(&self, partition: u32, bytes_read: u64);
    fn disk_quota_usage(&self) -> f64;
}

/// Quota manager that never throttles; used when quota enforcement is
/// handled elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnlimitedQuota;

impl QuotaManager for UnlimitedQuota {
    fn enforce_partition_quota(&self, _partition: u32, _bytes_read: u64) {}

    fn disk_quota_usage(&self) -> f64 {
        0.0
    }
}
