//! Leader Produce Callbacks
//!
//! Every leader produce call to the version topic carries a callback that
//! the producer invokes exactly once from its acknowledgement context. On
//! success the callback stamps the durable offset, resolves the record's
//! persist future and hands the produced record to the drainer with the
//! downstream partition number; on failure it records the ingestion error
//! against the partition and fails the persist future.
//!
//! Callbacks reach partition state through [`PartitionStateRegistry`] by
//! partition id only. A lookup miss means the partition was unsubscribed
//! between produce and acknowledgement; the callback short-circuits instead
//! of touching dead state.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};
use tributary_core::ConsumedRecord;

use crate::completion::{completion_pair, CompletionError, CompletionFuture, CompletionHandle};
use crate::drainer::Drainer;
use crate::error::{IngestionError, ProduceError};
use crate::interfaces::{ProduceAck, ProduceCallback};
use crate::partition_state::PartitionStateRegistry;
use crate::stats::StatsSink;

/// Everything a produce callback needs to finish processing one record
/// after the producer acknowledges it.
pub struct LeaderProducedRecordContext {
    /// The record as produced downstream; its offset is stamped from the
    /// acknowledgement before it goes to the drainer.
    record: ConsumedRecord,
    produced_offset: AtomicI64,
    persist_handle: Mutex<Option<CompletionHandle>>,
    persist_future: CompletionFuture,
}

impl LeaderProducedRecordContext {
    pub fn new(record: ConsumedRecord) -> Self {
        let (handle, future) = completion_pair();
        Self {
            record,
            produced_offset: AtomicI64::new(-1),
            persist_handle: Mutex::new(Some(handle)),
            persist_future: future,
        }
    }

    /// Future resolving once the record is acknowledged and drained.
    pub fn persist_future(&self) -> CompletionFuture {
        self.persist_future.clone()
    }

    /// Offset the producer assigned, or `-1` before acknowledgement.
    pub fn produced_offset(&self) -> i64 {
        self.produced_offset.load(Ordering::Acquire)
    }

    fn stamp_produced_offset(&self, offset: i64) {
        self.produced_offset.store(offset, Ordering::Release);
    }

    fn resolve_persist(&self, outcome: Result<(), CompletionError>) {
        if let Some(handle) = self
            .persist_handle
            .lock()
            .expect("persist handle poisoned")
            .take()
        {
            match outcome {
                Ok(()) => handle.complete(),
                Err(error) => handle.fail(error),
            }
        }
    }
}

/// Callback for leader produce calls.
pub struct LeaderProducerCallback {
    registry: Arc<PartitionStateRegistry>,
    partition: u32,
    downstream_partition: u32,
    upstream_url: String,
    ingress_timestamp_ms: i64,
    context: Arc<LeaderProducedRecordContext>,
    drainer: Arc<dyn Drainer>,
    stats: Arc<dyn StatsSink>,
}

impl LeaderProducerCallback {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<PartitionStateRegistry>,
        partition: u32,
        downstream_partition: u32,
        upstream_url: String,
        ingress_timestamp_ms: i64,
        context: Arc<LeaderProducedRecordContext>,
        drainer: Arc<dyn Drainer>,
        stats: Arc<dyn StatsSink>,
    ) -> Self {
        Self {
            registry,
            partition,
            downstream_partition,
            upstream_url,
            ingress_timestamp_ms,
            context,
            drainer,
            stats,
        }
    }

    pub fn context(&self) -> &Arc<LeaderProducedRecordContext> {
        &self.context
    }

    async fn handle_success(&self, ack: ProduceAck) {
        self.context.stamp_produced_offset(ack.offset);

        let state = match self.registry.get(self.partition) {
            Some(state) => state,
            None => {
                debug!(
                    partition = self.partition,
                    offset = ack.offset,
                    "Partition unsubscribed before acknowledgement; dropping drainer hand-off"
                );
                self.context.resolve_persist(Ok(()));
                return;
            }
        };

        let mut record = self.context.record.clone();
        record.offset = ack.offset;

        let put_started = std::time::Instant::now();
        let drained = self
            .drainer
            .put(
                record,
                self.downstream_partition,
                &self.upstream_url,
                self.ingress_timestamp_ms,
            )
            .await;
        self.stats
            .record_queue_put_latency_ms(put_started.elapsed().as_secs_f64() * 1_000.0);

        match drained {
            Ok(()) => self.context.resolve_persist(Ok(())),
            Err(error) => {
                warn!(
                    replica = %state.replica_id(),
                    error = %error,
                    "Failed to hand acknowledged record to drainer"
                );
                state.set_ingestion_error(&error);
                self.context
                    .resolve_persist(Err(CompletionError(error.to_string())));
            }
        }
    }

    fn handle_failure(&self, error: ProduceError) {
        if let Some(state) = self.registry.get(self.partition) {
            state.set_ingestion_error(&IngestionError::Produce(error.clone()));
        }
        self.context
            .resolve_persist(Err(CompletionError(error.to_string())));
    }
}

#[async_trait]
impl ProduceCallback for LeaderProducerCallback {
    async fn on_completion(&self, outcome: Result<ProduceAck, ProduceError>) {
        match outcome {
            Ok(ack) => self.handle_success(ack).await,
            Err(error) => self.handle_failure(error),
        }
    }
}

/// Staging frame for a conflict-resolved version-topic value: a four-byte
/// big-endian schema-id header followed by the payload.
///
/// The active/active produce path stamps the winning schema id into the
/// header and produces a snapshot of the frame as the wire value. When the
/// payload is the incoming record's own value, the callback restores the
/// original header once the produce settles, returning the frame to the
/// input's framing for any later reader. Stamping writes the same bytes
/// every time, which makes the restore hook safe to invoke repeatedly.
pub struct SchemaHeaderedBuffer {
    buf: Mutex<Vec<u8>>,
}

impl SchemaHeaderedBuffer {
    pub fn new(schema_id: i32, value: &[u8]) -> Self {
        let mut buf = Vec::with_capacity(4 + value.len());
        buf.extend_from_slice(&schema_id.to_be_bytes());
        buf.extend_from_slice(value);
        Self {
            buf: Mutex::new(buf),
        }
    }

    pub fn stamp(&self, schema_id: i32) {
        let mut buf = self.buf.lock().expect("headered buffer poisoned");
        buf[0..4].copy_from_slice(&schema_id.to_be_bytes());
    }

    pub fn schema_id(&self) -> i32 {
        let buf = self.buf.lock().expect("headered buffer poisoned");
        i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
    }

    /// Snapshot of the current buffer contents.
    pub fn bytes(&self) -> Bytes {
        Bytes::from(self.buf.lock().expect("headered buffer poisoned").clone())
    }
}

type CompletionHook = Arc<dyn Fn() + Send + Sync>;

/// Active/active variant carrying an idempotent post-completion hook that
/// restores in-place-modified input buffers.
pub struct ActiveActiveProducerCallback {
    inner: LeaderProducerCallback,
    on_completion_hook: Mutex<Option<CompletionHook>>,
}

impl ActiveActiveProducerCallback {
    pub fn new(inner: LeaderProducerCallback) -> Self {
        Self {
            inner,
            on_completion_hook: Mutex::new(None),
        }
    }

    /// Install the buffer-restore hook. The hook may run more than once if
    /// the producer retries, so it must be idempotent.
    pub fn set_on_completion_hook(&self, hook: CompletionHook) {
        *self
            .on_completion_hook
            .lock()
            .expect("completion hook poisoned") = Some(hook);
    }

    fn run_hook(&self) {
        let hook = self
            .on_completion_hook
            .lock()
            .expect("completion hook poisoned")
            .clone();
        if let Some(hook) = hook {
            hook();
        }
    }
}

#[async_trait]
impl ProduceCallback for ActiveActiveProducerCallback {
    async fn on_completion(&self, outcome: Result<ProduceAck, ProduceError>) {
        // Restore the staging frame first; the inner callback may hand the
        // record onward.
        self.run_hook();
        self.inner.on_completion(outcome).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drainer::ChannelDrainer;
    use crate::partition_state::{PartitionConsumptionState, PartitionFlags, ReplicaRole};
    use crate::stats::NullStatsSink;
    use tributary_core::{ProducerMetadata, RecordKey, ValueEnvelope};

    fn make_record() -> ConsumedRecord {
        ConsumedRecord::new(
            RecordKey::data(Bytes::from_static(b"k")),
            ValueEnvelope::put(1, Bytes::from_static(b"v")),
            ProducerMetadata::new(1, 0, 1, 1_000),
            5,
            1_000,
        )
    }

    fn make_callback(
        registry: Arc<PartitionStateRegistry>,
        drainer: Arc<dyn Drainer>,
    ) -> LeaderProducerCallback {
        LeaderProducerCallback::new(
            registry,
            0,
            0,
            "broker-a".to_string(),
            1_000,
            Arc::new(LeaderProducedRecordContext::new(make_record())),
            drainer,
            Arc::new(NullStatsSink),
        )
    }

    fn ack(offset: i64) -> ProduceAck {
        ProduceAck {
            topic: "orders_v3".to_string(),
            partition: 0,
            offset,
        }
    }

    #[tokio::test]
    async fn test_success_stamps_offset_and_drains() {
        let registry = PartitionStateRegistry::new();
        registry.insert(Arc::new(PartitionConsumptionState::new(
            "orders_v3",
            0,
            ReplicaRole::Leader,
            PartitionFlags::default(),
        )));
        let (drainer, mut rx) = ChannelDrainer::new(4);
        let callback = make_callback(Arc::clone(&registry), Arc::new(drainer));
        let context = Arc::clone(callback.context());

        callback.on_completion(Ok(ack(42))).await;

        assert_eq!(context.produced_offset(), 42);
        let entry = rx.recv().await.unwrap();
        assert_eq!(entry.record.offset, 42);
        assert_eq!(entry.upstream_url, "broker-a");
        context.persist_future().await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_records_partition_error() {
        let registry = PartitionStateRegistry::new();
        let state = Arc::new(PartitionConsumptionState::new(
            "orders_v3",
            0,
            ReplicaRole::Leader,
            PartitionFlags::default(),
        ));
        registry.insert(Arc::clone(&state));
        let (drainer, _rx) = ChannelDrainer::new(4);
        let callback = make_callback(Arc::clone(&registry), Arc::new(drainer));
        let context = Arc::clone(callback.context());

        callback
            .on_completion(Err(ProduceError("broker unreachable".to_string())))
            .await;

        assert!(state.ingestion_error().unwrap().contains("broker unreachable"));
        assert!(context.persist_future().await.is_err());
    }

    #[tokio::test]
    async fn test_unsubscribed_partition_short_circuits() {
        let registry = PartitionStateRegistry::new();
        let (drainer, mut rx) = ChannelDrainer::new(4);
        let callback = make_callback(Arc::clone(&registry), Arc::new(drainer));
        let context = Arc::clone(callback.context());

        callback.on_completion(Ok(ack(7))).await;

        // Persist future resolves, but nothing reaches the drainer
        context.persist_future().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    // ---------------------------------------------------------------
    // Headered buffer + active/active hook
    // ---------------------------------------------------------------

    #[test]
    fn test_headered_buffer_stamp_and_restore() {
        let buffer = SchemaHeaderedBuffer::new(3, b"value");
        assert_eq!(buffer.schema_id(), 3);
        buffer.stamp(9);
        assert_eq!(buffer.schema_id(), 9);
        buffer.stamp(3);
        assert_eq!(buffer.schema_id(), 3);
        assert_eq!(&buffer.bytes()[4..], b"value");
    }

    #[tokio::test]
    async fn test_hook_is_idempotent_across_repeated_completion() {
        let registry = PartitionStateRegistry::new();
        let (drainer, _rx) = ChannelDrainer::new(4);
        let callback =
            ActiveActiveProducerCallback::new(make_callback(registry, Arc::new(drainer)));

        let buffer = Arc::new(SchemaHeaderedBuffer::new(3, b"value"));
        buffer.stamp(9);
        {
            let buffer = Arc::clone(&buffer);
            callback.set_on_completion_hook(Arc::new(move || buffer.stamp(3)));
        }

        // The producer may invoke the callback again on retry; the restore
        // must hold either way.
        callback.on_completion(Ok(ack(1))).await;
        assert_eq!(buffer.schema_id(), 3);
        callback.on_completion(Ok(ack(1))).await;
        assert_eq!(buffer.schema_id(), 3);
    }
}
