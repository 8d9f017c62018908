//! Partition Data Receiver
//!
//! The per-partition entry point of the ingestion pipeline. `write` takes
//! one polled batch of records and, for each record, validates integrity,
//! decides between producing a derived record to the version topic,
//! queueing it for local persistence, or skipping it, resolves
//! active/active conflicts, and coordinates with view-side writers.
//!
//! ## Flow
//!
//! ```text
//! write(batch)
//!   ├─ duplicate filtering + integrity validation (leader only)
//!   ├─ eligible for parallel processing?  ──> mini-batches under key locks
//!   └─ per record:
//!        ├─ START_OF_PUSH primed inline (idempotent)
//!        ├─ delegate: control-message table / pass-through / regenerated /
//!        │            active-active merge + view fan-out
//!        └─ QUEUED_TO_DRAINER records block on the bounded drainer queue
//! ```
//!
//! ## Ordering
//!
//! Per partition and key, storage order matches record order: delegation is
//! sequential and the active/active path runs under the key-level lock.
//! Version-topic writes stay in record order even with concurrent view
//! fan-out, because each produce is gated on the previous produce call's
//! queue future.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures::future::{self, FutureExt};
use tracing::{debug, info, warn};

use tributary_core::{
    ConsumedRecord, ControlMessageKind, ProducerMetadata, RecordHeaders, RecordKey,
    StoreVersionState, TopicPartition, ValueEnvelope, CHUNKED_VALUE_MANIFEST_SCHEMA_ID,
    CHUNK_SCHEMA_ID,
};

use crate::batch::{read_prior_value, BatchProcessor, ProcessedRecord};
use crate::completion::{completion_pair, CompletionError};
use crate::config::IngestionConfig;
use crate::div::DataIntegrityValidator;
use crate::drainer::Drainer;
use crate::error::{IngestionError, Result};
use crate::heartbeat;
use crate::interfaces::{
    LeaderMetadata, LogProducer, ProduceCallback, QuotaManager, SchemaRegistry, StorageEngine,
    UnlimitedQuota, ViewWriter,
};
use crate::key_lock::KeyLockManager;
use crate::merge::{ConflictResolver, MergeConflictOutcome, MergeConflictResult};
use crate::partition_state::{
    PartitionConsumptionState, PartitionStateRegistry, TopicSwitchInfo, TransientRecord,
};
use crate::producer::{
    ActiveActiveProducerCallback, LeaderProducedRecordContext, LeaderProducerCallback,
    SchemaHeaderedBuffer,
};
use crate::stats::{NullStatsSink, StatsSink};

/// Everything shared by the partition receivers of one store version.
pub struct IngestionContext {
    pub config: IngestionConfig,
    pub version_topic: String,
    pub store_version: i32,
    pub local_broker_url: String,
    pub local_cluster_id: i32,
    pub local_producer_guid: u128,
    pub registry: Arc<PartitionStateRegistry>,
    pub storage: Arc<dyn StorageEngine>,
    pub schemas: Arc<dyn SchemaRegistry>,
    pub stats: Arc<dyn StatsSink>,
    pub drainer: Arc<dyn Drainer>,
    pub quota: Arc<dyn QuotaManager>,
    pub view_writers: Vec<Arc<dyn ViewWriter>>,
    pub key_locks: Arc<KeyLockManager>,
    pub batch_producer: Arc<dyn LogProducer>,
    pub real_time_producer: Arc<dyn LogProducer>,
    pub resolver: ConflictResolver,
    running: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl IngestionContext {
    pub fn builder() -> IngestionContextBuilder {
        IngestionContextBuilder::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop all partition tasks at their next suspension point.
    pub fn shut_down(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn set_last_error(&self, error: &IngestionError) {
        let mut slot = self.last_error.lock().expect("last error poisoned");
        if slot.is_none() {
            *slot = Some(error.to_string());
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().expect("last error poisoned").clone()
    }
}

/// Builder over [`IngestionContext`]; producers, storage, schema registry
/// and drainer are required, everything else has a default.
#[derive(Default)]
pub struct IngestionContextBuilder {
    config: Option<IngestionConfig>,
    version_topic: Option<String>,
    store_version: Option<i32>,
    local_broker_url: Option<String>,
    local_cluster_id: Option<i32>,
    local_producer_guid: Option<u128>,
    registry: Option<Arc<PartitionStateRegistry>>,
    storage: Option<Arc<dyn StorageEngine>>,
    schemas: Option<Arc<dyn SchemaRegistry>>,
    stats: Option<Arc<dyn StatsSink>>,
    drainer: Option<Arc<dyn Drainer>>,
    quota: Option<Arc<dyn QuotaManager>>,
    view_writers: Vec<Arc<dyn ViewWriter>>,
    batch_producer: Option<Arc<dyn LogProducer>>,
    real_time_producer: Option<Arc<dyn LogProducer>>,
    resolver: Option<ConflictResolver>,
}

impl IngestionContextBuilder {
    pub fn config(mut self, config: IngestionConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn version_topic(mut self, topic: impl Into<String>) -> Self {
        self.version_topic = Some(topic.into());
        self
    }

    pub fn store_version(mut self, version: i32) -> Self {
        self.store_version = Some(version);
        self
    }

    pub fn local_broker_url(mut self, url: impl Into<String>) -> Self {
        self.local_broker_url = Some(url.into());
        self
    }

    pub fn local_cluster_id(mut self, id: i32) -> Self {
        self.local_cluster_id = Some(id);
        self
    }

    pub fn local_producer_guid(mut self, guid: u128) -> Self {
        self.local_producer_guid = Some(guid);
        self
    }

    pub fn registry(mut self, registry: Arc<PartitionStateRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn StorageEngine>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn schema_registry(mut self, schemas: Arc<dyn SchemaRegistry>) -> Self {
        self.schemas = Some(schemas);
        self
    }

    pub fn stats(mut self, stats: Arc<dyn StatsSink>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn drainer(mut self, drainer: Arc<dyn Drainer>) -> Self {
        self.drainer = Some(drainer);
        self
    }

    pub fn quota(mut self, quota: Arc<dyn QuotaManager>) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn view_writer(mut self, view: Arc<dyn ViewWriter>) -> Self {
        self.view_writers.push(view);
        self
    }

    pub fn batch_producer(mut self, producer: Arc<dyn LogProducer>) -> Self {
        self.batch_producer = Some(producer);
        self
    }

    pub fn real_time_producer(mut self, producer: Arc<dyn LogProducer>) -> Self {
        self.real_time_producer = Some(producer);
        self
    }

    pub fn conflict_resolver(mut self, resolver: ConflictResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn build(self) -> Result<Arc<IngestionContext>> {
        let missing = |field: &str| {
            IngestionError::Configuration(format!("ingestion context requires {field}"))
        };
        Ok(Arc::new(IngestionContext {
            config: self.config.unwrap_or_default(),
            version_topic: self.version_topic.ok_or_else(|| missing("version_topic"))?,
            store_version: self.store_version.unwrap_or(1),
            local_broker_url: self
                .local_broker_url
                .unwrap_or_else(|| "localhost:9092".to_string()),
            local_cluster_id: self.local_cluster_id.unwrap_or(0),
            local_producer_guid: self.local_producer_guid.unwrap_or(0),
            registry: self.registry.unwrap_or_else(PartitionStateRegistry::new),
            storage: self.storage.ok_or_else(|| missing("storage"))?,
            schemas: self.schemas.ok_or_else(|| missing("schema_registry"))?,
            stats: self.stats.unwrap_or_else(|| Arc::new(NullStatsSink)),
            drainer: self.drainer.ok_or_else(|| missing("drainer"))?,
            quota: self.quota.unwrap_or_else(|| Arc::new(UnlimitedQuota)),
            view_writers: self.view_writers,
            key_locks: KeyLockManager::new(),
            batch_producer: self
                .batch_producer
                .ok_or_else(|| missing("batch_producer"))?,
            real_time_producer: self
                .real_time_producer
                .ok_or_else(|| missing("real_time_producer"))?,
            resolver: self.resolver.unwrap_or_else(|| ConflictResolver::new(1)),
            running: AtomicBool::new(true),
            last_error: Mutex::new(None),
        }))
    }
}

/// Outcome of delegating one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegateResult {
    /// A derived record was handed to the downstream producer; the drainer
    /// receives it from the producer callback.
    ProducedToDownstream,
    /// The record goes to local storage directly: follower path, or a
    /// leader consuming from the local version topic.
    QueuedToDrainer,
    /// The record was filtered out.
    Skipped,
}

enum ProduceMode<'a> {
    /// Forward the consumed record with upstream producer metadata intact.
    PassThrough(&'a ConsumedRecord),
    /// Stamp fresh local producer metadata.
    Regenerated {
        key: RecordKey,
        value: ValueEnvelope,
        headers: RecordHeaders,
        logical_timestamp_ms: i64,
    },
}

/// Receives polled batches for one upstream topic-partition and drives them
/// through validation, delegation and production.
pub struct PartitionReceiver {
    ctx: Arc<IngestionContext>,
    source: TopicPartition,
    upstream_url: String,
    upstream_cluster_id: i32,
    vt_validator: Mutex<DataIntegrityValidator>,
    rt_validator: Mutex<DataIntegrityValidator>,
    batch_processor: BatchProcessor,
    received_records_count: AtomicU64,
}

impl PartitionReceiver {
    pub fn new(
        ctx: Arc<IngestionContext>,
        source: TopicPartition,
        upstream_url: impl Into<String>,
        upstream_cluster_id: i32,
    ) -> Arc<Self> {
        let pool_size = ctx.config.parallel_processing_pool_size;
        Arc::new(Self {
            ctx,
            source,
            upstream_url: upstream_url.into(),
            upstream_cluster_id,
            vt_validator: Mutex::new(DataIntegrityValidator::new()),
            rt_validator: Mutex::new(DataIntegrityValidator::new()),
            batch_processor: BatchProcessor::new(pool_size),
            received_records_count: AtomicU64::new(0),
        })
    }

    /// Topic-partition the derived records are produced to.
    pub fn destination_identifier(&self) -> TopicPartition {
        TopicPartition::new(self.ctx.version_topic.clone(), self.source.partition)
    }

    /// Upstream topic-partition this receiver consumes.
    pub fn source(&self) -> &TopicPartition {
        &self.source
    }

    /// Number of records handed to `write`, for tests and observability.
    pub fn received_records_count(&self) -> u64 {
        self.received_records_count.load(Ordering::Relaxed)
    }

    /// A deleted upstream topic is a fatal, partition-scoped condition.
    pub fn notify_of_topic_deletion(&self, topic: &str) {
        let error = IngestionError::TopicDeleted(topic.to_string());
        if let Some(state) = self.ctx.registry.get(self.source.partition) {
            state.set_ingestion_error(&error);
        }
        self.ctx.set_last_error(&error);
    }

    /// Sole entry point for polled data.
    pub async fn write(self: &Arc<Self>, records: Vec<ConsumedRecord>) -> Result<()> {
        self.received_records_count
            .fetch_add(records.len() as u64, Ordering::Relaxed);
        match self.produce_or_drain(records).await {
            Ok(()) => Ok(()),
            Err(IngestionError::Interrupted) => Err(IngestionError::Interrupted),
            Err(error) => {
                warn!(
                    source = %self.source,
                    error = %error,
                    "Failed to process polled records"
                );
                if let Some(state) = self.ctx.registry.get(self.source.partition) {
                    state.set_ingestion_error(&error);
                }
                self.ctx.set_last_error(&error);
                Err(error)
            }
        }
    }

    async fn produce_or_drain(self: &Arc<Self>, records: Vec<ConsumedRecord>) -> Result<()> {
        let state = match self.ctx.registry.get(self.source.partition) {
            Some(state) => state,
            None => {
                warn!(
                    source = %self.source,
                    "No partition consumption state; filtering out all polled records"
                );
                return Ok(());
            }
        };
        if let Some(message) = state.ingestion_error() {
            return Err(IngestionError::PartitionErrored {
                partition: self.source.partition,
                message,
            });
        }

        // Filter duplicates from the leader topic as early as possible so
        // the batch stage never spends work on them.
        let records = self.validate_and_filter_duplicates(records, &state)?;

        if self.should_process_in_batch(&records, &state) {
            self.write_in_batch(records, &state).await
        } else {
            self.write_per_record(records, &state).await
        }
    }

    // ---------------------------------------------------------------
    // Validation
    // ---------------------------------------------------------------

    /// Leader-side integrity validation. Validation progress here runs
    /// ahead of what is persisted; it is never written to disk.
    fn validate_and_filter_duplicates(
        &self,
        records: Vec<ConsumedRecord>,
        state: &Arc<PartitionConsumptionState>,
    ) -> Result<Vec<ConsumedRecord>> {
        if !self.should_produce_downstream(state) {
            return Ok(records);
        }
        let end_of_push_received = state.is_end_of_push_received();
        let mut kept = Vec::with_capacity(records.len());
        for record in records {
            let outcome = self.select_validator().validate(&record);
            match outcome {
                Ok(()) => {
                    self.ctx.stats.record_success_msg();
                    kept.push(record);
                }
                Err(violation) if violation.is_duplicate() => {
                    self.ctx.stats.record_duplicate_msg();
                    debug!(
                        replica = %state.replica_id(),
                        source = %self.source,
                        offset = record.offset,
                        "Skipping a duplicate record"
                    );
                }
                Err(violation) => {
                    self.ctx.stats.record_fatal_div();
                    if end_of_push_received {
                        // Post-EOP violations are logged and swallowed; the
                        // record continues through the pipeline.
                        warn!(
                            replica = %state.replica_id(),
                            offset = record.offset,
                            violation = %violation.describe(),
                            "Integrity violation after end-of-push"
                        );
                        kept.push(record);
                    } else {
                        let error = IngestionError::FatalDataValidation {
                            topic_partition: self.source.clone(),
                            offset: record.offset,
                            reason: violation.describe(),
                        };
                        state.set_ingestion_error(&error);
                        return Err(error);
                    }
                }
            }
        }
        Ok(kept)
    }

    fn select_validator(&self) -> std::sync::MutexGuard<'_, DataIntegrityValidator> {
        let use_rt_tracker = self.ctx.config.global_rt_div_enabled && self.source.is_real_time();
        let validator = if use_rt_tracker {
            &self.rt_validator
        } else {
            &self.vt_validator
        };
        validator.lock().expect("validator poisoned")
    }

    // ---------------------------------------------------------------
    // Record loops
    // ---------------------------------------------------------------

    fn should_process_in_batch(
        &self,
        records: &[ConsumedRecord],
        state: &Arc<PartitionConsumptionState>,
    ) -> bool {
        !records.is_empty()
            && self.ctx.config.active_active_replication_enabled
            && self.ctx.config.parallel_conflict_resolution_enabled
            && state.is_end_of_push_received()
            && self.source.is_real_time()
    }

    async fn write_per_record(
        self: &Arc<Self>,
        records: Vec<ConsumedRecord>,
        state: &Arc<PartitionConsumptionState>,
    ) -> Result<()> {
        let batch_started_ms = epoch_ms();
        let mut total_bytes: u64 = 0;
        let mut queue_put_ms: f64 = 0.0;
        for record in records {
            if !self.ctx.is_running() {
                return Err(IngestionError::Interrupted);
            }
            state.set_latest_polled_timestamp_ms(batch_started_ms);
            if !self.should_process_record(&record, state) {
                state.update_latest_ignored_upstream_offset(&self.upstream_url, record.offset);
                continue;
            }
            self.check_record_shape(&record)?;
            self.wait_ready_to_process(&record).await?;
            total_bytes += self
                .handle_single_record(
                    ProcessedRecord::unprocessed(record),
                    state,
                    false,
                    batch_started_ms,
                    &mut queue_put_ms,
                )
                .await? as u64;
        }
        self.update_metrics_and_enforce_quota(total_bytes, queue_put_ms);
        Ok(())
    }

    async fn write_in_batch(
        self: &Arc<Self>,
        records: Vec<ConsumedRecord>,
        state: &Arc<PartitionConsumptionState>,
    ) -> Result<()> {
        let batch_started_ms = epoch_ms();
        let mut eligible = Vec::with_capacity(records.len());
        for record in records {
            if !self.ctx.is_running() {
                return Err(IngestionError::Interrupted);
            }
            state.set_latest_polled_timestamp_ms(batch_started_ms);
            if !self.should_process_record(&record, state) {
                state.update_latest_ignored_upstream_offset(&self.upstream_url, record.offset);
                continue;
            }
            self.check_record_shape(&record)?;
            self.wait_ready_to_process(&record).await?;
            eligible.push(record);
        }

        let mut total_bytes: u64 = 0;
        let mut queue_put_ms: f64 = 0.0;
        for mini_batch in self.batch_processor.split_into_mini_batches(eligible) {
            let locks = self
                .batch_processor
                .lock_keys(&self.ctx.key_locks, &mini_batch)
                .await;
            let processed = self
                .batch_processor
                .process(
                    mini_batch,
                    state,
                    &self.ctx.storage,
                    &self.ctx.resolver,
                    self.upstream_cluster_id,
                )
                .await;
            let processed = match processed {
                Ok(processed) => processed,
                Err(error) => {
                    locks.release();
                    return Err(error);
                }
            };
            let mut failed = None;
            for wrapper in processed {
                let outcome = self
                    .handle_single_record(wrapper, state, true, batch_started_ms, &mut queue_put_ms)
                    .await;
                match outcome {
                    Ok(bytes) => total_bytes += bytes as u64,
                    Err(error) => {
                        failed = Some(error);
                        break;
                    }
                }
            }
            locks.release();
            if let Some(error) = failed {
                return Err(error);
            }
        }
        self.update_metrics_and_enforce_quota(total_bytes, queue_put_ms);
        Ok(())
    }

    /// Whether the record should be processed at all. Stale real-time
    /// records already produced downstream are dropped here; they show up
    /// when consumption rewinds after a leadership handoff.
    fn should_process_record(
        &self,
        record: &ConsumedRecord,
        state: &Arc<PartitionConsumptionState>,
    ) -> bool {
        if state.ingestion_error().is_some() {
            return false;
        }
        if self.source.is_separate_real_time() && !self.ctx.config.separate_rt_topic_enabled {
            return false;
        }
        if self.source.is_real_time() && self.should_produce_downstream(state) {
            if let Some(produced) = state.latest_rt_offset_tried_to_produce(&self.upstream_url) {
                if record.offset <= produced {
                    return false;
                }
            }
        }
        true
    }

    // ---------------------------------------------------------------
    // Pre-flight: record shape and schema availability
    // ---------------------------------------------------------------

    /// Structural validation, before any waiting or delegation. A record
    /// with a mismatched key/envelope pairing or an unreserved negative
    /// schema id can never become processable, so it fails here instead of
    /// stalling in schema polling.
    fn check_record_shape(&self, record: &ConsumedRecord) -> Result<()> {
        record.validate_shape().map_err(|error| {
            IngestionError::InvalidMessage(format!(
                "{error} for {} at offset {}",
                self.source, record.offset
            ))
        })
    }

    /// Only PUT and UPDATE need the value schema resolved before the record
    /// may proceed.
    async fn wait_ready_to_process(&self, record: &ConsumedRecord) -> Result<()> {
        if record.is_control() {
            return Ok(());
        }
        match &record.value {
            ValueEnvelope::Put { schema_id, .. } | ValueEnvelope::Update { schema_id, .. } => {
                self.wait_schema_available(*schema_id).await
            }
            ValueEnvelope::Delete { .. } | ValueEnvelope::Control(_) => Ok(()),
        }
    }

    async fn wait_schema_available(&self, schema_id: i32) -> Result<()> {
        // Writers not yet integrated with the registry stamp -1.
        if schema_id == -1 {
            return Ok(());
        }
        if schema_id == CHUNK_SCHEMA_ID || schema_id == CHUNKED_VALUE_MANIFEST_SCHEMA_ID {
            let version_state = self.wait_version_state_available().await?;
            if !version_state.chunked {
                return Err(IngestionError::ChunkingNotEnabled(
                    self.ctx.version_topic.clone(),
                ));
            }
            return Ok(());
        }

        let started = Instant::now();
        loop {
            if self.ctx.schemas.is_schema_known(schema_id).await {
                return Ok(());
            }
            let waited_ms = started.elapsed().as_millis() as u64;
            if waited_ms >= self.ctx.config.schema_polling_timeout_ms {
                return Err(IngestionError::SchemaUnavailable {
                    schema_id,
                    waited_ms,
                });
            }
            if !self.ctx.is_running() {
                return Err(IngestionError::Interrupted);
            }
            tokio::time::sleep(Duration::from_millis(self.ctx.config.schema_polling_delay_ms))
                .await;
        }
    }

    async fn wait_version_state_available(&self) -> Result<StoreVersionState> {
        let started = Instant::now();
        loop {
            if let Some(state) = self.ctx.storage.get_store_version_state() {
                return Ok(state);
            }
            let waited_ms = started.elapsed().as_millis() as u64;
            if waited_ms >= self.ctx.config.schema_polling_timeout_ms {
                warn!(
                    topic = %self.ctx.version_topic,
                    waited_ms,
                    "Store version state not available"
                );
                return Err(IngestionError::VersionStateUnavailable(
                    self.ctx.version_topic.clone(),
                ));
            }
            if !self.ctx.is_running() {
                return Err(IngestionError::Interrupted);
            }
            tokio::time::sleep(Duration::from_millis(self.ctx.config.schema_polling_delay_ms))
                .await;
        }
    }

    // ---------------------------------------------------------------
    // Single-record handling
    // ---------------------------------------------------------------

    async fn handle_single_record(
        self: &Arc<Self>,
        wrapper: ProcessedRecord,
        state: &Arc<PartitionConsumptionState>,
        locks_held: bool,
        batch_started_ms: i64,
        queue_put_ms: &mut f64,
    ) -> Result<usize> {
        // START_OF_PUSH primes the store-version state right here at the
        // head of the pipeline; stages below rely on it being present
        // before anything is enqueued.
        if let Some(ControlMessageKind::StartOfPush { sorted, chunked }) =
            wrapper.record.control_kind()
        {
            self.process_start_of_push(*sorted, *chunked, state);
        }

        let record_started = Instant::now();
        let result = self
            .delegate_record_maybe_with_lock(&wrapper, state, locks_held, record_started)
            .await?;

        let record = wrapper.record;
        match result {
            DelegateResult::QueuedToDrainer => {
                let put_started = Instant::now();
                self.ctx
                    .drainer
                    .put(
                        record.clone(),
                        self.source.partition,
                        &self.upstream_url,
                        batch_started_ms,
                    )
                    .await?;
                *queue_put_ms += put_started.elapsed().as_secs_f64() * 1_000.0;
            }
            DelegateResult::ProducedToDownstream | DelegateResult::Skipped => {}
        }

        state.set_latest_consumed_timestamp_ms(batch_started_ms);
        Ok(record.payload_size())
    }

    fn process_start_of_push(
        &self,
        sorted: bool,
        chunked: bool,
        state: &Arc<PartitionConsumptionState>,
    ) {
        if self.ctx.storage.get_store_version_state().is_none() {
            self.ctx
                .storage
                .put_store_version_state(StoreVersionState::from_start_of_push(sorted, chunked));
            info!(
                replica = %state.replica_id(),
                sorted,
                chunked,
                "Primed store version state from START_OF_PUSH"
            );
        }
    }

    async fn delegate_record_maybe_with_lock(
        self: &Arc<Self>,
        wrapper: &ProcessedRecord,
        state: &Arc<PartitionConsumptionState>,
        locks_held: bool,
        record_started: Instant,
    ) -> Result<DelegateResult> {
        let needs_lock = self.ctx.config.active_active_replication_enabled
            && self.source.is_real_time()
            && !locks_held;
        if !needs_lock {
            // Version-topic consumption has a single source; the batch path
            // already holds its mini-batch's key locks.
            return self.delegate_record(wrapper, state, record_started).await;
        }
        // Read prior value, resolve conflict, update the transient cache
        // and queue the produce as one critical section per key, so writes
        // from other regions interleave at record granularity.
        let _lock = self
            .ctx
            .key_locks
            .acquire_one(wrapper.record.key.bytes.clone())
            .await;
        self.delegate_record(wrapper, state, record_started).await
    }

    async fn delegate_record(
        self: &Arc<Self>,
        wrapper: &ProcessedRecord,
        state: &Arc<PartitionConsumptionState>,
        record_started: Instant,
    ) -> Result<DelegateResult> {
        let record = &wrapper.record;
        let should_produce = self.should_produce_downstream(state);

        // UPDATE is only legal where it can be produced downstream.
        if matches!(record.value, ValueEnvelope::Update { .. }) && !should_produce {
            return Err(IngestionError::InvalidMessage(format!(
                "received UPDATE on non-producing path for {} at offset {}",
                self.source, record.offset
            )));
        }

        if !should_produce {
            if state.is_leader()
                && matches!(record.control_kind(), Some(ControlMessageKind::EndOfPush))
                && self.consuming_local_version_topic()
            {
                // Local batch data is already in the version topic; only
                // the producer handle changes for the real-time workload.
                info!(
                    replica = %state.replica_id(),
                    "Switching to the real-time producer after END_OF_PUSH"
                );
                if let Some(producer) = state.producer() {
                    producer.flush().await?;
                }
                state.switch_producer(Arc::clone(&self.ctx.real_time_producer));
                state.mark_end_of_push_received();
            } else if matches!(record.control_kind(), Some(ControlMessageKind::EndOfPush)) {
                state.mark_end_of_push_received();
            }
            return Ok(DelegateResult::QueuedToDrainer);
        }

        self.validate_record_before_producing(state)?;

        if self.source.is_real_time() {
            self.ctx.stats.record_region_hybrid_bytes_consumed(
                self.upstream_cluster_id,
                record.payload_size() as u64,
            );
            state.update_latest_consumed_rt_offset(&self.upstream_url, record.offset);
        }

        self.ctx
            .stats
            .record_leader_preprocessing_latency_ms(record_started.elapsed().as_secs_f64() * 1_000.0);

        if let Some(kind) = record.control_kind() {
            return self.delegate_control_message(record, kind.clone(), state).await;
        }

        self.process_data_record(wrapper, state).await
    }

    async fn delegate_control_message(
        self: &Arc<Self>,
        record: &ConsumedRecord,
        kind: ControlMessageKind,
        state: &Arc<PartitionConsumptionState>,
    ) -> Result<DelegateResult> {
        let mut produced = true;
        let result = match &kind {
            ControlMessageKind::StartOfPush { .. } => {
                self.produce_to_version_topic(record, state, ProduceMode::PassThrough(record), false, None)
                    .await?;
                DelegateResult::ProducedToDownstream
            }
            ControlMessageKind::EndOfPush => {
                self.produce_to_version_topic(record, state, ProduceMode::PassThrough(record), false, None)
                    .await?;
                // Flush the batch workload out, then switch the producer
                // for the real-time workload.
                self.current_producer(state).flush().await?;
                info!(
                    replica = %state.replica_id(),
                    "Switching to the real-time producer after END_OF_PUSH"
                );
                state.switch_producer(Arc::clone(&self.ctx.real_time_producer));
                state.mark_end_of_push_received();
                DelegateResult::ProducedToDownstream
            }
            ControlMessageKind::StartOfSegment | ControlMessageKind::EndOfSegment { .. } => {
                if !self.source.is_real_time() {
                    self.produce_to_version_topic(record, state, ProduceMode::PassThrough(record), false, None)
                        .await?;
                    DelegateResult::ProducedToDownstream
                } else if heartbeat::is_heartbeat(record) {
                    self.propagate_heartbeat(record, state).await?;
                    DelegateResult::ProducedToDownstream
                } else {
                    // Segment bookkeeping from the real-time topic has no
                    // downstream counterpart; validation already saw it.
                    produced = false;
                    DelegateResult::Skipped
                }
            }
            ControlMessageKind::StartOfIncrementalPush { version }
            | ControlMessageKind::EndOfIncrementalPush { version } => {
                if !self.ctx.config.incremental_push_enabled {
                    warn!(
                        replica = %state.replica_id(),
                        push_version = %version,
                        "Dropping incremental-push control message; feature disabled"
                    );
                    produced = false;
                    DelegateResult::Skipped
                } else {
                    // Destination partition is preserved; incremental
                    // pushes to the real-time topic land on the matching
                    // version-topic partition.
                    self.produce_to_version_topic(record, state, ProduceMode::PassThrough(record), false, None)
                        .await?;
                    DelegateResult::ProducedToDownstream
                }
            }
            ControlMessageKind::TopicSwitch {
                source_brokers,
                source_topic,
                rewind_start_timestamp_ms,
            } => {
                if self.ctx.config.is_data_recovery && !state.is_batch_only() {
                    // Keep reading the local version topic; the retired
                    // real-time data we still need is only there.
                    return Ok(DelegateResult::Skipped);
                }
                state.set_topic_switch(TopicSwitchInfo {
                    source_topic: source_topic.clone(),
                    source_brokers: source_brokers.clone(),
                    rewind_start_timestamp_ms: *rewind_start_timestamp_ms,
                });
                // The upstream position after a switch comes from the
                // message body; suppress offset advancement.
                self.produce_to_version_topic(record, state, ProduceMode::PassThrough(record), true, None)
                    .await?;
                DelegateResult::ProducedToDownstream
            }
            ControlMessageKind::VersionSwap { .. } => {
                return Ok(DelegateResult::QueuedToDrainer);
            }
        };

        if !kind.is_segment_control() {
            info!(
                replica = %state.replica_id(),
                control = kind.name(),
                produced,
                source = %self.source,
                offset = record.offset,
                "Handled control message"
            );
        }
        Ok(result)
    }

    async fn process_data_record(
        self: &Arc<Self>,
        wrapper: &ProcessedRecord,
        state: &Arc<PartitionConsumptionState>,
    ) -> Result<DelegateResult> {
        let record = &wrapper.record;
        let config = &self.ctx.config;

        // Conflict resolution starts only after end-of-push, and not while
        // data recovery is still replaying the version topic.
        if config.active_active_replication_enabled
            && state.is_end_of_push_received()
            && (!config.is_data_recovery || state.topic_switch().is_some())
        {
            return self.process_active_active_record(wrapper, state).await;
        }

        if !state.is_end_of_push_received() {
            // Pass-through keeps upstream producer metadata intact so
            // follower validation stays continuous across failover.
            self.produce_to_version_topic(record, state, ProduceMode::PassThrough(record), false, None)
                .await?;
            return Ok(DelegateResult::ProducedToDownstream);
        }

        match &record.value {
            ValueEnvelope::Put { .. } | ValueEnvelope::Delete { .. } => {
                let mode = ProduceMode::Regenerated {
                    key: record.key.clone(),
                    value: record.value.clone(),
                    headers: RecordHeaders::new(),
                    logical_timestamp_ms: record.producer.message_timestamp_ms,
                };
                self.produce_to_version_topic(record, state, mode, false, None)
                    .await?;
                Ok(DelegateResult::ProducedToDownstream)
            }
            ValueEnvelope::Update {
                schema_id,
                update_bytes,
            } => {
                // Write-compute produced an empty result: nothing to write.
                if update_bytes.is_empty() {
                    return Ok(DelegateResult::Skipped);
                }
                let mode = ProduceMode::Regenerated {
                    key: record.key.clone(),
                    value: ValueEnvelope::put(*schema_id, update_bytes.clone()),
                    headers: RecordHeaders::new(),
                    logical_timestamp_ms: record.producer.message_timestamp_ms,
                };
                self.produce_to_version_topic(record, state, mode, false, None)
                    .await?;
                Ok(DelegateResult::ProducedToDownstream)
            }
            ValueEnvelope::Control(_) => Err(IngestionError::InvalidMessage(format!(
                "unrecognized operation for {} at offset {}",
                self.source, record.offset
            ))),
        }
    }

    // ---------------------------------------------------------------
    // Active/active path
    // ---------------------------------------------------------------

    async fn process_active_active_record(
        self: &Arc<Self>,
        wrapper: &ProcessedRecord,
        state: &Arc<PartitionConsumptionState>,
    ) -> Result<DelegateResult> {
        let record = &wrapper.record;
        let outcome = match &wrapper.merge {
            Some(outcome) => outcome.clone(),
            None => {
                let prior = read_prior_value(
                    state,
                    &self.ctx.storage,
                    state.partition(),
                    &record.key.bytes,
                )
                .await?;
                self.ctx
                    .resolver
                    .merge(record, prior.as_ref(), self.upstream_cluster_id)?
            }
        };

        let (new_value, new_schema_id, rmd) = match &outcome.result {
            MergeConflictResult::UpdateIgnored => return Ok(DelegateResult::Skipped),
            MergeConflictResult::NewPut {
                value, schema_id, rmd, ..
            } => (Some(value.clone()), *schema_id, rmd.clone()),
            MergeConflictResult::Tombstone { schema_id, rmd } => (None, *schema_id, rmd.clone()),
        };

        // Transient cache update happens under the key lock held by the
        // caller, before the produce is queued.
        let rmd_bytes = rmd.encode();
        state.put_transient_record(
            record.key.bytes.clone(),
            TransientRecord {
                value: new_value.clone(),
                schema_id: new_schema_id,
                replication_metadata: rmd_bytes.clone(),
            },
        );

        if self.ctx.view_writers.is_empty() {
            let (handle, gate) = completion_pair();
            state.swap_last_vt_produce_gate(gate);
            match self.produce_put_or_delete(record, &outcome, state).await {
                Ok(()) => handle.complete(),
                Err(error) => {
                    handle.fail(CompletionError(error.to_string()));
                    return Err(error);
                }
            }
            return Ok(DelegateResult::ProducedToDownstream);
        }

        // Fan out to all views in parallel; the version-topic produce fires
        // only after every view future and the previous produce's queue
        // future completed. The new gate is installed before it resolves so
        // the next record chains on it.
        let fanout_started = Instant::now();
        let (handle, gate) = completion_pair();
        let previous_gate = state.swap_last_vt_produce_gate(gate);

        let view_futures: Vec<_> = self
            .ctx
            .view_writers
            .iter()
            .map(|view| {
                let view_name = view.name().to_string();
                view.process_record(
                    new_value.clone(),
                    outcome.old_value.clone(),
                    record.key.bytes.clone(),
                    self.ctx.store_version,
                    new_schema_id,
                    outcome.old_schema_id,
                    Some(rmd_bytes.clone()),
                )
                .map(move |result| {
                    result.map_err(|reason| IngestionError::ViewWrite {
                        view: view_name,
                        reason,
                    })
                })
            })
            .collect();

        let receiver = Arc::clone(self);
        let state_for_task = Arc::clone(state);
        let record_for_task = record.clone();
        let outcome_for_task = outcome.clone();
        let stats = Arc::clone(&self.ctx.stats);
        tokio::spawn(async move {
            let gating = async {
                previous_gate
                    .await
                    .map_err(|error| IngestionError::ViewWrite {
                        view: "version-topic-chain".to_string(),
                        reason: error.to_string(),
                    })?;
                future::try_join_all(view_futures).await?;
                Ok::<(), IngestionError>(())
            }
            .await;
            stats.record_view_produce_latency_ms(fanout_started.elapsed().as_secs_f64() * 1_000.0);

            match gating {
                Ok(()) => {
                    match receiver
                        .produce_put_or_delete(&record_for_task, &outcome_for_task, &state_for_task)
                        .await
                    {
                        Ok(()) => handle.complete(),
                        Err(error) => {
                            state_for_task.set_ingestion_error(&error);
                            handle.fail(CompletionError(error.to_string()));
                        }
                    }
                }
                Err(error) => {
                    state_for_task.set_ingestion_error(&error);
                    handle.fail(CompletionError(error.to_string()));
                }
            }
        });

        Ok(DelegateResult::ProducedToDownstream)
    }

    /// Turn a winning merge into the version-topic write: a put with the
    /// updated replication metadata, or a delete for a tombstone.
    async fn produce_put_or_delete(
        self: &Arc<Self>,
        record: &ConsumedRecord,
        outcome: &MergeConflictOutcome,
        state: &Arc<PartitionConsumptionState>,
    ) -> Result<()> {
        let rmd_version_id = self.ctx.resolver.rmd_protocol_version_id();
        match &outcome.result {
            MergeConflictResult::UpdateIgnored => Ok(()),
            MergeConflictResult::Tombstone { schema_id, rmd } => {
                self.ctx.stats.record_tombstone_created_dcr();
                let mode = ProduceMode::Regenerated {
                    key: record.key.clone(),
                    value: ValueEnvelope::Delete {
                        schema_id: *schema_id,
                        replication_metadata_version_id: rmd_version_id,
                        replication_metadata_payload: rmd.encode(),
                    },
                    headers: RecordHeaders::new(),
                    logical_timestamp_ms: record.producer.message_timestamp_ms,
                };
                self.produce_to_version_topic(record, state, mode, false, None)
                    .await
            }
            MergeConflictResult::NewPut {
                value,
                schema_id,
                rmd,
                reuses_input,
            } => {
                // Conflict-resolved values travel with their schema id
                // in-band: the staging frame is stamped with the winning id
                // and its snapshot becomes the wire value. When the payload
                // is the incoming record's own value, the callback restores
                // the original header once the produce settles.
                let frame = Arc::new(SchemaHeaderedBuffer::new(*schema_id, value));
                let restore_hook = match (&record.value, *reuses_input) {
                    (
                        ValueEnvelope::Put {
                            schema_id: original,
                            ..
                        },
                        true,
                    ) => {
                        let original = *original;
                        let restore = Arc::clone(&frame);
                        Some(Arc::new(move || restore.stamp(original)) as Arc<dyn Fn() + Send + Sync>)
                    }
                    _ => None,
                };
                let mode = ProduceMode::Regenerated {
                    key: record.key.clone(),
                    value: ValueEnvelope::Put {
                        schema_id: *schema_id,
                        value: frame.bytes(),
                        replication_metadata_version_id: rmd_version_id,
                        replication_metadata_payload: rmd.encode(),
                    },
                    headers: RecordHeaders::new(),
                    logical_timestamp_ms: record.producer.message_timestamp_ms,
                };
                self.produce_to_version_topic(record, state, mode, false, restore_hook)
                    .await
            }
        }
    }

    // ---------------------------------------------------------------
    // Produce plumbing
    // ---------------------------------------------------------------

    async fn propagate_heartbeat(
        self: &Arc<Self>,
        record: &ConsumedRecord,
        state: &Arc<PartitionConsumptionState>,
    ) -> Result<()> {
        let mode = ProduceMode::Regenerated {
            key: RecordKey::heartbeat(),
            value: ValueEnvelope::Control(ControlMessageKind::StartOfSegment),
            headers: heartbeat::heartbeat_headers(state.is_completion_reported()),
            logical_timestamp_ms: heartbeat::heartbeat_origin_timestamp(record),
        };
        self.produce_to_version_topic(record, state, mode, false, None)
            .await
    }

    async fn produce_to_version_topic(
        self: &Arc<Self>,
        record: &ConsumedRecord,
        state: &Arc<PartitionConsumptionState>,
        mode: ProduceMode<'_>,
        suppress_upstream_offset: bool,
        restore_hook: Option<Arc<dyn Fn() + Send + Sync>>,
    ) -> Result<()> {
        let downstream_partition = self.source.partition;
        let drained_template = match &mode {
            ProduceMode::PassThrough(original) => (*original).clone(),
            ProduceMode::Regenerated {
                key,
                value,
                logical_timestamp_ms,
                ..
            } => ConsumedRecord::new(
                key.clone(),
                value.clone(),
                ProducerMetadata::new(self.ctx.local_producer_guid, 0, 0, *logical_timestamp_ms),
                -1,
                *logical_timestamp_ms,
            ),
        };

        let context = Arc::new(LeaderProducedRecordContext::new(drained_template));
        state.set_last_persist_future(context.persist_future());

        let leader_callback = LeaderProducerCallback::new(
            Arc::clone(&self.ctx.registry),
            state.partition(),
            downstream_partition,
            self.upstream_url.clone(),
            record.timestamp_ms,
            Arc::clone(&context),
            Arc::clone(&self.ctx.drainer),
            Arc::clone(&self.ctx.stats),
        );
        let callback: Arc<dyn ProduceCallback> =
            if self.ctx.config.active_active_replication_enabled {
                let aa_callback = ActiveActiveProducerCallback::new(leader_callback);
                if let Some(hook) = restore_hook {
                    aa_callback.set_on_completion_hook(hook);
                }
                Arc::new(aa_callback)
            } else {
                Arc::new(leader_callback)
            };

        let leader_metadata = if suppress_upstream_offset {
            LeaderMetadata::suppressed(self.upstream_cluster_id)
        } else {
            LeaderMetadata::new(record.offset, self.upstream_cluster_id)
        };

        let producer = self.current_producer(state);
        let produce_started = Instant::now();
        match mode {
            ProduceMode::PassThrough(original) => {
                producer
                    .send_pass_through(
                        &self.ctx.version_topic,
                        downstream_partition,
                        original,
                        leader_metadata,
                        callback,
                    )
                    .await?
            }
            ProduceMode::Regenerated {
                key,
                value,
                headers,
                logical_timestamp_ms,
            } => {
                producer
                    .send(
                        &self.ctx.version_topic,
                        downstream_partition,
                        key,
                        value,
                        headers,
                        logical_timestamp_ms,
                        leader_metadata,
                        callback,
                    )
                    .await?
            }
        }
        self.ctx
            .stats
            .record_leader_produce_latency_ms(produce_started.elapsed().as_secs_f64() * 1_000.0);

        // The message is on its way to the broker, though not necessarily
        // acknowledged yet.
        if self.ctx.config.active_active_replication_enabled
            && state.is_leader()
            && state.is_hybrid()
            && self.source.is_real_time()
        {
            state.update_latest_rt_offset_tried_to_produce(&self.upstream_url, record.offset);
        }
        Ok(())
    }

    fn current_producer(&self, state: &Arc<PartitionConsumptionState>) -> Arc<dyn LogProducer> {
        let batch_producer = Arc::clone(&self.ctx.batch_producer);
        state.producer_or_init(move || batch_producer)
    }

    // ---------------------------------------------------------------
    // Safety checks and bookkeeping
    // ---------------------------------------------------------------

    fn should_produce_downstream(&self, state: &Arc<PartitionConsumptionState>) -> bool {
        state.is_leader() && !self.consuming_local_version_topic()
    }

    /// Local version-topic consumption, as opposed to remote version-topic
    /// consumption during native replication (same topic name, remote
    /// cluster).
    fn consuming_local_version_topic(&self) -> bool {
        self.source.topic == self.ctx.version_topic
            && self.upstream_cluster_id == self.ctx.local_cluster_id
    }

    /// A leader must never consume from the local version topic and produce
    /// back into it. The broker-URL comparison catches the case a stale
    /// cluster-id mapping missed.
    fn validate_record_before_producing(
        &self,
        state: &Arc<PartitionConsumptionState>,
    ) -> Result<()> {
        if self.source.topic == self.ctx.version_topic
            && self.upstream_url == self.ctx.local_broker_url
        {
            let error = IngestionError::FeedbackLoop {
                partition: state.partition(),
                topic: self.ctx.version_topic.clone(),
                broker_url: self.upstream_url.clone(),
            };
            state.set_ingestion_error(&error);
            return Err(error);
        }
        Ok(())
    }

    fn update_metrics_and_enforce_quota(&self, total_bytes: u64, queue_put_ms: f64) {
        // Quota runs even for an empty poll; it may resume a paused
        // partition.
        self.ctx
            .quota
            .enforce_partition_quota(self.source.partition, total_bytes);
        if queue_put_ms > 0.0 {
            self.ctx.stats.record_queue_put_latency_ms(queue_put_ms);
        }
        self.ctx
            .stats
            .record_storage_quota_used(self.ctx.quota.disk_quota_usage());
    }
}

fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System time before UNIX epoch")
        .as_millis() as i64
}
