//! Partition Consumption State
//!
//! Authoritative mutable state for one assigned partition: replica role,
//! end-of-push progress, per-upstream offset bookkeeping, the
//! version-topic produce ordering gate and the lazily materialized
//! downstream producer handle.
//!
//! ## Ownership
//!
//! The state is owned by the partition's ingestion task. Producer
//! acknowledgement tasks interact with it only through thread-safe future
//! completion and the monotone offset maps; they resolve the state through
//! [`PartitionStateRegistry`] by partition id, and an absent entry means
//! the partition was unsubscribed — the record is skipped, never faulted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use tracing::debug;

use crate::completion::{completed, CompletionFuture};
use crate::error::IngestionError;
use crate::interfaces::LogProducer;

/// Role of this replica for one partition. Role changes are driven by the
/// cluster controller; the pipeline only observes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaRole {
    Follower,
    Leader,
    InTransition,
}

/// A value cached between closely spaced writes to the same key, avoiding a
/// disk read on the next conflict resolution. `None` value means the key
/// was tombstoned. Updated only under the key-level lock.
#[derive(Debug, Clone, PartialEq)]
pub struct TransientRecord {
    pub value: Option<Bytes>,
    pub schema_id: i32,
    pub replication_metadata: Bytes,
}

/// Observed TOPIC_SWITCH instruction for this partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSwitchInfo {
    pub source_topic: String,
    pub source_brokers: Vec<String>,
    pub rewind_start_timestamp_ms: i64,
}

/// Static traits of the store version this partition belongs to.
#[derive(Debug, Clone, Copy, Default)]
pub struct PartitionFlags {
    pub is_hybrid: bool,
    pub is_batch_only: bool,
    pub is_data_recovery: bool,
}

pub struct PartitionConsumptionState {
    partition: u32,
    replica_id: String,
    flags: PartitionFlags,

    role: RwLock<ReplicaRole>,
    end_of_push_received: AtomicBool,
    completion_reported: AtomicBool,

    /// Highest upstream offset the leader tried to produce downstream, per
    /// source broker URL. Monotone; smaller values are silently rejected.
    leader_offset_by_upstream: Mutex<HashMap<String, i64>>,
    /// Highest upstream offset skipped without processing, per source URL.
    latest_ignored_upstream_offset: Mutex<HashMap<String, i64>>,
    /// Highest real-time offset the leader has consumed, per source URL.
    latest_consumed_rt_offset: Mutex<HashMap<String, i64>>,

    last_polled_ts_ms: AtomicI64,
    last_consumed_ts_ms: AtomicI64,

    /// Resolves when the most recent version-topic produce call has been
    /// queued (not necessarily acknowledged). Initially ready.
    last_vt_produce_gate: Mutex<CompletionFuture>,
    /// Resolves when the most recent produced record has been acknowledged
    /// and handed to the drainer.
    last_persist_future: Mutex<CompletionFuture>,

    producer_handle: Mutex<Option<Arc<dyn LogProducer>>>,

    topic_switch: Mutex<Option<TopicSwitchInfo>>,
    ingestion_error: Mutex<Option<String>>,

    transient_records: Mutex<HashMap<Bytes, TransientRecord>>,
}

impl PartitionConsumptionState {
    pub fn new(version_topic: &str, partition: u32, role: ReplicaRole, flags: PartitionFlags) -> Self {
        Self {
            partition,
            replica_id: format!("{version_topic}-{partition}"),
            flags,
            role: RwLock::new(role),
            end_of_push_received: AtomicBool::new(false),
            completion_reported: AtomicBool::new(false),
            leader_offset_by_upstream: Mutex::new(HashMap::new()),
            latest_ignored_upstream_offset: Mutex::new(HashMap::new()),
            latest_consumed_rt_offset: Mutex::new(HashMap::new()),
            last_polled_ts_ms: AtomicI64::new(0),
            last_consumed_ts_ms: AtomicI64::new(0),
            last_vt_produce_gate: Mutex::new(completed()),
            last_persist_future: Mutex::new(completed()),
            producer_handle: Mutex::new(None),
            topic_switch: Mutex::new(None),
            ingestion_error: Mutex::new(None),
            transient_records: Mutex::new(HashMap::new()),
        }
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// Identity of this replica for logging.
    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    pub fn is_hybrid(&self) -> bool {
        self.flags.is_hybrid
    }

    pub fn is_batch_only(&self) -> bool {
        self.flags.is_batch_only
    }

    pub fn is_data_recovery(&self) -> bool {
        self.flags.is_data_recovery
    }

    // ---------------------------------------------------------------
    // Role and push progress
    // ---------------------------------------------------------------

    pub fn role(&self) -> ReplicaRole {
        *self.role.read().expect("role lock poisoned")
    }

    pub fn set_role(&self, role: ReplicaRole) {
        *self.role.write().expect("role lock poisoned") = role;
    }

    pub fn is_leader(&self) -> bool {
        self.role() == ReplicaRole::Leader
    }

    pub fn is_end_of_push_received(&self) -> bool {
        self.end_of_push_received.load(Ordering::Acquire)
    }

    /// Monotone; once set it never clears.
    pub fn mark_end_of_push_received(&self) {
        self.end_of_push_received.store(true, Ordering::Release);
    }

    pub fn is_completion_reported(&self) -> bool {
        self.completion_reported.load(Ordering::Acquire)
    }

    pub fn mark_completion_reported(&self) {
        self.completion_reported.store(true, Ordering::Release);
    }

    // ---------------------------------------------------------------
    // Offset bookkeeping (monotone per upstream URL)
    // ---------------------------------------------------------------

    /// Record the highest real-time offset the leader tried to produce to
    /// the version topic. Smaller offsets are rejected silently.
    pub fn update_latest_rt_offset_tried_to_produce(&self, upstream_url: &str, offset: i64) {
        Self::update_monotone(&self.leader_offset_by_upstream, upstream_url, offset);
    }

    pub fn latest_rt_offset_tried_to_produce(&self, upstream_url: &str) -> Option<i64> {
        self.leader_offset_by_upstream
            .lock()
            .expect("offset map poisoned")
            .get(upstream_url)
            .copied()
    }

    pub fn update_latest_ignored_upstream_offset(&self, upstream_url: &str, offset: i64) {
        Self::update_monotone(&self.latest_ignored_upstream_offset, upstream_url, offset);
    }

    pub fn latest_ignored_upstream_offset(&self, upstream_url: &str) -> Option<i64> {
        self.latest_ignored_upstream_offset
            .lock()
            .expect("offset map poisoned")
            .get(upstream_url)
            .copied()
    }

    pub fn update_latest_consumed_rt_offset(&self, upstream_url: &str, offset: i64) {
        Self::update_monotone(&self.latest_consumed_rt_offset, upstream_url, offset);
    }

    pub fn latest_consumed_rt_offset(&self, upstream_url: &str) -> Option<i64> {
        self.latest_consumed_rt_offset
            .lock()
            .expect("offset map poisoned")
            .get(upstream_url)
            .copied()
    }

    fn update_monotone(map: &Mutex<HashMap<String, i64>>, upstream_url: &str, offset: i64) {
        let mut map = map.lock().expect("offset map poisoned");
        match map.get_mut(upstream_url) {
            Some(existing) if *existing >= offset => {}
            Some(existing) => *existing = offset,
            None => {
                map.insert(upstream_url.to_string(), offset);
            }
        }
    }

    // ---------------------------------------------------------------
    // Wall-clock markers
    // ---------------------------------------------------------------

    pub fn set_latest_polled_timestamp_ms(&self, ts: i64) {
        self.last_polled_ts_ms.store(ts, Ordering::Relaxed);
    }

    pub fn latest_polled_timestamp_ms(&self) -> i64 {
        self.last_polled_ts_ms.load(Ordering::Relaxed)
    }

    pub fn set_latest_consumed_timestamp_ms(&self, ts: i64) {
        self.last_consumed_ts_ms.store(ts, Ordering::Relaxed);
    }

    pub fn latest_consumed_timestamp_ms(&self) -> i64 {
        self.last_consumed_ts_ms.load(Ordering::Relaxed)
    }

    // ---------------------------------------------------------------
    // Ordering futures
    // ---------------------------------------------------------------

    /// Install the gate the *next* version-topic produce must wait on, and
    /// return the previous one. The new gate is installed before it
    /// resolves so the chain observes produce-call order, not ack order.
    pub fn swap_last_vt_produce_gate(&self, next: CompletionFuture) -> CompletionFuture {
        let mut gate = self.last_vt_produce_gate.lock().expect("gate poisoned");
        std::mem::replace(&mut *gate, next)
    }

    pub fn last_vt_produce_gate(&self) -> CompletionFuture {
        self.last_vt_produce_gate
            .lock()
            .expect("gate poisoned")
            .clone()
    }

    pub fn set_last_persist_future(&self, future: CompletionFuture) {
        *self.last_persist_future.lock().expect("persist poisoned") = future;
    }

    pub fn last_persist_future(&self) -> CompletionFuture {
        self.last_persist_future
            .lock()
            .expect("persist poisoned")
            .clone()
    }

    // ---------------------------------------------------------------
    // Producer handle
    // ---------------------------------------------------------------

    /// Current producer handle, materializing it from `init` on first use.
    pub fn producer_or_init(
        &self,
        init: impl FnOnce() -> Arc<dyn LogProducer>,
    ) -> Arc<dyn LogProducer> {
        let mut handle = self.producer_handle.lock().expect("producer poisoned");
        match &*handle {
            Some(producer) => Arc::clone(producer),
            None => {
                let producer = init();
                debug!(replica = %self.replica_id, "Materialized downstream producer handle");
                *handle = Some(Arc::clone(&producer));
                producer
            }
        }
    }

    /// Swap in the real-time producer; called once end-of-push has been
    /// produced and flushed.
    pub fn switch_producer(&self, producer: Arc<dyn LogProducer>) {
        *self.producer_handle.lock().expect("producer poisoned") = Some(producer);
    }

    /// Current producer handle without materializing one.
    pub fn producer(&self) -> Option<Arc<dyn LogProducer>> {
        self.producer_handle
            .lock()
            .expect("producer poisoned")
            .clone()
    }

    pub fn has_producer(&self) -> bool {
        self.producer_handle
            .lock()
            .expect("producer poisoned")
            .is_some()
    }

    // ---------------------------------------------------------------
    // Topic switch, errors, transient cache
    // ---------------------------------------------------------------

    pub fn set_topic_switch(&self, info: TopicSwitchInfo) {
        *self.topic_switch.lock().expect("topic switch poisoned") = Some(info);
    }

    pub fn topic_switch(&self) -> Option<TopicSwitchInfo> {
        self.topic_switch
            .lock()
            .expect("topic switch poisoned")
            .clone()
    }

    /// Record a partition-scoped failure. The first error wins; later ones
    /// are kept out so the root cause is what surfaces.
    pub fn set_ingestion_error(&self, error: &IngestionError) {
        let mut slot = self.ingestion_error.lock().expect("error slot poisoned");
        if slot.is_none() {
            *slot = Some(error.to_string());
        }
    }

    pub fn ingestion_error(&self) -> Option<String> {
        self.ingestion_error
            .lock()
            .expect("error slot poisoned")
            .clone()
    }

    pub fn transient_record(&self, key: &[u8]) -> Option<TransientRecord> {
        self.transient_records
            .lock()
            .expect("transient cache poisoned")
            .get(key)
            .cloned()
    }

    pub fn put_transient_record(&self, key: Bytes, record: TransientRecord) {
        self.transient_records
            .lock()
            .expect("transient cache poisoned")
            .insert(key, record);
    }

    pub fn evict_transient_record(&self, key: &[u8]) {
        self.transient_records
            .lock()
            .expect("transient cache poisoned")
            .remove(key);
    }
}

/// Live partition states, looked up by partition id.
///
/// Callbacks carry the partition id rather than the state object; a lookup
/// miss after unsubscribe yields a skip instead of a fault.
#[derive(Default)]
pub struct PartitionStateRegistry {
    states: RwLock<HashMap<u32, Arc<PartitionConsumptionState>>>,
}

impl PartitionStateRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, state: Arc<PartitionConsumptionState>) {
        self.states
            .write()
            .expect("registry poisoned")
            .insert(state.partition(), state);
    }

    pub fn get(&self, partition: u32) -> Option<Arc<PartitionConsumptionState>> {
        self.states
            .read()
            .expect("registry poisoned")
            .get(&partition)
            .cloned()
    }

    pub fn remove(&self, partition: u32) -> Option<Arc<PartitionConsumptionState>> {
        self.states
            .write()
            .expect("registry poisoned")
            .remove(&partition)
    }

    pub fn len(&self) -> usize {
        self.states.read().expect("registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
