//! Tributary Ingestion Pipeline
//!
//! The per-partition ingestion pipeline of a leader replica: consumes
//! records for one topic-partition of the commit log, validates data
//! integrity, decides for each record whether to produce a derived record
//! to the version topic or queue it for local persistence, resolves
//! active/active replication conflicts, and coordinates with view-side
//! writers.
//!
//! ## Modules
//!
//! - [`receiver`] — `PartitionReceiver`, the `write()` entry point and the
//!   per-record delegation state machine
//! - [`div`] — per-producer segment integrity validation
//! - [`partition_state`] — per-partition consumption state and registry
//! - [`key_lock`] — refcounted key-level locks for read-modify-write
//! - [`batch`] — mini-batch parallel conflict resolution
//! - [`merge`] — active/active conflict resolution and replication metadata
//! - [`producer`] — leader produce callbacks and durability futures
//! - [`drainer`] — bounded hand-off to the storage-apply stage
//! - [`heartbeat`] — leader-completion heartbeat propagation
//! - [`interfaces`] — traits for every consumed capability
//! - [`config`] / [`stats`] / [`completion`] / [`error`] — ambient plumbing

pub mod batch;
pub mod completion;
pub mod config;
pub mod div;
pub mod drainer;
pub mod error;
pub mod heartbeat;
pub mod interfaces;
pub mod key_lock;
pub mod merge;
pub mod partition_state;
pub mod producer;
pub mod receiver;
pub mod stats;

pub use config::{IngestionConfig, IngestionConfigBuilder};
pub use drainer::{ChannelDrainer, DrainedEntry, Drainer};
pub use error::{IngestionError, ProduceError, Result};
pub use interfaces::{
    LeaderMetadata, LogConsumer, LogProducer, ProduceAck, ProduceCallback, QuotaManager,
    SchemaRegistry, StorageEngine, UnlimitedQuota, ValueRecord, ViewWriter,
};
pub use merge::{ConflictResolver, MergeConflictOutcome, MergeConflictResult, ReplicationMetadata};
pub use partition_state::{
    PartitionConsumptionState, PartitionFlags, PartitionStateRegistry, ReplicaRole,
};
pub use receiver::{DelegateResult, IngestionContext, IngestionContextBuilder, PartitionReceiver};
pub use stats::{NullStatsSink, StatsSink, NULL_INGESTION_STATS};
