//! Error Types for the Ingestion Pipeline
//!
//! ## Error Categories
//!
//! ### Fatal per-partition errors
//! - `FatalDataValidation`: an unrecoverable integrity violation before
//!   end-of-push; the partition stops, others continue
//! - `SchemaUnavailable`: a data record referenced a schema id the registry
//!   never resolved within the polling timeout
//! - `ChunkingNotEnabled`: chunked payloads observed in a store version
//!   without chunking support
//! - `FeedbackLoop`: a leader detected it would produce back into the
//!   version topic it is consuming from
//!
//! ### Recoverable / flow errors
//! - `Interrupted`: the task observed shutdown at a suspension point;
//!   propagated unchanged, quota updates are skipped
//! - `Produce` / `ViewWrite` / `Drainer`: downstream write failures,
//!   recorded against the partition
//!
//! All fatal errors halt only their partition. There are no retries at this
//! layer; retries live in the consumer and producer clients.

use thiserror::Error;
use tributary_core::TopicPartition;

/// Failure reported by the downstream log producer.
///
/// Cloneable so it can flow through shared completion futures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("produce failed: {0}")]
pub struct ProduceError(pub String);

#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("Fatal data validation error for {topic_partition} at offset {offset}: {reason}")]
    FatalDataValidation {
        topic_partition: TopicPartition,
        offset: i64,
        reason: String,
    },

    #[error("Value schema id {schema_id} not available after {waited_ms} ms")]
    SchemaUnavailable { schema_id: i32, waited_ms: u64 },

    #[error("Store version state not available for topic: {0}")]
    VersionStateUnavailable(String),

    #[error("Detected chunking in store version {0} where chunking is not enabled")]
    ChunkingNotEnabled(String),

    #[error(transparent)]
    Produce(#[from] ProduceError),

    #[error("View writer {view} failed: {reason}")]
    ViewWrite { view: String, reason: String },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Parallel worker failed: {0}")]
    Worker(String),

    #[error("Ingestion interrupted")]
    Interrupted,

    #[error(
        "Partition {partition} is consuming from local version topic {topic} and producing back \
         to it, broker: {broker_url}"
    )]
    FeedbackLoop {
        partition: u32,
        topic: String,
        broker_url: String,
    },

    #[error("Partition {partition} is in error state: {message}")]
    PartitionErrored { partition: u32, message: String },

    #[error("Topic {0} got deleted")]
    TopicDeleted(String),

    #[error("Drainer rejected record: {0}")]
    Drainer(String),

    #[error("Storage engine error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, IngestionError>;
