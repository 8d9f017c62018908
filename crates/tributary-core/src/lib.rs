//! Core data model for Tributary.
//!
//! This crate defines the wire-level types shared by every Tributary
//! component: the record envelope consumed from the commit log, control
//! messages, producer metadata used for data-integrity validation, and
//! topic-partition identity.

pub mod envelope;
pub mod error;
pub mod state;
pub mod topic;

pub use envelope::{
    ConsumedRecord, ControlMessageKind, LeaderCompleteState, ProducerMetadata, RecordHeaders,
    RecordKey, ValueEnvelope, CHUNKED_VALUE_MANIFEST_SCHEMA_ID, CHUNK_SCHEMA_ID, HEART_BEAT_KEY,
    LEADER_COMPLETE_STATE_HEADER,
};
pub use error::{Error, Result};
pub use state::StoreVersionState;
pub use topic::{
    TopicKind, TopicPartition, REAL_TIME_TOPIC_SUFFIX, SEPARATE_REAL_TIME_TOPIC_SUFFIX,
};
