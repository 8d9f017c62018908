//! Record Envelope
//!
//! This module defines the unit of data Tributary ingests from the commit
//! log: a keyed, offset-stamped envelope that is either a data operation
//! (put / update / delete) or a control message delimiting the lifecycle of
//! a push.
//!
//! ## Structure
//!
//! Each consumed record carries:
//! - **key**: raw key bytes plus a control-message marker
//! - **value**: the tagged operation payload (`ValueEnvelope`)
//! - **producer**: per-producer segment metadata used by data-integrity
//!   validation (GUID, segment number, sequence number, timestamp)
//! - **offset**: position of the record in its source partition
//! - **timestamp_ms**: broker ingress time of the record
//! - **headers**: opaque per-record headers (e.g. leader completion state)
//!
//! ## Design Decisions
//!
//! - Uses `bytes::Bytes` for zero-copy key/value handling
//! - Producer metadata travels with every record so that validation state
//!   survives leadership failover (pass-through production keeps it intact)
//! - Chunking sentinel schema ids are negative and reserved, so they can
//!   never collide with registry-assigned ids

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Key bytes reserved for heartbeat control messages.
pub const HEART_BEAT_KEY: &[u8] = b"HEART_BEAT";

/// Schema id marking a value chunk of a larger, chunked value.
pub const CHUNK_SCHEMA_ID: i32 = -10;

/// Schema id marking the manifest that stitches value chunks together.
pub const CHUNKED_VALUE_MANIFEST_SCHEMA_ID: i32 = -20;

/// Header key under which leaders stamp their completion state when
/// forwarding heartbeats downstream.
pub const LEADER_COMPLETE_STATE_HEADER: &str = "leader_complete_state";

/// Key of a consumed record.
///
/// Control messages and data records share the key space; the marker bit
/// distinguishes them, mirroring how the log envelope is framed on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordKey {
    pub bytes: Bytes,
    pub is_control: bool,
}

impl RecordKey {
    pub fn data(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            is_control: false,
        }
    }

    pub fn control(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            is_control: true,
        }
    }

    /// The reserved heartbeat key.
    pub fn heartbeat() -> Self {
        Self::control(Bytes::from_static(HEART_BEAT_KEY))
    }

    pub fn is_heartbeat(&self) -> bool {
        self.is_control && self.bytes.as_ref() == HEART_BEAT_KEY
    }
}

/// Per-producer segment metadata carried by every record.
///
/// A producer writes records in segments; within a segment the sequence
/// number increments by exactly one per record. The validator replays this
/// bookkeeping on the consumer side to detect gaps, duplicates and
/// corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerMetadata {
    pub producer_guid: u128,
    pub segment_number: u32,
    pub sequence_number: i32,
    pub message_timestamp_ms: i64,
}

impl ProducerMetadata {
    pub fn new(
        producer_guid: u128,
        segment_number: u32,
        sequence_number: i32,
        message_timestamp_ms: i64,
    ) -> Self {
        Self {
            producer_guid,
            segment_number,
            sequence_number,
            message_timestamp_ms,
        }
    }
}

/// Control messages delimiting push lifecycle and producer segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlMessageKind {
    StartOfPush {
        sorted: bool,
        chunked: bool,
    },
    EndOfPush,
    StartOfSegment,
    EndOfSegment {
        /// Rolling checksum over the data payloads of the segment.
        checksum: u32,
    },
    StartOfIncrementalPush {
        version: String,
    },
    EndOfIncrementalPush {
        version: String,
    },
    TopicSwitch {
        source_brokers: Vec<String>,
        source_topic: String,
        rewind_start_timestamp_ms: i64,
    },
    VersionSwap {
        old_version: i32,
        new_version: i32,
    },
}

impl ControlMessageKind {
    pub fn name(&self) -> &'static str {
        match self {
            ControlMessageKind::StartOfPush { .. } => "START_OF_PUSH",
            ControlMessageKind::EndOfPush => "END_OF_PUSH",
            ControlMessageKind::StartOfSegment => "START_OF_SEGMENT",
            ControlMessageKind::EndOfSegment { .. } => "END_OF_SEGMENT",
            ControlMessageKind::StartOfIncrementalPush { .. } => "START_OF_INCREMENTAL_PUSH",
            ControlMessageKind::EndOfIncrementalPush { .. } => "END_OF_INCREMENTAL_PUSH",
            ControlMessageKind::TopicSwitch { .. } => "TOPIC_SWITCH",
            ControlMessageKind::VersionSwap { .. } => "VERSION_SWAP",
        }
    }

    /// Segment control messages are emitted continuously and are not worth
    /// logging individually.
    pub fn is_segment_control(&self) -> bool {
        matches!(
            self,
            ControlMessageKind::StartOfSegment | ControlMessageKind::EndOfSegment { .. }
        )
    }
}

/// The tagged operation payload of a consumed record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValueEnvelope {
    Put {
        schema_id: i32,
        value: Bytes,
        replication_metadata_version_id: i32,
        replication_metadata_payload: Bytes,
    },
    Update {
        schema_id: i32,
        update_bytes: Bytes,
    },
    Delete {
        schema_id: i32,
        replication_metadata_version_id: i32,
        replication_metadata_payload: Bytes,
    },
    Control(ControlMessageKind),
}

impl ValueEnvelope {
    pub fn put(schema_id: i32, value: impl Into<Bytes>) -> Self {
        ValueEnvelope::Put {
            schema_id,
            value: value.into(),
            replication_metadata_version_id: -1,
            replication_metadata_payload: Bytes::new(),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            ValueEnvelope::Put { .. } => "PUT",
            ValueEnvelope::Update { .. } => "UPDATE",
            ValueEnvelope::Delete { .. } => "DELETE",
            ValueEnvelope::Control(kind) => kind.name(),
        }
    }

    /// Payload bytes carried by this envelope, for quota accounting.
    pub fn payload_size(&self) -> usize {
        match self {
            ValueEnvelope::Put {
                value,
                replication_metadata_payload,
                ..
            } => value.len() + replication_metadata_payload.len(),
            ValueEnvelope::Update { update_bytes, .. } => update_bytes.len(),
            ValueEnvelope::Delete {
                replication_metadata_payload,
                ..
            } => replication_metadata_payload.len(),
            ValueEnvelope::Control(_) => 0,
        }
    }
}

/// Opaque per-record headers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordHeaders(Vec<(String, Bytes)>);

impl RecordHeaders {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Bytes>) {
        let key = key.into();
        self.0.retain(|(k, _)| *k != key);
        self.0.push((key, value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&Bytes> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Leader completion state propagated to followers via heartbeat headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaderCompleteState {
    LeaderCompleted,
    LeaderNotCompleted,
}

impl LeaderCompleteState {
    pub fn from_completion_reported(completed: bool) -> Self {
        if completed {
            LeaderCompleteState::LeaderCompleted
        } else {
            LeaderCompleteState::LeaderNotCompleted
        }
    }

    pub fn header_value(&self) -> Bytes {
        match self {
            LeaderCompleteState::LeaderCompleted => Bytes::from_static(b"1"),
            LeaderCompleteState::LeaderNotCompleted => Bytes::from_static(b"0"),
        }
    }
}

/// A single record consumed from an upstream topic-partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumedRecord {
    pub key: RecordKey,
    pub value: ValueEnvelope,
    pub producer: ProducerMetadata,
    pub offset: i64,
    pub timestamp_ms: i64,
    #[serde(default)]
    pub headers: RecordHeaders,
}

impl ConsumedRecord {
    pub fn new(
        key: RecordKey,
        value: ValueEnvelope,
        producer: ProducerMetadata,
        offset: i64,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            key,
            value,
            producer,
            offset,
            timestamp_ms,
            headers: RecordHeaders::new(),
        }
    }

    pub fn is_control(&self) -> bool {
        self.key.is_control
    }

    pub fn control_kind(&self) -> Option<&ControlMessageKind> {
        match &self.value {
            ValueEnvelope::Control(kind) => Some(kind),
            _ => None,
        }
    }

    /// Estimate of the bytes this record contributed to the poll.
    pub fn payload_size(&self) -> usize {
        self.key.bytes.len() + self.value.payload_size()
    }

    /// Structural validation of the key/envelope pairing and schema id.
    ///
    /// Control messages travel under control keys and data operations
    /// under data keys. Valid schema ids are positive registry ids, `-1`
    /// for writers not yet integrated with the registry, and the chunking
    /// sentinels.
    pub fn validate_shape(&self) -> Result<()> {
        if self.key.is_control != matches!(self.value, ValueEnvelope::Control(_)) {
            return Err(Error::MalformedEnvelope(format!(
                "control key = {}, envelope = {}",
                self.key.is_control,
                self.value.kind_name()
            )));
        }
        let schema_id = match &self.value {
            ValueEnvelope::Put { schema_id, .. }
            | ValueEnvelope::Update { schema_id, .. }
            | ValueEnvelope::Delete { schema_id, .. } => *schema_id,
            ValueEnvelope::Control(_) => return Ok(()),
        };
        if schema_id > 0
            || schema_id == -1
            || schema_id == CHUNK_SCHEMA_ID
            || schema_id == CHUNKED_VALUE_MANIFEST_SCHEMA_ID
        {
            Ok(())
        } else {
            Err(Error::InvalidSchemaId(schema_id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn producer_meta(seq: i32) -> ProducerMetadata {
        ProducerMetadata::new(7, 0, seq, 1_700_000_000_000)
    }

    // ---------------------------------------------------------------
    // Keys
    // ---------------------------------------------------------------

    #[test]
    fn test_data_key_is_not_control() {
        let key = RecordKey::data(Bytes::from_static(&[0x01]));
        assert!(!key.is_control);
        assert!(!key.is_heartbeat());
    }

    #[test]
    fn test_heartbeat_key_round_trip() {
        let key = RecordKey::heartbeat();
        assert!(key.is_control);
        assert!(key.is_heartbeat());
        assert_eq!(key.bytes.as_ref(), HEART_BEAT_KEY);
    }

    #[test]
    fn test_control_key_with_other_bytes_is_not_heartbeat() {
        let key = RecordKey::control(Bytes::from_static(b"segment"));
        assert!(key.is_control);
        assert!(!key.is_heartbeat());
    }

    // ---------------------------------------------------------------
    // Envelope
    // ---------------------------------------------------------------

    #[test]
    fn test_payload_size_put() {
        let envelope = ValueEnvelope::Put {
            schema_id: 1,
            value: Bytes::from_static(b"abcde"),
            replication_metadata_version_id: 1,
            replication_metadata_payload: Bytes::from_static(b"rmd"),
        };
        assert_eq!(envelope.payload_size(), 8);
    }

    #[test]
    fn test_payload_size_control_is_zero() {
        let envelope = ValueEnvelope::Control(ControlMessageKind::EndOfPush);
        assert_eq!(envelope.payload_size(), 0);
    }

    #[test]
    fn test_record_payload_size_includes_key() {
        let record = ConsumedRecord::new(
            RecordKey::data(Bytes::from_static(b"kk")),
            ValueEnvelope::put(1, Bytes::from_static(b"vvv")),
            producer_meta(0),
            42,
            1,
        );
        assert_eq!(record.payload_size(), 5);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(ValueEnvelope::put(1, Bytes::new()).kind_name(), "PUT");
        assert_eq!(
            ValueEnvelope::Control(ControlMessageKind::TopicSwitch {
                source_brokers: vec![],
                source_topic: "s_rt".into(),
                rewind_start_timestamp_ms: 0,
            })
            .kind_name(),
            "TOPIC_SWITCH"
        );
    }

    #[test]
    fn test_segment_control_classification() {
        assert!(ControlMessageKind::StartOfSegment.is_segment_control());
        assert!(ControlMessageKind::EndOfSegment { checksum: 0 }.is_segment_control());
        assert!(!ControlMessageKind::EndOfPush.is_segment_control());
    }

    #[test]
    fn test_control_kind_accessor() {
        let record = ConsumedRecord::new(
            RecordKey::control(Bytes::new()),
            ValueEnvelope::Control(ControlMessageKind::EndOfPush),
            producer_meta(3),
            10,
            1,
        );
        assert!(record.is_control());
        assert_eq!(record.control_kind(), Some(&ControlMessageKind::EndOfPush));
    }

    // ---------------------------------------------------------------
    // Shape validation
    // ---------------------------------------------------------------

    #[test]
    fn test_validate_shape_accepts_data_record() {
        let record = ConsumedRecord::new(
            RecordKey::data(Bytes::from_static(b"k")),
            ValueEnvelope::put(1, Bytes::from_static(b"v")),
            producer_meta(0),
            0,
            1,
        );
        record.validate_shape().unwrap();
    }

    #[test]
    fn test_validate_shape_accepts_control_record() {
        let record = ConsumedRecord::new(
            RecordKey::control(Bytes::new()),
            ValueEnvelope::Control(ControlMessageKind::EndOfPush),
            producer_meta(0),
            0,
            1,
        );
        record.validate_shape().unwrap();
    }

    #[test]
    fn test_validate_shape_rejects_control_envelope_under_data_key() {
        let record = ConsumedRecord::new(
            RecordKey::data(Bytes::from_static(b"k")),
            ValueEnvelope::Control(ControlMessageKind::StartOfSegment),
            producer_meta(0),
            0,
            1,
        );
        let error = record.validate_shape().unwrap_err();
        assert!(matches!(error, Error::MalformedEnvelope(_)));
    }

    #[test]
    fn test_validate_shape_rejects_data_envelope_under_control_key() {
        let record = ConsumedRecord::new(
            RecordKey::control(Bytes::from_static(b"k")),
            ValueEnvelope::put(1, Bytes::from_static(b"v")),
            producer_meta(0),
            0,
            1,
        );
        assert!(record.validate_shape().is_err());
    }

    #[test]
    fn test_validate_shape_rejects_unreserved_negative_schema_id() {
        for bad in [0, -2, -7] {
            let record = ConsumedRecord::new(
                RecordKey::data(Bytes::from_static(b"k")),
                ValueEnvelope::put(bad, Bytes::from_static(b"v")),
                producer_meta(0),
                0,
                1,
            );
            let error = record.validate_shape().unwrap_err();
            assert!(matches!(error, Error::InvalidSchemaId(id) if id == bad));
        }
    }

    #[test]
    fn test_validate_shape_accepts_reserved_schema_ids() {
        for reserved in [-1, CHUNK_SCHEMA_ID, CHUNKED_VALUE_MANIFEST_SCHEMA_ID] {
            let record = ConsumedRecord::new(
                RecordKey::data(Bytes::from_static(b"k")),
                ValueEnvelope::put(reserved, Bytes::from_static(b"v")),
                producer_meta(0),
                0,
                1,
            );
            record.validate_shape().unwrap();
        }
    }

    // ---------------------------------------------------------------
    // Headers
    // ---------------------------------------------------------------

    #[test]
    fn test_headers_insert_and_get() {
        let mut headers = RecordHeaders::new();
        headers.insert(LEADER_COMPLETE_STATE_HEADER, Bytes::from_static(b"1"));
        assert_eq!(
            headers.get(LEADER_COMPLETE_STATE_HEADER),
            Some(&Bytes::from_static(b"1"))
        );
        assert_eq!(headers.get("missing"), None);
    }

    #[test]
    fn test_headers_insert_replaces_existing() {
        let mut headers = RecordHeaders::new();
        headers.insert("k", Bytes::from_static(b"a"));
        headers.insert("k", Bytes::from_static(b"b"));
        assert_eq!(headers.get("k"), Some(&Bytes::from_static(b"b")));
    }

    #[test]
    fn test_leader_complete_state_header_values() {
        assert_eq!(
            LeaderCompleteState::from_completion_reported(true),
            LeaderCompleteState::LeaderCompleted
        );
        assert_eq!(
            LeaderCompleteState::from_completion_reported(false).header_value(),
            Bytes::from_static(b"0")
        );
    }

    // ---------------------------------------------------------------
    // Serde round-trip
    // ---------------------------------------------------------------

    #[test]
    fn test_serde_roundtrip_record() {
        let mut record = ConsumedRecord::new(
            RecordKey::data(Bytes::from_static(&[0x2A])),
            ValueEnvelope::Put {
                schema_id: 3,
                value: Bytes::from_static(b"new"),
                replication_metadata_version_id: 1,
                replication_metadata_payload: Bytes::from_static(b"{}"),
            },
            producer_meta(5),
            100,
            1_700_000_000_123,
        );
        record
            .headers
            .insert(LEADER_COMPLETE_STATE_HEADER, Bytes::from_static(b"1"));

        let json = serde_json::to_string(&record).expect("serialize");
        let parsed: ConsumedRecord = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(record, parsed);
    }

    #[test]
    fn test_chunking_sentinels_are_distinct_and_negative() {
        assert!(CHUNK_SCHEMA_ID < 0);
        assert!(CHUNKED_VALUE_MANIFEST_SCHEMA_ID < 0);
        assert_ne!(CHUNK_SCHEMA_ID, CHUNKED_VALUE_MANIFEST_SCHEMA_ID);
    }
}
