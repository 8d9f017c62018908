//! Active/Active Conflict Resolution
//!
//! When the same key is written concurrently from multiple regions, each
//! leader deterministically resolves the conflict before producing to the
//! version topic. Resolution compares the incoming write's timestamp against
//! the replication metadata stored with the prior value; ties favor the
//! incoming write so replay converges.
//!
//! ## Results
//!
//! - `UpdateIgnored` — the stored value wins; nothing is produced.
//! - `NewPut` — the incoming value wins; produced with updated metadata.
//! - `Tombstone` — a winning delete; produced as a delete carrying the
//!   updated metadata so remote regions can order it.
//!
//! Chunked values additionally carry the manifests of the old value and old
//! metadata so the downstream writer can retire the superseded chunks.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tributary_core::{ConsumedRecord, ValueEnvelope};

use crate::error::{IngestionError, Result};
use crate::interfaces::ValueRecord;

/// The stored state a record is resolved against: the prior value (absent
/// for a tombstone) plus the replication metadata, which survives deletion
/// so a stale put cannot resurrect a newer tombstone.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorRecord {
    pub value: Option<Bytes>,
    pub schema_id: i32,
    pub replication_metadata: Option<Bytes>,
}

impl From<ValueRecord> for PriorRecord {
    fn from(record: ValueRecord) -> Self {
        Self {
            value: Some(record.value),
            schema_id: record.schema_id,
            replication_metadata: record.replication_metadata,
        }
    }
}

/// Replication metadata stored next to each value in an active/active store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationMetadata {
    /// Timestamp of the write this metadata describes.
    pub update_timestamp_ms: i64,
    /// Upstream offsets that contributed to the current value, by source
    /// cluster id.
    pub offset_vector: Vec<(i32, i64)>,
}

impl ReplicationMetadata {
    pub fn new(update_timestamp_ms: i64) -> Self {
        Self {
            update_timestamp_ms,
            offset_vector: Vec::new(),
        }
    }

    pub fn observe_offset(&mut self, cluster_id: i32, offset: i64) {
        match self
            .offset_vector
            .iter_mut()
            .find(|(id, _)| *id == cluster_id)
        {
            Some((_, existing)) => {
                if offset > *existing {
                    *existing = offset;
                }
            }
            None => self.offset_vector.push((cluster_id, offset)),
        }
    }

    pub fn encode(&self) -> Bytes {
        Bytes::from(serde_json::to_vec(self).expect("replication metadata serializes"))
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

/// Manifest describing the chunks of a chunked value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkedValueManifest {
    pub chunk_keys: Vec<Bytes>,
    pub total_value_size: usize,
    pub schema_id: i32,
}

/// Outcome of conflict resolution for one incoming record.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeConflictResult {
    UpdateIgnored,
    NewPut {
        value: Bytes,
        schema_id: i32,
        rmd: ReplicationMetadata,
        /// Set when the merged value is the incoming record's own payload;
        /// the produce path then restores the staging frame's original
        /// header after the produce settles.
        reuses_input: bool,
    },
    Tombstone {
        schema_id: i32,
        rmd: ReplicationMetadata,
    },
}

impl MergeConflictResult {
    pub fn is_update_ignored(&self) -> bool {
        matches!(self, MergeConflictResult::UpdateIgnored)
    }
}

/// Conflict result plus everything the produce and view fan-out paths need
/// about the superseded value.
#[derive(Debug, Clone)]
pub struct MergeConflictOutcome {
    pub result: MergeConflictResult,
    pub old_value: Option<Bytes>,
    pub old_schema_id: i32,
    pub old_rmd: Option<Bytes>,
    pub old_value_manifest: Option<ChunkedValueManifest>,
    pub old_rmd_manifest: Option<ChunkedValueManifest>,
}

impl MergeConflictOutcome {
    pub fn is_update_ignored(&self) -> bool {
        self.result.is_update_ignored()
    }
}

/// Timestamp-based resolver. The replication-metadata protocol version is
/// stamped on every produced record so followers pick the right decoder.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    rmd_protocol_version_id: i32,
}

impl ConflictResolver {
    pub fn new(rmd_protocol_version_id: i32) -> Self {
        Self {
            rmd_protocol_version_id,
        }
    }

    pub fn rmd_protocol_version_id(&self) -> i32 {
        self.rmd_protocol_version_id
    }

    /// Resolve `incoming` against the stored prior value, if any.
    ///
    /// `incoming` must be a data record; control messages never reach
    /// conflict resolution.
    pub fn merge(
        &self,
        incoming: &ConsumedRecord,
        prior: Option<&PriorRecord>,
        upstream_cluster_id: i32,
    ) -> Result<MergeConflictOutcome> {
        let incoming_ts = incoming.producer.message_timestamp_ms;
        let prior_rmd = prior
            .and_then(|p| p.replication_metadata.as_deref())
            .and_then(ReplicationMetadata::decode);
        let prior_ts = prior_rmd
            .as_ref()
            .map(|rmd| rmd.update_timestamp_ms)
            .unwrap_or(i64::MIN);

        let old_value = prior.and_then(|p| p.value.clone());
        let old_schema_id = prior.map(|p| p.schema_id).unwrap_or(-1);
        let old_rmd = prior.and_then(|p| p.replication_metadata.clone());

        let result = if incoming_ts < prior_ts {
            MergeConflictResult::UpdateIgnored
        } else {
            let mut rmd = prior_rmd.unwrap_or_else(|| ReplicationMetadata::new(incoming_ts));
            rmd.update_timestamp_ms = incoming_ts;
            rmd.observe_offset(upstream_cluster_id, incoming.offset);

            match &incoming.value {
                ValueEnvelope::Put {
                    schema_id, value, ..
                } => MergeConflictResult::NewPut {
                    value: value.clone(),
                    schema_id: *schema_id,
                    rmd,
                    reuses_input: true,
                },
                ValueEnvelope::Update {
                    schema_id,
                    update_bytes,
                } => {
                    // Write-compute: the update payload is the precomputed
                    // new value for this schema; field-level application is
                    // the schema layer's concern.
                    MergeConflictResult::NewPut {
                        value: update_bytes.clone(),
                        schema_id: *schema_id,
                        rmd,
                        reuses_input: false,
                    }
                }
                ValueEnvelope::Delete { schema_id, .. } => MergeConflictResult::Tombstone {
                    schema_id: *schema_id,
                    rmd,
                },
                ValueEnvelope::Control(kind) => {
                    return Err(IngestionError::InvalidMessage(format!(
                        "control message {} at offset {} reached conflict resolution",
                        kind.name(),
                        incoming.offset
                    )))
                }
            }
        };

        Ok(MergeConflictOutcome {
            result,
            old_value,
            old_schema_id,
            old_rmd,
            old_value_manifest: None,
            old_rmd_manifest: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tributary_core::{ProducerMetadata, RecordKey};

    fn resolver() -> ConflictResolver {
        ConflictResolver::new(1)
    }

    fn put_record(timestamp_ms: i64, value: &'static [u8]) -> ConsumedRecord {
        ConsumedRecord::new(
            RecordKey::data(Bytes::from_static(&[0x2A])),
            ValueEnvelope::put(3, Bytes::from_static(value)),
            ProducerMetadata::new(1, 0, 1, timestamp_ms),
            10,
            timestamp_ms,
        )
    }

    fn delete_record(timestamp_ms: i64) -> ConsumedRecord {
        ConsumedRecord::new(
            RecordKey::data(Bytes::from_static(&[0x2A])),
            ValueEnvelope::Delete {
                schema_id: 3,
                replication_metadata_version_id: 1,
                replication_metadata_payload: Bytes::new(),
            },
            ProducerMetadata::new(1, 0, 2, timestamp_ms),
            11,
            timestamp_ms,
        )
    }

    fn prior(timestamp_ms: i64, value: &'static [u8]) -> PriorRecord {
        PriorRecord::from(
            ValueRecord::new(Bytes::from_static(value), 3)
                .with_replication_metadata(ReplicationMetadata::new(timestamp_ms).encode()),
        )
    }

    #[test]
    fn test_newer_put_wins() {
        let outcome = resolver()
            .merge(&put_record(2_000, b"new"), Some(&prior(1_000, b"old")), 0)
            .unwrap();
        match outcome.result {
            MergeConflictResult::NewPut { value, rmd, .. } => {
                assert_eq!(value, Bytes::from_static(b"new"));
                assert_eq!(rmd.update_timestamp_ms, 2_000);
            }
            other => panic!("expected NewPut, got {:?}", other),
        }
        assert_eq!(outcome.old_value, Some(Bytes::from_static(b"old")));
        assert_eq!(outcome.old_schema_id, 3);
    }

    #[test]
    fn test_older_put_is_ignored() {
        let outcome = resolver()
            .merge(&put_record(500, b"stale"), Some(&prior(1_000, b"old")), 0)
            .unwrap();
        assert!(outcome.is_update_ignored());
    }

    #[test]
    fn test_tie_favors_incoming() {
        let outcome = resolver()
            .merge(&put_record(1_000, b"tie"), Some(&prior(1_000, b"old")), 0)
            .unwrap();
        assert!(matches!(outcome.result, MergeConflictResult::NewPut { .. }));
    }

    #[test]
    fn test_put_without_prior_wins() {
        let outcome = resolver().merge(&put_record(1, b"first"), None, 0).unwrap();
        assert!(matches!(outcome.result, MergeConflictResult::NewPut { .. }));
        assert_eq!(outcome.old_value, None);
        assert_eq!(outcome.old_schema_id, -1);
    }

    #[test]
    fn test_winning_delete_becomes_tombstone() {
        let outcome = resolver()
            .merge(&delete_record(2_000), Some(&prior(1_000, b"old")), 0)
            .unwrap();
        match outcome.result {
            MergeConflictResult::Tombstone { schema_id, rmd } => {
                assert_eq!(schema_id, 3);
                assert_eq!(rmd.update_timestamp_ms, 2_000);
            }
            other => panic!("expected Tombstone, got {:?}", other),
        }
    }

    #[test]
    fn test_losing_delete_is_ignored() {
        let outcome = resolver()
            .merge(&delete_record(500), Some(&prior(1_000, b"old")), 0)
            .unwrap();
        assert!(outcome.is_update_ignored());
    }

    #[test]
    fn test_offset_vector_advances_monotonically() {
        let mut rmd = ReplicationMetadata::new(1);
        rmd.observe_offset(0, 5);
        rmd.observe_offset(0, 3);
        rmd.observe_offset(1, 7);
        assert_eq!(rmd.offset_vector, vec![(0, 5), (1, 7)]);
        rmd.observe_offset(0, 9);
        assert_eq!(rmd.offset_vector, vec![(0, 9), (1, 7)]);
    }

    #[test]
    fn test_rmd_encode_decode_roundtrip() {
        let mut rmd = ReplicationMetadata::new(42);
        rmd.observe_offset(2, 100);
        let decoded = ReplicationMetadata::decode(&rmd.encode()).unwrap();
        assert_eq!(decoded, rmd);
    }

    #[test]
    fn test_prior_without_rmd_loses_to_any_incoming() {
        let prior = PriorRecord::from(ValueRecord::new(Bytes::from_static(b"bare"), 3));
        let outcome = resolver().merge(&put_record(i64::MIN + 1, b"new"), Some(&prior), 0).unwrap();
        assert!(matches!(outcome.result, MergeConflictResult::NewPut { .. }));
    }

    #[test]
    fn test_merge_records_upstream_offset_in_rmd() {
        let outcome = resolver().merge(&put_record(2_000, b"new"), None, 7).unwrap();
        match outcome.result {
            MergeConflictResult::NewPut { rmd, .. } => {
                assert_eq!(rmd.offset_vector, vec![(7, 10)]);
            }
            other => panic!("expected NewPut, got {:?}", other),
        }
    }
}
