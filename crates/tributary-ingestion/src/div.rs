//! Data Integrity Validation
//!
//! Replays per-producer segment bookkeeping on the consumer side to detect
//! gaps, duplicates and corruption in the record stream.
//!
//! ## Model
//!
//! Every producer writes in segments. A segment opens with
//! `START_OF_SEGMENT`, carries data records whose sequence numbers increment
//! by exactly one, and closes with `END_OF_SEGMENT` carrying a rolling
//! checksum over the data payloads. The validator tracks, per producer GUID,
//! the current segment number, the last sequence number seen, the
//! accumulated checksum and the segment status.
//!
//! ## Outcomes
//!
//! - **Ok** — tracker state advances.
//! - **Duplicate** — `sequence_number <= last_seen` within the same segment
//!   (or a record from an already-superseded segment). Non-fatal; the
//!   record must be dropped from downstream processing.
//! - **Fatal** — a sequence gap, a checksum mismatch on `END_OF_SEGMENT`,
//!   or data in a segment that was never started. Before end-of-push this
//!   stops the partition; after end-of-push the caller logs and swallows it.
//!
//! A brand-new producer GUID starting at sequence 0 without an explicit
//! `START_OF_SEGMENT` is tolerated: a leader failover replays the stream
//! from a position where the segment opener may already be behind us.

use std::collections::HashMap;

use tributary_core::{ConsumedRecord, ControlMessageKind, ValueEnvelope};

/// A single validation violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DivViolation {
    /// Sequence advanced by more than one within a segment.
    SequenceGap {
        producer_guid: u128,
        segment: u32,
        expected: i32,
        actual: i32,
    },
    /// Data observed for a segment that has not been started.
    MissingStartOfSegment { producer_guid: u128, segment: u32 },
    /// END_OF_SEGMENT checksum did not match the accumulated one.
    ChecksumMismatch {
        producer_guid: u128,
        segment: u32,
        expected: u32,
        actual: u32,
    },
    /// Sequence number at or below the last one seen for this segment.
    Duplicate {
        producer_guid: u128,
        segment: u32,
        sequence: i32,
    },
}

impl DivViolation {
    /// Duplicates are dropped and counted; everything else is fatal before
    /// end-of-push.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, DivViolation::Duplicate { .. })
    }

    pub fn describe(&self) -> String {
        match self {
            DivViolation::SequenceGap {
                producer_guid,
                segment,
                expected,
                actual,
            } => format!(
                "sequence gap for producer {producer_guid:x} segment {segment}: expected {expected}, got {actual}"
            ),
            DivViolation::MissingStartOfSegment {
                producer_guid,
                segment,
            } => format!(
                "data for unstarted segment {segment} of producer {producer_guid:x}"
            ),
            DivViolation::ChecksumMismatch {
                producer_guid,
                segment,
                expected,
                actual,
            } => format!(
                "checksum mismatch for producer {producer_guid:x} segment {segment}: expected {expected:#010x}, got {actual:#010x}"
            ),
            DivViolation::Duplicate {
                producer_guid,
                segment,
                sequence,
            } => format!(
                "duplicate sequence {sequence} for producer {producer_guid:x} segment {segment}"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentStatus {
    InProgress,
    Ended,
}

#[derive(Debug)]
struct SegmentState {
    segment_number: u32,
    last_sequence: i32,
    checksum: crc32fast::Hasher,
    status: SegmentStatus,
}

impl SegmentState {
    fn new(segment_number: u32, first_sequence: i32) -> Self {
        Self {
            segment_number,
            last_sequence: first_sequence,
            checksum: crc32fast::Hasher::new(),
            status: SegmentStatus::InProgress,
        }
    }
}

/// Tracks segment state per producer GUID for one upstream topic of one
/// partition. Owned and mutated only by the partition's ingestion task.
#[derive(Debug, Default)]
pub struct DataIntegrityValidator {
    producers: HashMap<u128, SegmentState>,
}

impl DataIntegrityValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate one record, advancing tracker state on success.
    pub fn validate(&mut self, record: &ConsumedRecord) -> Result<(), DivViolation> {
        let meta = record.producer;
        let guid = meta.producer_guid;
        let is_start_of_segment = matches!(
            record.control_kind(),
            Some(ControlMessageKind::StartOfSegment)
        );

        let state = match self.producers.get_mut(&guid) {
            Some(state) => state,
            None => {
                if !is_start_of_segment && meta.sequence_number != 0 {
                    return Err(DivViolation::MissingStartOfSegment {
                        producer_guid: guid,
                        segment: meta.segment_number,
                    });
                }
                self.producers.insert(
                    guid,
                    SegmentState::new(meta.segment_number, meta.sequence_number),
                );
                self.accumulate(record, guid);
                return Ok(());
            }
        };

        if meta.segment_number > state.segment_number {
            // New segment; legal when opened by SOS or replayed from zero.
            if !is_start_of_segment && meta.sequence_number != 0 {
                return Err(DivViolation::MissingStartOfSegment {
                    producer_guid: guid,
                    segment: meta.segment_number,
                });
            }
            *state = SegmentState::new(meta.segment_number, meta.sequence_number);
            self.accumulate(record, guid);
            return Ok(());
        }

        if meta.segment_number < state.segment_number {
            return Err(DivViolation::Duplicate {
                producer_guid: guid,
                segment: meta.segment_number,
                sequence: meta.sequence_number,
            });
        }

        // Same segment.
        if meta.sequence_number <= state.last_sequence {
            return Err(DivViolation::Duplicate {
                producer_guid: guid,
                segment: meta.segment_number,
                sequence: meta.sequence_number,
            });
        }

        if state.status == SegmentStatus::Ended {
            return Err(DivViolation::MissingStartOfSegment {
                producer_guid: guid,
                segment: meta.segment_number,
            });
        }

        if meta.sequence_number != state.last_sequence + 1 {
            return Err(DivViolation::SequenceGap {
                producer_guid: guid,
                segment: meta.segment_number,
                expected: state.last_sequence + 1,
                actual: meta.sequence_number,
            });
        }

        if let Some(ControlMessageKind::EndOfSegment { checksum }) = record.control_kind() {
            let actual = state.checksum.clone().finalize();
            if actual != *checksum {
                return Err(DivViolation::ChecksumMismatch {
                    producer_guid: guid,
                    segment: meta.segment_number,
                    expected: *checksum,
                    actual,
                });
            }
            state.last_sequence = meta.sequence_number;
            state.status = SegmentStatus::Ended;
            return Ok(());
        }

        state.last_sequence = meta.sequence_number;
        self.accumulate(record, guid);
        Ok(())
    }

    /// Rolling checksum the way producers compute it: data-record key and
    /// value bytes only; control messages other than END_OF_SEGMENT do not
    /// contribute.
    fn accumulate(&mut self, record: &ConsumedRecord, guid: u128) {
        if record.is_control() {
            return;
        }
        if let Some(state) = self.producers.get_mut(&guid) {
            state.checksum.update(&record.key.bytes);
            match &record.value {
                ValueEnvelope::Put { value, .. } => state.checksum.update(value),
                ValueEnvelope::Update { update_bytes, .. } => state.checksum.update(update_bytes),
                ValueEnvelope::Delete { .. } | ValueEnvelope::Control(_) => {}
            }
        }
    }

    /// Checksum a producer would carry in END_OF_SEGMENT at this point.
    pub fn current_checksum(&self, producer_guid: u128) -> Option<u32> {
        self.producers
            .get(&producer_guid)
            .map(|state| state.checksum.clone().finalize())
    }

    /// Number of producers currently tracked.
    pub fn tracked_producers(&self) -> usize {
        self.producers.len()
    }
}
