//! Heartbeat Propagation
//!
//! Upstream writers emit heartbeat control messages (a `START_OF_SEGMENT`
//! under the reserved heartbeat key) into the real-time topic. A leader
//! forwards each one into the version topic, stamping its own completion
//! state into the headers so followers can tell when the leader has caught
//! up.
//!
//! The forwarded heartbeat's origin timestamp is the maximum of the
//! upstream producer's timestamp and the record's broker ingress time. A
//! producer with a consistently slow clock would otherwise keep followers
//! from ever considering the heartbeat fresh; taking the maximum tolerates
//! drift in either direction.

use tributary_core::{
    ConsumedRecord, LeaderCompleteState, RecordHeaders, LEADER_COMPLETE_STATE_HEADER,
};

/// Origin timestamp to stamp on a forwarded heartbeat.
pub fn heartbeat_origin_timestamp(record: &ConsumedRecord) -> i64 {
    record.producer.message_timestamp_ms.max(record.timestamp_ms)
}

/// Headers carried by a forwarded heartbeat.
pub fn heartbeat_headers(completion_reported: bool) -> RecordHeaders {
    let state = LeaderCompleteState::from_completion_reported(completion_reported);
    let mut headers = RecordHeaders::new();
    headers.insert(LEADER_COMPLETE_STATE_HEADER, state.header_value());
    headers
}

/// Whether a record is an upstream heartbeat eligible for forwarding.
pub fn is_heartbeat(record: &ConsumedRecord) -> bool {
    use tributary_core::ControlMessageKind;
    record.key.is_heartbeat()
        && matches!(
            record.control_kind(),
            Some(ControlMessageKind::StartOfSegment)
        )
}
