//! Store-Version State
//!
//! Persisted per store version, primed by the `START_OF_PUSH` control
//! message. Downstream stages consult it before enqueuing any data record,
//! e.g. to verify that chunked payloads are legal for this version.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreVersionState {
    /// Whether the batch portion of the push was produced in sorted order.
    pub sorted: bool,
    /// Whether values may be split into chunks with a manifest record.
    pub chunked: bool,
    /// Set once the START_OF_PUSH control message has been observed.
    pub start_of_push_received: bool,
}

impl StoreVersionState {
    pub fn from_start_of_push(sorted: bool, chunked: bool) -> Self {
        Self {
            sorted,
            chunked,
            start_of_push_received: true,
        }
    }
}
