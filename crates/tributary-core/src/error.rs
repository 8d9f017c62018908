//! Error Types for Tributary Core
//!
//! Structural violations in consumed records, detected by
//! [`ConsumedRecord::validate_shape`](crate::ConsumedRecord::validate_shape)
//! before a record enters the processing pipeline. Higher layers wrap
//! these with topic and offset context.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid schema id: {0}")]
    InvalidSchemaId(i32),

    #[error("Malformed record envelope: {0}")]
    MalformedEnvelope(String),
}

pub type Result<T> = std::result::Result<T, Error>;
