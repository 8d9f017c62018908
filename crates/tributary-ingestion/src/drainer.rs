//! Drainer Interface
//!
//! The drainer is the downstream stage applying processed records to the
//! local storage engine. The pipeline hands records over through a bounded
//! queue: `put` blocks under back-pressure (acceptable, but interruptible)
//! and guarantees FIFO order per partition, nothing more.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tributary_core::ConsumedRecord;

use crate::error::{IngestionError, Result};

/// A record handed to the storage-apply stage.
#[derive(Debug, Clone, PartialEq)]
pub struct DrainedEntry {
    pub record: ConsumedRecord,
    pub partition: u32,
    pub upstream_url: String,
    pub ingress_timestamp_ms: i64,
}

/// Bounded hand-off into the storage-apply stage.
#[async_trait]
pub trait Drainer: Send + Sync {
    async fn put(
        &self,
        record: ConsumedRecord,
        partition: u32,
        upstream_url: &str,
        ingress_timestamp_ms: i64,
    ) -> Result<()>;
}

/// Channel-backed drainer. The receiving half belongs to the storage-apply
/// workers; if they shut down, `put` surfaces an error instead of wedging
/// the partition task.
pub struct ChannelDrainer {
    tx: mpsc::Sender<DrainedEntry>,
}

impl ChannelDrainer {
    /// Create a drainer with the given queue capacity, returning the
    /// consumer half for the apply workers.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<DrainedEntry>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Drainer for ChannelDrainer {
    async fn put(
        &self,
        record: ConsumedRecord,
        partition: u32,
        upstream_url: &str,
        ingress_timestamp_ms: i64,
    ) -> Result<()> {
        self.tx
            .send(DrainedEntry {
                record,
                partition,
                upstream_url: upstream_url.to_string(),
                ingress_timestamp_ms,
            })
            .await
            .map_err(|_| IngestionError::Drainer("drainer queue closed".to_string()))
    }
}
