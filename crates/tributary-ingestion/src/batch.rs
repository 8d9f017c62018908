//! Batch Processor
//!
//! Groups a polled batch into mini-batches and runs conflict resolution for
//! all data records of a mini-batch in parallel, holding the key-level
//! locks for the whole mini-batch. Results come back in input order and are
//! then fed one by one through the single-record delegation path, which
//! skips recomputation when it finds a pre-computed result attached.
//!
//! Within a mini-batch, downstream application stays in input order because
//! delegation is sequential; across mini-batches, order holds because
//! mini-batches are processed one after another.

use std::sync::Arc;

use bytes::Bytes;
use futures::future;

use tributary_core::ConsumedRecord;

use crate::error::{IngestionError, Result};
use crate::interfaces::StorageEngine;
use crate::key_lock::{KeyLockHandle, KeyLockManager};
use crate::merge::{ConflictResolver, MergeConflictOutcome, PriorRecord};
use crate::partition_state::PartitionConsumptionState;

/// A consumed record, optionally carrying the conflict-resolution result
/// computed by a batch worker.
#[derive(Debug, Clone)]
pub struct ProcessedRecord {
    pub record: ConsumedRecord,
    pub merge: Option<MergeConflictOutcome>,
}

impl ProcessedRecord {
    pub fn unprocessed(record: ConsumedRecord) -> Self {
        Self {
            record,
            merge: None,
        }
    }
}

/// Prior state for conflict resolution: the transient cache first, disk
/// second. Must be called under the key-level lock. A cached tombstone
/// still surfaces its replication metadata.
pub(crate) async fn read_prior_value(
    state: &PartitionConsumptionState,
    storage: &Arc<dyn StorageEngine>,
    partition: u32,
    key: &Bytes,
) -> Result<Option<PriorRecord>> {
    if let Some(transient) = state.transient_record(key) {
        return Ok(Some(PriorRecord {
            value: transient.value,
            schema_id: transient.schema_id,
            replication_metadata: Some(transient.replication_metadata),
        }));
    }
    Ok(storage.get(partition, key).await?.map(PriorRecord::from))
}

/// Parallel conflict-resolution stage for eligible real-time batches.
pub struct BatchProcessor {
    pool_size: usize,
}

impl BatchProcessor {
    pub fn new(pool_size: usize) -> Self {
        Self {
            pool_size: pool_size.max(1),
        }
    }

    /// Split records into mini-batches of the configured parallelism width.
    pub fn split_into_mini_batches(&self, records: Vec<ConsumedRecord>) -> Vec<Vec<ConsumedRecord>> {
        let mut batches = Vec::new();
        let mut ongoing = Vec::with_capacity(self.pool_size);
        for record in records {
            ongoing.push(record);
            if ongoing.len() == self.pool_size {
                batches.push(std::mem::replace(
                    &mut ongoing,
                    Vec::with_capacity(self.pool_size),
                ));
            }
        }
        if !ongoing.is_empty() {
            batches.push(ongoing);
        }
        batches
    }

    /// Acquire the key locks for every data record of the mini-batch.
    pub async fn lock_keys(
        &self,
        locks: &Arc<KeyLockManager>,
        batch: &[ConsumedRecord],
    ) -> KeyLockHandle {
        let keys = batch
            .iter()
            .filter(|record| !record.is_control())
            .map(|record| record.key.bytes.clone());
        locks.acquire_many(keys).await
    }

    /// Run conflict resolution for all data records in parallel, preserving
    /// input order in the returned list. The caller must hold the batch's
    /// key locks for the duration.
    pub async fn process(
        &self,
        batch: Vec<ConsumedRecord>,
        state: &Arc<PartitionConsumptionState>,
        storage: &Arc<dyn StorageEngine>,
        resolver: &ConflictResolver,
        upstream_cluster_id: i32,
    ) -> Result<Vec<ProcessedRecord>> {
        let partition = state.partition();
        let tasks: Vec<_> = batch
            .into_iter()
            .map(|record| {
                if record.is_control() {
                    future::Either::Left(future::ready(Ok(ProcessedRecord::unprocessed(record))))
                } else {
                    let state = Arc::clone(state);
                    let storage = Arc::clone(storage);
                    let resolver = resolver.clone();
                    future::Either::Right(async move {
                        let handle = tokio::spawn(async move {
                            let prior = read_prior_value(
                                &state,
                                &storage,
                                partition,
                                &record.key.bytes,
                            )
                            .await?;
                            let merge =
                                resolver.merge(&record, prior.as_ref(), upstream_cluster_id)?;
                            Ok::<ProcessedRecord, IngestionError>(ProcessedRecord {
                                record,
                                merge: Some(merge),
                            })
                        });
                        handle
                            .await
                            .map_err(|join| IngestionError::Worker(join.to_string()))?
                    })
                }
            })
            .collect();

        future::try_join_all(tasks).await
    }
}
