//! Ingestion Configuration
//!
//! All operational parameters of the per-partition ingestion pipeline.
//! Created via [`IngestionConfig::builder()`]; every field has a production
//! default so tests only override what they exercise.

use serde::{Deserialize, Serialize};

/// Configuration for the ingestion pipeline of one store version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// Mini-batch width for parallel conflict resolution.
    pub parallel_processing_pool_size: usize,

    /// Whether eligible real-time batches run merge/write-compute on the
    /// parallel worker pool instead of the per-record path.
    pub parallel_conflict_resolution_enabled: bool,

    /// Upper bound on waiting for an unknown value schema id.
    pub schema_polling_timeout_ms: u64,

    /// Fixed interval between schema registry polls.
    pub schema_polling_delay_ms: u64,

    /// When set, real-time records are validated against a dedicated
    /// real-time tracker instead of the version-topic tracker.
    pub global_rt_div_enabled: bool,

    pub active_active_replication_enabled: bool,
    pub chunking_enabled: bool,
    pub incremental_push_enabled: bool,
    pub separate_rt_topic_enabled: bool,

    /// How often followers consider a forwarded leader-complete header
    /// fresh enough to act on.
    pub leader_complete_state_check_interval_ms: u64,

    /// Whether this store version is rebuilding from another region's data.
    pub is_data_recovery: bool,

    /// Capacity of the bounded drainer queue.
    pub drainer_queue_capacity: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            parallel_processing_pool_size: 8,
            parallel_conflict_resolution_enabled: true,
            schema_polling_timeout_ms: 30_000,
            schema_polling_delay_ms: 100,
            global_rt_div_enabled: false,
            active_active_replication_enabled: false,
            chunking_enabled: false,
            incremental_push_enabled: true,
            separate_rt_topic_enabled: false,
            leader_complete_state_check_interval_ms: 2_000,
            is_data_recovery: false,
            drainer_queue_capacity: 1_000,
        }
    }
}

impl IngestionConfig {
    pub fn builder() -> IngestionConfigBuilder {
        IngestionConfigBuilder {
            config: IngestionConfig::default(),
        }
    }
}

/// Fluent builder over [`IngestionConfig`].
pub struct IngestionConfigBuilder {
    config: IngestionConfig,
}

impl IngestionConfigBuilder {
    pub fn parallel_processing_pool_size(mut self, size: usize) -> Self {
        self.config.parallel_processing_pool_size = size;
        self
    }

    pub fn parallel_conflict_resolution_enabled(mut self, enabled: bool) -> Self {
        self.config.parallel_conflict_resolution_enabled = enabled;
        self
    }

    pub fn schema_polling_timeout_ms(mut self, ms: u64) -> Self {
        self.config.schema_polling_timeout_ms = ms;
        self
    }

    pub fn schema_polling_delay_ms(mut self, ms: u64) -> Self {
        self.config.schema_polling_delay_ms = ms;
        self
    }

    pub fn global_rt_div_enabled(mut self, enabled: bool) -> Self {
        self.config.global_rt_div_enabled = enabled;
        self
    }

    pub fn active_active_replication_enabled(mut self, enabled: bool) -> Self {
        self.config.active_active_replication_enabled = enabled;
        self
    }

    pub fn chunking_enabled(mut self, enabled: bool) -> Self {
        self.config.chunking_enabled = enabled;
        self
    }

    pub fn incremental_push_enabled(mut self, enabled: bool) -> Self {
        self.config.incremental_push_enabled = enabled;
        self
    }

    pub fn separate_rt_topic_enabled(mut self, enabled: bool) -> Self {
        self.config.separate_rt_topic_enabled = enabled;
        self
    }

    pub fn leader_complete_state_check_interval_ms(mut self, ms: u64) -> Self {
        self.config.leader_complete_state_check_interval_ms = ms;
        self
    }

    pub fn is_data_recovery(mut self, enabled: bool) -> Self {
        self.config.is_data_recovery = enabled;
        self
    }

    pub fn drainer_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.drainer_queue_capacity = capacity;
        self
    }

    pub fn build(self) -> IngestionConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = IngestionConfig::default();
        assert_eq!(config.parallel_processing_pool_size, 8);
        assert_eq!(config.schema_polling_delay_ms, 100);
        assert!(!config.active_active_replication_enabled);
        assert!(!config.is_data_recovery);
    }

    #[test]
    fn test_builder_overrides() {
        let config = IngestionConfig::builder()
            .parallel_processing_pool_size(4)
            .active_active_replication_enabled(true)
            .global_rt_div_enabled(true)
            .schema_polling_timeout_ms(500)
            .build();
        assert_eq!(config.parallel_processing_pool_size, 4);
        assert!(config.active_active_replication_enabled);
        assert!(config.global_rt_div_enabled);
        assert_eq!(config.schema_polling_timeout_ms, 500);
        // Untouched fields keep their defaults
        assert_eq!(config.drainer_queue_capacity, 1_000);
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = IngestionConfig::builder().is_data_recovery(true).build();
        let json = serde_json::to_string(&config).expect("serialize");
        let parsed: IngestionConfig = serde_json::from_str(&json).expect("deserialize");
        assert!(parsed.is_data_recovery);
        assert_eq!(
            parsed.parallel_processing_pool_size,
            config.parallel_processing_pool_size
        );
    }
}
