//! Topic-Partition Identity
//!
//! Tributary distinguishes two kinds of upstream topics:
//!
//! - **Version topics** hold the materialized log of one store version and
//!   are written by leaders.
//! - **Real-time topics** carry hybrid writes from producers across regions
//!   and are suffixed `_rt` by convention.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Naming suffix identifying a real-time topic.
pub const REAL_TIME_TOPIC_SUFFIX: &str = "_rt";

/// Naming suffix of the separate real-time topic carrying incremental-push
/// writes when that feature is enabled.
pub const SEPARATE_REAL_TIME_TOPIC_SUFFIX: &str = "_rt_sep";

/// Kind of a topic, derived from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopicKind {
    VersionTopic,
    RealTime,
}

/// A topic plus one of its partitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: u32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    pub fn kind(&self) -> TopicKind {
        if self.topic.ends_with(REAL_TIME_TOPIC_SUFFIX)
            || self.topic.ends_with(SEPARATE_REAL_TIME_TOPIC_SUFFIX)
        {
            TopicKind::RealTime
        } else {
            TopicKind::VersionTopic
        }
    }

    pub fn is_real_time(&self) -> bool {
        self.kind() == TopicKind::RealTime
    }

    pub fn is_separate_real_time(&self) -> bool {
        self.topic.ends_with(SEPARATE_REAL_TIME_TOPIC_SUFFIX)
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}
