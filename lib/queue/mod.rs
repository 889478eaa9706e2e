//! Segmented on-disk queues.
//!
//! Each queue lives in `<data_dir>/<queue>/` as numbered segment files. A
//! segment is *live* while the writer appends to it, *sealed-raw* once the next
//! segment exists, and *sealed-compressed* once compaction produced
//! `<n>.zst`. Consumer groups read independently; their offsets are markers.

pub mod compaction;
mod consumer;
mod record;
mod store;

pub use compaction::{CompactionError, CompactionManager, CompactionReport, SkipReason};
pub use consumer::QueueConsumer;
pub use record::{encode_record, read_record, scan_records, ReadOutcome, Record, SegmentScan};
pub use store::{ConsumerOffset, SegmentFiles, SegmentStore, COMPRESSED_SUFFIX};

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::markers::{MarkerError, SharedMarkerStore};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Marker(#[from] MarkerError),

    #[error("Malformed consumer offset: {0}")]
    Offset(#[from] serde_json::Error),

    #[error("Corrupt segment {segment} in queue [{queue}]: {detail}")]
    Corrupt {
        queue: String,
        segment: u64,
        detail: String,
    },

    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    #[error("Queue [{0}] state lock poisoned")]
    Poisoned(String),

    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

fn default_max_segment_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_idle_threshold() -> i64 {
    3
}

fn default_compression_level() -> i32 {
    3
}

/// Per-queue compaction knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct CompactionConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Distance (in segments) kept behind the write frontier and behind the
    /// slowest consumer before compressing / deleting. Values below 1 mean 3.
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold_segments: i64,
    /// Segments past a consumer's read position to restore ahead of time.
    #[serde(default)]
    pub num_segments_to_prefetch: u64,
    /// Remote upload owns retention: raw files go as soon as they are compressed
    /// and behind every consumer.
    #[serde(default)]
    pub upload_enabled: bool,
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            idle_threshold_segments: default_idle_threshold(),
            num_segments_to_prefetch: 0,
            upload_enabled: false,
            compression_level: default_compression_level(),
        }
    }
}

impl CompactionConfig {
    /// Gate for compression: segments older than `fileNum - idle_threshold`.
    pub fn idle_threshold(&self) -> u64 {
        if self.idle_threshold_segments < 1 {
            default_idle_threshold() as u64
        } else {
            self.idle_threshold_segments as u64
        }
    }

    /// Gate for raw-file deletion, measured behind the slowest consumer.
    pub fn deletion_threshold(&self) -> u64 {
        if self.upload_enabled {
            0
        } else {
            self.idle_threshold()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    /// A segment is sealed once the next record would push it past this size.
    #[serde(default = "default_max_segment_bytes")]
    pub max_segment_bytes: u64,
    #[serde(default)]
    pub compaction: CompactionConfig,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_segment_bytes: default_max_segment_bytes(),
            compaction: CompactionConfig::default(),
        }
    }
}

/// Every queue opened by this process, keyed by name.
///
/// Built once by the driver and shared by the pipeline runners, the compaction
/// tasks and the stats endpoint.
#[derive(Default)]
pub struct QueueRegistry {
    queues: BTreeMap<String, Arc<SegmentStore>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_all(
        data_dir: &Path,
        configs: &[QueueConfig],
        markers: SharedMarkerStore,
    ) -> Result<Self, QueueError> {
        let mut registry = Self::new();
        for config in configs {
            let store = SegmentStore::open(data_dir, config.clone(), Arc::clone(&markers))?;
            registry.insert(Arc::new(store));
        }
        Ok(registry)
    }

    pub fn insert(&mut self, store: Arc<SegmentStore>) {
        self.queues.insert(store.name().to_string(), store);
    }

    pub fn get(&self, name: &str) -> Result<Arc<SegmentStore>, QueueError> {
        self.queues
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::UnknownQueue(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<SegmentStore>> {
        self.queues.values()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Undelivered message count per queue.
    pub fn depths(&self) -> BTreeMap<String, u64> {
        self.queues
            .iter()
            .map(|(name, store)| (name.clone(), store.depth()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::CompactionConfig;

    #[test]
    fn idle_threshold_below_one_defaults_to_three() {
        let mut config = CompactionConfig {
            idle_threshold_segments: 0,
            ..CompactionConfig::default()
        };
        assert_eq!(config.idle_threshold(), 3);
        config.idle_threshold_segments = -1;
        assert_eq!(config.idle_threshold(), 3);
        config.idle_threshold_segments = 5;
        assert_eq!(config.idle_threshold(), 5);
    }

    #[test]
    fn upload_collapses_deletion_threshold_only() {
        let config = CompactionConfig {
            idle_threshold_segments: 4,
            upload_enabled: true,
            ..CompactionConfig::default()
        };
        assert_eq!(config.idle_threshold(), 4);
        assert_eq!(config.deletion_threshold(), 0);
    }
}
