use crate::build_info;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use prometheus_client::registry::Registry;
use tokio::sync::OnceCell;

/// Registers immutable build metadata for `/metrics` scraping.
///
/// Encoded as a labeled gauge with value `1` so the build labels survive the
/// Prometheus text format.
pub fn register_build_info_metric(registry: &mut Registry, prefix: &str) {
    let build_info_metric = Family::<BuildInfoLabels, Gauge>::default();
    build_info_metric
        .get_or_create(&BuildInfoLabels {
            service: "pipeline_worker",
            version: build_info::VERSION,
            commit: build_info::short_commit_hash(),
        })
        .set(1);
    let sub_registry = registry.sub_registry_with_prefix(prefix);
    sub_registry.register(
        "build_info",
        "Build identity labels for this process",
        build_info_metric,
    );
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct BuildInfoLabels {
    service: &'static str,
    version: &'static str,
    commit: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct QueueLabels {
    pub queue: String,
}

impl QueueLabels {
    pub fn new(queue: &str) -> Self {
        Self {
            queue: queue.to_string(),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PipelineLabels {
    pub pipeline: String,
}

impl PipelineLabels {
    pub fn new(pipeline: &str) -> Self {
        Self {
            pipeline: pipeline.to_string(),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TargetLabels {
    pub target: String,
}

impl TargetLabels {
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
        }
    }
}

#[derive(Clone, Default)]
pub struct QueueMetrics {
    pub messages_appended: Family<QueueLabels, Counter>,
    pub messages_delivered: Family<QueueLabels, Counter>,
    /// Undelivered messages behind the slowest consumer group.
    pub depth: Family<QueueLabels, Gauge>,
}

impl QueueMetrics {
    pub fn register(registry: &mut Registry, prefix: &str) -> Self {
        let metrics = Self::default();
        let sub_registry = registry.sub_registry_with_prefix(prefix);
        sub_registry.register(
            "messages_appended",
            "Total number of messages appended to the queue",
            metrics.messages_appended.clone(),
        );
        sub_registry.register(
            "messages_delivered",
            "Total number of messages delivered to a consumer group",
            metrics.messages_delivered.clone(),
        );
        sub_registry.register(
            "depth",
            "Messages not yet delivered to the slowest consumer group",
            metrics.depth.clone(),
        );
        metrics
    }
}

pub static QUEUE_METRICS: OnceCell<QueueMetrics> = OnceCell::const_new();

#[derive(Clone, Default)]
pub struct CompactionMetrics {
    pub segments_compressed: Family<QueueLabels, Counter>,
    pub segments_deleted: Family<QueueLabels, Counter>,
    pub segments_failed: Family<QueueLabels, Counter>,
    /// Highest segment with a durable compressed artifact.
    pub watermark: Family<QueueLabels, Gauge>,
}

impl CompactionMetrics {
    pub fn register(registry: &mut Registry, prefix: &str) -> Self {
        let metrics = Self::default();
        let sub_registry = registry.sub_registry_with_prefix(prefix);
        sub_registry.register(
            "segments_compressed",
            "Total number of segments compressed",
            metrics.segments_compressed.clone(),
        );
        sub_registry.register(
            "segments_deleted",
            "Total number of raw segment files deleted after compression",
            metrics.segments_deleted.clone(),
        );
        sub_registry.register(
            "segments_failed",
            "Total number of segment compressions that failed",
            metrics.segments_failed.clone(),
        );
        sub_registry.register(
            "watermark",
            "Highest compressed segment number per queue",
            metrics.watermark.clone(),
        );
        metrics
    }
}

pub static COMPACTION_METRICS: OnceCell<CompactionMetrics> = OnceCell::const_new();

#[derive(Clone, Default)]
pub struct PipelineMetrics {
    pub executions_completed: Family<PipelineLabels, Counter>,
    pub executions_faulted: Family<PipelineLabels, Counter>,
    pub decode_failures: Family<PipelineLabels, Counter>,
    pub workers_alive: Family<PipelineLabels, Gauge>,
}

impl PipelineMetrics {
    pub fn register(registry: &mut Registry, prefix: &str) -> Self {
        let metrics = Self::default();
        let sub_registry = registry.sub_registry_with_prefix(prefix);
        sub_registry.register(
            "executions_completed",
            "Total number of messages whose stages all completed",
            metrics.executions_completed.clone(),
        );
        sub_registry.register(
            "executions_faulted",
            "Total number of messages discarded after a stage fault",
            metrics.executions_faulted.clone(),
        );
        sub_registry.register(
            "decode_failures",
            "Total number of messages that could not be decoded",
            metrics.decode_failures.clone(),
        );
        sub_registry.register(
            "workers_alive",
            "Number of live pipeline worker tasks",
            metrics.workers_alive.clone(),
        );
        metrics
    }
}

pub static PIPELINE_METRICS: OnceCell<PipelineMetrics> = OnceCell::const_new();

#[derive(Clone, Default)]
pub struct AvailabilityMetrics {
    /// 1 while the target is considered reachable, else 0.
    pub target_available: Family<TargetLabels, Gauge>,
    pub failure_votes: Family<TargetLabels, Counter>,
    pub transitions_down: Family<TargetLabels, Counter>,
}

impl AvailabilityMetrics {
    pub fn register(registry: &mut Registry, prefix: &str) -> Self {
        let metrics = Self::default();
        let sub_registry = registry.sub_registry_with_prefix(prefix);
        sub_registry.register(
            "target_available",
            "Availability verdict per target (1 reachable, 0 unreachable)",
            metrics.target_available.clone(),
        );
        sub_registry.register(
            "failure_votes",
            "Total number of accepted failure votes",
            metrics.failure_votes.clone(),
        );
        sub_registry.register(
            "transitions_down",
            "Total number of reachable to unreachable transitions",
            metrics.transitions_down.clone(),
        );
        metrics
    }
}

pub static AVAILABILITY_METRICS: OnceCell<AvailabilityMetrics> = OnceCell::const_new();
