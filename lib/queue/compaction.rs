//! Background compression and reclamation of consumed segments.
//!
//! A pass over one queue walks forward from the persisted watermark to the
//! frontier `write_segment - idle_threshold`. Each sealed raw segment gets a
//! `<n>.zst` artifact, the watermark moves to it, and the raw file is deleted
//! once it lies far enough behind the slowest consumer group.
//!
//! Compression never consults consumer positions: it is non-destructive, and a
//! consumer reading a compressed-only segment restores it. Deletion is the
//! step that is gated on consumers.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::store::SegmentStore;
use super::{QueueError, QueueRegistry};
use crate::logging::format_error_report;
use crate::markers::{MarkerError, SharedMarkerStore};
use crate::server::monitoring::{QueueLabels, COMPACTION_METRICS};

pub const WATERMARK_NAMESPACE: &str = "last_compress_file_for_queue";

#[derive(Error, Debug)]
pub enum CompactionError {
    #[error("Failed to access compaction watermark for queue [{queue}]: {source}")]
    Watermark {
        queue: String,
        #[source]
        source: MarkerError,
    },

    #[error("Malformed compaction watermark for queue [{queue}] ({len} bytes)")]
    MalformedWatermark { queue: String, len: usize },

    #[error("Failed to delete raw segment {segment} of queue [{queue}]: {source}")]
    Delete {
        queue: String,
        segment: u64,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Compaction task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Why a pass did no work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    NoConsumers,
    /// `write_segment - idle_threshold` is not past the watermark.
    NothingBehindFrontier,
}

/// What one pass did, segment by segment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub compressed: Vec<u64>,
    pub already_compressed: Vec<u64>,
    pub deleted: Vec<u64>,
    pub failed: Vec<u64>,
    pub watermark: Option<u64>,
    pub skipped: Option<SkipReason>,
}

impl CompactionReport {
    fn skipped(reason: SkipReason, watermark: Option<u64>) -> Self {
        Self {
            skipped: Some(reason),
            watermark,
            ..Self::default()
        }
    }
}

/// Reads the watermark; `None` means the queue was never compacted.
pub async fn load_watermark(
    markers: &SharedMarkerStore,
    queue: &str,
) -> Result<Option<u64>, CompactionError> {
    let raw = markers
        .get(WATERMARK_NAMESPACE, queue)
        .await
        .map_err(|source| CompactionError::Watermark {
            queue: queue.to_string(),
            source,
        })?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    let bytes: [u8; 8] = raw
        .as_slice()
        .try_into()
        .map_err(|_| CompactionError::MalformedWatermark {
            queue: queue.to_string(),
            len: raw.len(),
        })?;
    let value = i64::from_be_bytes(bytes);
    Ok(u64::try_from(value).ok())
}

async fn persist_watermark(
    markers: &SharedMarkerStore,
    queue: &str,
    segment: u64,
) -> Result<(), CompactionError> {
    let value = i64::try_from(segment).unwrap_or(i64::MAX).to_be_bytes();
    markers
        .put(WATERMARK_NAMESPACE, queue, &value)
        .await
        .map_err(|source| CompactionError::Watermark {
            queue: queue.to_string(),
            source,
        })
}

fn deletion_allowed(segment: u64, slowest: Option<u64>, threshold: u64) -> bool {
    match slowest {
        Some(slowest) => segment < slowest && slowest - segment >= threshold,
        None => false,
    }
}

/// One compaction pass over `store`, with `file_num` as the write frontier.
///
/// A compression failure is logged and later segments are still compressed,
/// but the watermark freezes below the failed segment and nothing past it is
/// deleted. Watermark persistence and raw deletion failures end the pass with
/// an error; a watermark already written stays written.
pub async fn compact_queue(
    store: &Arc<SegmentStore>,
    file_num: u64,
) -> Result<CompactionReport, CompactionError> {
    let config = store.config().compaction;
    let queue = store.name().to_string();
    if !config.enabled {
        trace!(event = "compaction_disabled", queue = %queue, "Compaction disabled");
        return Ok(CompactionReport::skipped(SkipReason::Disabled, None));
    }

    let _pass = store.compaction_lock().lock().await;
    let markers = Arc::clone(store.markers());
    let mut watermark = load_watermark(&markers, &queue).await?;

    if store.consumer_count() == 0 {
        debug!(
            event = "compaction_skipped",
            queue = %queue,
            reason = "no_consumers",
            "No active consumer group"
        );
        return Ok(CompactionReport::skipped(SkipReason::NoConsumers, watermark));
    }

    let mut report = CompactionReport::default();
    if let Some(watermark) = watermark {
        reclaim_restored(store, watermark, &mut report)?;
    }

    let frontier = file_num.saturating_sub(config.idle_threshold());
    if frontier == 0 || watermark.is_some_and(|w| frontier <= w) {
        debug!(
            event = "compaction_skipped",
            queue = %queue,
            frontier = frontier,
            watermark = ?watermark,
            reason = "nothing_behind_frontier",
            "Nothing to compress"
        );
        report.skipped = Some(SkipReason::NothingBehindFrontier);
        report.watermark = watermark;
        return Ok(report);
    }

    let start = watermark.map_or(0, |w| w + 1);
    let mut frozen = false;
    for segment in start..frontier {
        if !store.raw_exists(segment) || !store.segment_exists(segment + 1) {
            trace!(
                event = "compaction_segment_not_sealed",
                queue = %queue,
                segment = segment,
                "Segment missing or still live"
            );
            continue;
        }

        if store.compressed_exists(segment) {
            report.already_compressed.push(segment);
        } else {
            let task_store = Arc::clone(store);
            match tokio::task::spawn_blocking(move || task_store.compress_segment(segment)).await? {
                Ok(bytes) => {
                    debug!(
                        event = "segment_compressed",
                        queue = %queue,
                        segment = segment,
                        compressed_bytes = bytes,
                        "Compressed segment"
                    );
                    report.compressed.push(segment);
                    if let Some(metrics) = COMPACTION_METRICS.get() {
                        metrics
                            .segments_compressed
                            .get_or_create(&QueueLabels::new(&queue))
                            .inc();
                    }
                }
                Err(err) => {
                    warn!(
                        event = "segment_compress_failed",
                        queue = %queue,
                        segment = segment,
                        error = %err,
                        "Compression failed; watermark held below this segment"
                    );
                    report.failed.push(segment);
                    frozen = true;
                    if let Some(metrics) = COMPACTION_METRICS.get() {
                        metrics
                            .segments_failed
                            .get_or_create(&QueueLabels::new(&queue))
                            .inc();
                    }
                    continue;
                }
            }
        }

        if frozen {
            continue;
        }

        persist_watermark(&markers, &queue, segment).await?;
        watermark = Some(segment);
        if let Some(metrics) = COMPACTION_METRICS.get() {
            metrics
                .watermark
                .get_or_create(&QueueLabels::new(&queue))
                .set(segment as i64);
        }

        if deletion_allowed(
            segment,
            store.slowest_consumer_segment(),
            config.deletion_threshold(),
        ) {
            delete_raw(store, segment, &mut report)?;
        }
    }

    report.watermark = watermark;
    if !report.compressed.is_empty() || !report.deleted.is_empty() || !report.failed.is_empty() {
        info!(
            event = "compaction_pass_completed",
            queue = %queue,
            compressed = report.compressed.len(),
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            watermark = ?report.watermark,
            "Compaction pass completed"
        );
    }
    Ok(report)
}

/// Deletes raw files at or below the watermark that were restored for reading
/// (or left behind because their consumer was close) and are now eligible.
fn reclaim_restored(
    store: &Arc<SegmentStore>,
    watermark: u64,
    report: &mut CompactionReport,
) -> Result<(), CompactionError> {
    let threshold = store.config().compaction.deletion_threshold();
    let slowest = store.slowest_consumer_segment();
    for (segment, files) in store.list_segments()?.range(..=watermark) {
        if files.raw && files.compressed && deletion_allowed(*segment, slowest, threshold) {
            delete_raw(store, *segment, report)?;
        }
    }
    Ok(())
}

fn delete_raw(
    store: &SegmentStore,
    segment: u64,
    report: &mut CompactionReport,
) -> Result<(), CompactionError> {
    store
        .remove_raw(segment)
        .map_err(|source| CompactionError::Delete {
            queue: store.name().to_string(),
            segment,
            source,
        })?;
    debug!(
        event = "segment_raw_deleted",
        queue = %store.name(),
        segment = segment,
        "Deleted raw segment"
    );
    report.deleted.push(segment);
    if let Some(metrics) = COMPACTION_METRICS.get() {
        metrics
            .segments_deleted
            .get_or_create(&QueueLabels::new(store.name()))
            .inc();
    }
    Ok(())
}

/// Restores the compressed-only segments after `file_num` so a consumer
/// crossing into them does not wait on decompression. A hint only.
pub fn prefetch_segments(store: &SegmentStore, file_num: u64) -> Result<usize, QueueError> {
    let config = store.config().compaction;
    if !config.enabled {
        return Ok(0);
    }
    let mut restored = 0;
    for ahead in 1..=config.num_segments_to_prefetch {
        if store.restore_segment(file_num + ahead)? {
            restored += 1;
        }
    }
    Ok(restored)
}

/// Drives compaction for every queue in a registry.
pub struct CompactionManager {
    queues: Arc<QueueRegistry>,
}

impl CompactionManager {
    pub fn new(queues: Arc<QueueRegistry>) -> Self {
        Self { queues }
    }

    pub async fn compress(
        &self,
        queue_id: &str,
        file_num: u64,
    ) -> Result<CompactionReport, CompactionError> {
        let store = self.queues.get(queue_id)?;
        compact_queue(&store, file_num).await
    }

    pub async fn prepare_ahead(&self, queue_id: &str, file_num: u64) -> Result<usize, CompactionError> {
        let store = self.queues.get(queue_id)?;
        let restored =
            tokio::task::spawn_blocking(move || prefetch_segments(&store, file_num)).await??;
        Ok(restored)
    }

    /// Spawns one periodic pass loop per compaction-enabled queue.
    pub fn spawn(&self, interval: Duration, shutdown: CancellationToken) -> JoinSet<()> {
        let mut tasks = JoinSet::new();
        for store in self.queues.iter() {
            if !store.config().compaction.enabled {
                continue;
            }
            let store = Arc::clone(store);
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                let queue = store.name().to_string();
                if let Err(err) = run(store, interval, shutdown).await {
                    error!(
                        event = "compaction_loop_failed",
                        queue = %queue,
                        error = %err,
                        error_report = %format_error_report(&err),
                        "Compaction loop stopped on fatal error"
                    );
                }
            });
        }
        tasks
    }
}

/// Periodic compaction for one queue until shutdown or a fatal pass error.
pub async fn run(
    store: Arc<SegmentStore>,
    interval: Duration,
    shutdown: CancellationToken,
) -> Result<(), CompactionError> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(
        event = "compaction_loop_started",
        queue = %store.name(),
        interval_secs = interval.as_secs(),
        "Compaction loop started"
    );
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(event = "compaction_loop_stopped", queue = %store.name(), "Compaction loop stopped");
                return Ok(());
            }
            _ = ticker.tick() => {
                compact_queue(&store, store.write_segment()).await?;
            }
        }
    }
}
