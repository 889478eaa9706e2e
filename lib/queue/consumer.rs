use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::compaction::prefetch_segments;
use super::store::{ConsumerOffset, SegmentStore, OFFSET_NAMESPACE};
use super::QueueError;
use crate::server::monitoring::{QueueLabels, QUEUE_METRICS};

/// One consumer group's handle on a queue.
///
/// Shared by every worker of a pipeline: `pop` serialises on the cursor, so
/// each message goes to exactly one caller.
pub struct QueueConsumer {
    store: Arc<SegmentStore>,
    group: String,
    marker_key: String,
    cursor: tokio::sync::Mutex<ConsumerOffset>,
    committed: AtomicU64,
}

impl QueueConsumer {
    pub(crate) fn new(
        store: Arc<SegmentStore>,
        group: String,
        marker_key: String,
        offset: ConsumerOffset,
    ) -> Self {
        Self {
            store,
            group,
            marker_key,
            committed: AtomicU64::new(offset.next_offset),
            cursor: tokio::sync::Mutex::new(offset),
        }
    }

    pub fn queue(&self) -> &str {
        self.store.name()
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn store(&self) -> &Arc<SegmentStore> {
        &self.store
    }

    pub async fn offset(&self) -> ConsumerOffset {
        *self.cursor.lock().await
    }

    pub fn has_pending(&self) -> bool {
        self.committed.load(Ordering::SeqCst) < self.store.next_offset()
    }

    /// Resolves once a message is available for this group.
    ///
    /// Cancel-safe: dropping the future loses nothing, so it can sit in a
    /// `select!` next to a shutdown token.
    pub async fn wait_for_message(&self) {
        loop {
            let notified = self.store.notify().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.has_pending() {
                return;
            }
            notified.await;
        }
    }

    /// Takes the next message and durably commits the advanced offset.
    ///
    /// The offset is persisted before the payload is handed out: a crash after
    /// `pop` returns never replays the message.
    pub async fn pop(&self) -> Result<Option<Vec<u8>>, QueueError> {
        let mut cursor = self.cursor.lock().await;
        if cursor.next_offset >= self.store.next_offset() {
            return Ok(None);
        }

        let current = *cursor;
        let store = Arc::clone(&self.store);
        let read = tokio::task::spawn_blocking(move || store.read_next(&current)).await??;
        let Some((record, next)) = read else {
            return Ok(None);
        };

        let encoded = serde_json::to_vec(&next)?;
        self.store
            .markers()
            .put(OFFSET_NAMESPACE, &self.marker_key, &encoded)
            .await?;

        *cursor = next;
        self.committed.store(next.next_offset, Ordering::SeqCst);
        drop(cursor);
        self.store.update_consumer(&self.group, next);

        if let Some(metrics) = QUEUE_METRICS.get() {
            metrics
                .messages_delivered
                .get_or_create(&QueueLabels::new(self.store.name()))
                .inc();
        }

        if next.segment != current.segment {
            self.prefetch_ahead(next.segment);
        }
        Ok(Some(record.payload))
    }

    /// Fire-and-forget restore of the segments after `segment`.
    fn prefetch_ahead(&self, segment: u64) {
        let compaction = self.store.config().compaction;
        if !compaction.enabled || compaction.num_segments_to_prefetch == 0 {
            return;
        }
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || match prefetch_segments(&store, segment) {
            Ok(restored) if restored > 0 => debug!(
                event = "segments_prefetched",
                queue = %store.name(),
                from_segment = segment,
                restored = restored,
                "Prefetched compressed segments"
            ),
            Ok(_) => {}
            Err(err) => warn!(
                event = "segment_prefetch_failed",
                queue = %store.name(),
                from_segment = segment,
                error = %err,
                "Prefetch failed; segments will be restored on read"
            ),
        });
    }
}
