use pipeline_worker_lib::markers::{MemoryMarkerStore, SharedMarkerStore};
use pipeline_worker_lib::queue::compaction::{compact_queue, load_watermark};
use pipeline_worker_lib::queue::{encode_record, QueueConfig, QueueConsumer, SegmentStore, SkipReason};
use std::fs;
use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const QUEUE: &str = "q1";

/// Writes one single-record segment per number, offsets counting from 0.
fn seed_segments(root: &Path, segments: RangeInclusive<u64>) {
    let dir = root.join(QUEUE);
    fs::create_dir_all(&dir).expect("queue dir");
    for (offset, segment) in segments.enumerate() {
        let record = encode_record(offset as u64, format!("message-{segment}").as_bytes())
            .expect("encode record");
        fs::write(dir.join(segment.to_string()), record).expect("write segment");
    }
}

fn open_store(root: &Path, upload_enabled: bool) -> (Arc<SegmentStore>, Arc<MemoryMarkerStore>) {
    let mut config = QueueConfig::new(QUEUE);
    // Small enough that every appended record opens a new segment.
    config.max_segment_bytes = 32;
    config.compaction.enabled = true;
    config.compaction.idle_threshold_segments = 3;
    config.compaction.upload_enabled = upload_enabled;
    let markers = Arc::new(MemoryMarkerStore::new());
    let shared: SharedMarkerStore = markers.clone();
    let store = SegmentStore::open(root, config, shared).expect("open store");
    (Arc::new(store), markers)
}

/// Pops until the group's cursor sits in `segment`.
async fn consume_into(consumer: &QueueConsumer, segment: u64) {
    while consumer.offset().await.segment < segment {
        consumer
            .pop()
            .await
            .expect("pop")
            .expect("message available");
    }
}

fn raw_segments(store: &SegmentStore) -> Vec<u64> {
    store
        .list_segments()
        .expect("list")
        .into_iter()
        .filter(|(_, files)| files.raw)
        .map(|(segment, _)| segment)
        .collect()
}

async fn watermark(markers: &Arc<MemoryMarkerStore>) -> Option<u64> {
    let shared: SharedMarkerStore = markers.clone();
    load_watermark(&shared, QUEUE).await.expect("watermark")
}

#[tokio::test]
async fn compresses_behind_frontier_and_deletes_far_behind_slowest_consumer() {
    let dir = TempDir::new().expect("tempdir");
    seed_segments(dir.path(), 1..=12);
    let (store, markers) = open_store(dir.path(), false);
    assert_eq!(store.write_segment(), 12);

    let consumer = store.register_consumer("indexer").await.expect("consumer");
    consume_into(&consumer, 8).await;
    assert_eq!(store.slowest_consumer_segment(), Some(8));

    let report = compact_queue(&store, 12).await.expect("pass");

    assert_eq!(report.compressed, (1..=8).collect::<Vec<_>>());
    assert_eq!(report.deleted, (1..=5).collect::<Vec<_>>());
    assert_eq!(report.watermark, Some(8));
    assert_eq!(watermark(&markers).await, Some(8));
    for segment in 1..=8 {
        assert!(store.compressed_exists(segment), "segment {segment} compressed");
    }
    assert_eq!(raw_segments(&store), (6..=12).collect::<Vec<_>>());
}

#[tokio::test]
async fn second_pass_is_a_no_op() {
    let dir = TempDir::new().expect("tempdir");
    seed_segments(dir.path(), 1..=12);
    let (store, markers) = open_store(dir.path(), false);
    let consumer = store.register_consumer("indexer").await.expect("consumer");
    consume_into(&consumer, 8).await;

    compact_queue(&store, 12).await.expect("first pass");
    let listing = store.list_segments().expect("list");

    let again = compact_queue(&store, 12).await.expect("second pass");
    assert!(again.compressed.is_empty());
    assert!(again.deleted.is_empty());
    assert!(again.failed.is_empty());
    assert_eq!(again.watermark, Some(8));
    assert_eq!(store.list_segments().expect("list"), listing);
    assert_eq!(watermark(&markers).await, Some(8));
}

#[tokio::test]
async fn nothing_is_deleted_ahead_of_the_slowest_group() {
    let dir = TempDir::new().expect("tempdir");
    seed_segments(dir.path(), 1..=12);
    let (store, _markers) = open_store(dir.path(), true);

    let fast = store.register_consumer("fast").await.expect("fast");
    let slow = store.register_consumer("slow").await.expect("slow");
    consume_into(&fast, 11).await;
    consume_into(&slow, 4).await;

    let report = compact_queue(&store, 12).await.expect("pass");
    // Upload mode: deletion only needs the segment to be behind every group.
    assert_eq!(report.deleted, vec![1, 2, 3]);
    for segment in 4..=12 {
        assert!(store.raw_exists(segment), "segment {segment} must survive");
    }

    // The slow group can still read everything it has not consumed.
    let next = slow.pop().await.expect("pop").expect("message");
    assert_eq!(next, b"message-5".to_vec());
}

#[tokio::test]
async fn upload_mode_deletes_everything_behind_consumer() {
    let dir = TempDir::new().expect("tempdir");
    seed_segments(dir.path(), 1..=12);
    let (store, _markers) = open_store(dir.path(), true);
    let consumer = store.register_consumer("indexer").await.expect("consumer");
    consume_into(&consumer, 8).await;

    let report = compact_queue(&store, 12).await.expect("pass");
    assert_eq!(report.deleted, (1..=7).collect::<Vec<_>>());
    assert!(store.raw_exists(8));
}

#[tokio::test]
async fn no_consumer_means_no_compaction() {
    let dir = TempDir::new().expect("tempdir");
    seed_segments(dir.path(), 1..=12);
    let (store, markers) = open_store(dir.path(), false);

    let report = compact_queue(&store, 12).await.expect("pass");
    assert_eq!(report.skipped, Some(SkipReason::NoConsumers));
    assert_eq!(raw_segments(&store), (1..=12).collect::<Vec<_>>());
    assert_eq!(watermark(&markers).await, None);
}

#[tokio::test]
async fn watermark_only_moves_forward() {
    let dir = TempDir::new().expect("tempdir");
    seed_segments(dir.path(), 1..=12);
    let (store, markers) = open_store(dir.path(), false);
    let consumer = store.register_consumer("indexer").await.expect("consumer");
    consume_into(&consumer, 8).await;

    compact_queue(&store, 12).await.expect("pass");
    assert_eq!(watermark(&markers).await, Some(8));

    // An older frontier (e.g. a stale caller) must not pull the watermark back.
    let stale = compact_queue(&store, 6).await.expect("stale pass");
    assert_eq!(stale.skipped, Some(SkipReason::NothingBehindFrontier));
    assert_eq!(watermark(&markers).await, Some(8));

    for i in 0..4 {
        store.append(format!("late-{i}").as_bytes()).expect("append");
    }
    consume_into(&consumer, 12).await;
    let report = compact_queue(&store, 15).await.expect("later pass");
    assert_eq!(report.watermark, Some(11));
    assert_eq!(watermark(&markers).await, Some(11));
}

#[tokio::test]
async fn failed_compression_freezes_watermark_until_retried() {
    let dir = TempDir::new().expect("tempdir");
    seed_segments(dir.path(), 1..=12);
    let (store, markers) = open_store(dir.path(), false);
    let consumer = store.register_consumer("indexer").await.expect("consumer");
    consume_into(&consumer, 8).await;

    // A directory squatting on the temp name makes compressing segment 3 fail.
    let blocker = dir.path().join(QUEUE).join("3.zst.tmp");
    fs::create_dir(&blocker).expect("blocker");

    let report = compact_queue(&store, 12).await.expect("pass");
    assert_eq!(report.failed, vec![3]);
    assert_eq!(report.compressed, vec![1, 2, 4, 5, 6, 7, 8]);
    assert_eq!(report.deleted, vec![1, 2]);
    assert_eq!(watermark(&markers).await, Some(2));
    assert!(store.raw_exists(4) && store.raw_exists(5));

    fs::remove_dir(&blocker).expect("remove blocker");
    let retry = compact_queue(&store, 12).await.expect("retry");
    assert_eq!(retry.compressed, vec![3]);
    assert_eq!(retry.already_compressed, vec![4, 5, 6, 7, 8]);
    assert_eq!(retry.deleted, vec![3, 4, 5]);
    assert_eq!(watermark(&markers).await, Some(8));
}

#[tokio::test]
async fn watermark_write_failure_is_fatal() {
    let dir = TempDir::new().expect("tempdir");
    seed_segments(dir.path(), 1..=12);
    let (store, markers) = open_store(dir.path(), false);
    let consumer = store.register_consumer("indexer").await.expect("consumer");
    consume_into(&consumer, 8).await;

    markers.fail_writes(true);
    assert!(compact_queue(&store, 12).await.is_err());
    // Nothing is deleted without a durable watermark covering it.
    assert_eq!(raw_segments(&store), (1..=12).collect::<Vec<_>>());
}

#[tokio::test]
async fn consumer_reads_through_deleted_raw_segments() {
    let dir = TempDir::new().expect("tempdir");
    seed_segments(dir.path(), 1..=12);
    let (store, _markers) = open_store(dir.path(), false);
    let leader = store.register_consumer("leader").await.expect("leader");
    consume_into(&leader, 8).await;
    compact_queue(&store, 12).await.expect("pass");
    assert!(!store.raw_exists(1));

    // A new group starts at the oldest segment and is served from the artifacts.
    let late = store.register_consumer("late").await.expect("late");
    let first = late.pop().await.expect("pop").expect("message");
    assert_eq!(first, b"message-1".to_vec());
}
