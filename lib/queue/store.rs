use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::consumer::QueueConsumer;
use super::record::{encode_record, read_record, scan_records, ReadOutcome, Record};
use super::{QueueConfig, QueueError};
use crate::markers::SharedMarkerStore;
use crate::server::monitoring::{QueueLabels, QUEUE_METRICS};

pub const COMPRESSED_SUFFIX: &str = ".zst";
const TEMP_SUFFIX: &str = ".tmp";

pub(crate) const OFFSET_NAMESPACE: &str = "queue_consumer_offset";

/// A consumer group's cursor.
///
/// `segment`/`position` locate the next unread record on disk; `next_offset`
/// is that record's queue offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerOffset {
    pub segment: u64,
    pub position: u64,
    pub next_offset: u64,
}

/// Which files exist for one segment number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentFiles {
    pub raw: bool,
    pub compressed: bool,
}

struct WriterState {
    segment: u64,
    position: u64,
    file: Option<File>,
}

/// Append-only log for one queue, split into numbered segment files.
pub struct SegmentStore {
    name: String,
    dir: PathBuf,
    config: QueueConfig,
    markers: SharedMarkerStore,
    writer: Mutex<WriterState>,
    write_segment: AtomicU64,
    next_offset: AtomicU64,
    base_offset: u64,
    consumers: RwLock<HashMap<String, ConsumerOffset>>,
    notify: Notify,
    compaction_lock: tokio::sync::Mutex<()>,
    restore_lock: Mutex<()>,
}

impl SegmentStore {
    /// Opens (or creates) `<root>/<queue>/` and recovers the write cursor.
    ///
    /// The writer resumes at the end of the highest raw segment. A torn record
    /// at its tail, left by a crash mid-append, is truncated away.
    pub fn open(
        root: &Path,
        config: QueueConfig,
        markers: SharedMarkerStore,
    ) -> Result<Self, QueueError> {
        let dir = root.join(&config.name);
        fs::create_dir_all(&dir)?;
        let segments = list_segment_files(&dir)?;

        let (segment, position, next_offset) = match segments.iter().next_back() {
            None => (0, 0, 0),
            Some((&highest, files)) if files.raw => {
                let path = raw_path(&dir, highest);
                let file = OpenOptions::new().read(true).write(true).open(&path)?;
                let scan = scan_records(&mut BufReader::new(&file))?;
                if scan.torn {
                    warn!(
                        event = "segment_torn_tail_truncated",
                        queue = %config.name,
                        segment = highest,
                        valid_len = scan.valid_len,
                        "Truncating torn record at end of live segment"
                    );
                    file.set_len(scan.valid_len)?;
                    file.sync_all()?;
                }
                let next_offset = match scan.last_offset {
                    Some(last) => last + 1,
                    None => last_offset_before(&dir, &segments, highest)?.map_or(0, |o| o + 1),
                };
                (highest, scan.valid_len, next_offset)
            }
            // Only a compressed artifact at the top: start a fresh segment after it.
            Some((&highest, _)) => {
                let next_offset = last_offset_before(&dir, &segments, highest + 1)?.map_or(0, |o| o + 1);
                (highest + 1, 0, next_offset)
            }
        };

        let base_offset = match segments.keys().next() {
            Some(&lowest) => first_offset_of(&dir, lowest)?.unwrap_or(next_offset),
            None => next_offset,
        };

        info!(
            event = "queue_opened",
            queue = %config.name,
            segments = segments.len(),
            write_segment = segment,
            next_offset = next_offset,
            "Opened segment store"
        );

        Ok(Self {
            name: config.name.clone(),
            dir,
            config,
            markers,
            writer: Mutex::new(WriterState {
                segment,
                position,
                file: None,
            }),
            write_segment: AtomicU64::new(segment),
            next_offset: AtomicU64::new(next_offset),
            base_offset,
            consumers: RwLock::new(HashMap::new()),
            notify: Notify::new(),
            compaction_lock: tokio::sync::Mutex::new(()),
            restore_lock: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub(crate) fn markers(&self) -> &SharedMarkerStore {
        &self.markers
    }

    pub(crate) fn notify(&self) -> &Notify {
        &self.notify
    }

    pub(crate) fn compaction_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.compaction_lock
    }

    /// Segment number the writer appends to.
    pub fn write_segment(&self) -> u64 {
        self.write_segment.load(Ordering::SeqCst)
    }

    /// Queue offset the next appended message will receive.
    pub fn next_offset(&self) -> u64 {
        self.next_offset.load(Ordering::SeqCst)
    }

    pub fn segment_path(&self, segment: u64) -> PathBuf {
        raw_path(&self.dir, segment)
    }

    pub fn compressed_path(&self, segment: u64) -> PathBuf {
        compressed_path(&self.dir, segment)
    }

    pub fn raw_exists(&self, segment: u64) -> bool {
        self.segment_path(segment).is_file()
    }

    pub fn compressed_exists(&self, segment: u64) -> bool {
        self.compressed_path(segment).is_file()
    }

    pub fn segment_exists(&self, segment: u64) -> bool {
        self.raw_exists(segment) || self.compressed_exists(segment)
    }

    pub fn list_segments(&self) -> Result<BTreeMap<u64, SegmentFiles>, QueueError> {
        Ok(list_segment_files(&self.dir)?)
    }

    /// Appends one message and returns its queue offset.
    ///
    /// The record is written and flushed before waiting consumers are woken.
    pub fn append(&self, payload: &[u8]) -> Result<u64, QueueError> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| QueueError::Poisoned(self.name.clone()))?;

        let offset = self.next_offset.load(Ordering::SeqCst);
        let record = encode_record(offset, payload)?;
        let record_len = record.len() as u64;

        if writer.position > 0 && writer.position + record_len > self.config.max_segment_bytes {
            if let Some(file) = writer.file.take() {
                file.sync_all()?;
            }
            debug!(
                event = "segment_sealed",
                queue = %self.name,
                segment = writer.segment,
                bytes = writer.position,
                "Sealed segment"
            );
            writer.segment += 1;
            writer.position = 0;
            self.write_segment.store(writer.segment, Ordering::SeqCst);
        }

        let segment = writer.segment;
        let position = writer.position;
        let mut file = match writer.file.take() {
            Some(file) => file,
            None => OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.segment_path(segment))?,
        };

        if let Err(err) = file.write_all(&record).and_then(|()| file.flush()) {
            // Drop whatever part of the record made it so the next append starts clean.
            if let Err(trunc_err) = file.set_len(position) {
                warn!(
                    event = "segment_truncate_failed",
                    queue = %self.name,
                    segment = segment,
                    error = %trunc_err,
                    "Failed to drop partial record after write error"
                );
            }
            return Err(err.into());
        }

        writer.file = Some(file);
        writer.position += record_len;
        self.next_offset.store(offset + 1, Ordering::SeqCst);
        drop(writer);

        self.notify.notify_waiters();
        if let Some(metrics) = QUEUE_METRICS.get() {
            metrics
                .messages_appended
                .get_or_create(&QueueLabels::new(&self.name))
                .inc();
        }
        Ok(offset)
    }

    /// Reads the record at `cursor` and returns it with the advanced cursor.
    ///
    /// Moves across segment boundaries and restores a segment from its
    /// compressed artifact when the raw file is gone. `None` means the cursor
    /// is at the end of the log.
    pub fn read_next(
        &self,
        cursor: &ConsumerOffset,
    ) -> Result<Option<(Record, ConsumerOffset)>, QueueError> {
        let mut cursor = *cursor;
        loop {
            let write_segment = self.write_segment();
            if !self.raw_exists(cursor.segment) {
                if self.compressed_exists(cursor.segment) {
                    self.restore_segment(cursor.segment)?;
                } else if cursor.segment < write_segment {
                    warn!(
                        event = "segment_missing",
                        queue = %self.name,
                        segment = cursor.segment,
                        "Segment absent on disk; skipping to the next one"
                    );
                    cursor = next_segment_start(&cursor);
                    continue;
                } else {
                    return Ok(None);
                }
            }

            let mut file = File::open(self.segment_path(cursor.segment))?;
            file.seek(SeekFrom::Start(cursor.position))?;
            match read_record(&mut BufReader::new(file))? {
                ReadOutcome::Record(record) => {
                    if record.offset != cursor.next_offset {
                        return Err(QueueError::Corrupt {
                            queue: self.name.clone(),
                            segment: cursor.segment,
                            detail: format!(
                                "expected offset {} at position {}, found {}",
                                cursor.next_offset, cursor.position, record.offset
                            ),
                        });
                    }
                    let next = ConsumerOffset {
                        segment: cursor.segment,
                        position: cursor.position + record.framed_len(),
                        next_offset: record.offset + 1,
                    };
                    return Ok(Some((record, next)));
                }
                ReadOutcome::End if cursor.segment < write_segment => {
                    cursor = next_segment_start(&cursor);
                }
                ReadOutcome::Torn if cursor.segment < write_segment => {
                    return Err(QueueError::Corrupt {
                        queue: self.name.clone(),
                        segment: cursor.segment,
                        detail: format!("torn record at position {}", cursor.position),
                    });
                }
                ReadOutcome::End | ReadOutcome::Torn => return Ok(None),
            }
        }
    }

    /// Recreates the raw file for `segment` from its compressed artifact.
    ///
    /// Returns `false` when there is nothing to do (raw present or no artifact).
    pub fn restore_segment(&self, segment: u64) -> Result<bool, QueueError> {
        let raw = self.segment_path(segment);
        let compressed = self.compressed_path(segment);
        if raw.is_file() || !compressed.is_file() {
            return Ok(false);
        }

        // Readers and prefetch may race to restore the same segment; they share one temp path.
        let _guard = self
            .restore_lock
            .lock()
            .map_err(|_| QueueError::Poisoned(self.name.clone()))?;
        if raw.is_file() {
            return Ok(false);
        }

        let temp = temp_path(&raw);
        {
            let input = File::open(&compressed)?;
            let mut decoder = zstd::stream::read::Decoder::new(input)?;
            let mut output = BufWriter::new(File::create(&temp)?);
            io::copy(&mut decoder, &mut output)?;
            let file = output.into_inner().map_err(|err| err.into_error())?;
            file.sync_all()?;
        }
        fs::rename(&temp, &raw)?;

        debug!(
            event = "segment_restored",
            queue = %self.name,
            segment = segment,
            "Restored raw segment from compressed artifact"
        );
        Ok(true)
    }

    /// Writes `<n>.zst` for a sealed raw segment and returns its size.
    ///
    /// The artifact is written under a temporary name, fsynced and renamed, so
    /// an existing `<n>.zst` is always complete.
    pub fn compress_segment(&self, segment: u64) -> Result<u64, QueueError> {
        let target = self.compressed_path(segment);
        let temp = temp_path(&target);
        let result = (|| -> io::Result<u64> {
            let mut input = BufReader::new(File::open(self.segment_path(segment))?);
            let output = File::create(&temp)?;
            let mut encoder =
                zstd::stream::write::Encoder::new(output, self.config.compaction.compression_level)?;
            io::copy(&mut input, &mut encoder)?;
            let output = encoder.finish()?;
            output.sync_all()?;
            let size = output.metadata()?.len();
            fs::rename(&temp, &target)?;
            Ok(size)
        })();

        if result.is_err() {
            let _ = fs::remove_file(&temp);
        }
        Ok(result?)
    }

    pub fn remove_raw(&self, segment: u64) -> io::Result<()> {
        fs::remove_file(self.segment_path(segment))
    }

    /// Loads (or initialises) the group's offset and marks the group active.
    ///
    /// A group seen for the first time starts at the oldest segment still on
    /// disk, raw or compressed.
    pub async fn register_consumer(
        self: &Arc<Self>,
        group: &str,
    ) -> Result<QueueConsumer, QueueError> {
        let marker_key = format!("{}/{}", self.name, group);
        let offset = match self.markers.get(OFFSET_NAMESPACE, &marker_key).await? {
            Some(bytes) => serde_json::from_slice::<ConsumerOffset>(&bytes)?,
            None => self.initial_offset()?,
        };

        self.consumers
            .write()
            .map_err(|_| QueueError::Poisoned(self.name.clone()))?
            .insert(group.to_string(), offset);

        info!(
            event = "consumer_registered",
            queue = %self.name,
            group = group,
            segment = offset.segment,
            next_offset = offset.next_offset,
            "Registered consumer group"
        );
        Ok(QueueConsumer::new(
            Arc::clone(self),
            group.to_string(),
            marker_key,
            offset,
        ))
    }

    fn initial_offset(&self) -> Result<ConsumerOffset, QueueError> {
        let segments = self.list_segments()?;
        Ok(match segments.keys().next() {
            Some(&lowest) => ConsumerOffset {
                segment: lowest,
                position: 0,
                next_offset: self.base_offset,
            },
            None => ConsumerOffset {
                segment: self.write_segment(),
                position: 0,
                next_offset: self.next_offset(),
            },
        })
    }

    pub(crate) fn update_consumer(&self, group: &str, offset: ConsumerOffset) {
        match self.consumers.write() {
            Ok(mut consumers) => {
                consumers.insert(group.to_string(), offset);
            }
            Err(_) => warn!(
                event = "consumer_state_poisoned",
                queue = %self.name,
                group = group,
                "Consumer table lock poisoned; offset kept only in the marker store"
            ),
        }
        if let Some(metrics) = QUEUE_METRICS.get() {
            metrics
                .depth
                .get_or_create(&QueueLabels::new(&self.name))
                .set(self.depth() as i64);
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.read().map(|c| c.len()).unwrap_or(0)
    }

    /// Segment of the slowest active consumer group.
    pub fn slowest_consumer_segment(&self) -> Option<u64> {
        self.consumers
            .read()
            .ok()
            .and_then(|c| c.values().map(|offset| offset.segment).min())
    }

    pub fn consumer_offset(&self, group: &str) -> Option<ConsumerOffset> {
        self.consumers
            .read()
            .ok()
            .and_then(|c| c.get(group).copied())
    }

    /// Messages not yet delivered to the slowest active group, or every
    /// retained message when no group is active.
    pub fn depth(&self) -> u64 {
        let next = self.next_offset();
        let floor = self
            .consumers
            .read()
            .ok()
            .and_then(|c| c.values().map(|offset| offset.next_offset).min())
            .unwrap_or(self.base_offset);
        next.saturating_sub(floor)
    }
}

fn next_segment_start(cursor: &ConsumerOffset) -> ConsumerOffset {
    ConsumerOffset {
        segment: cursor.segment + 1,
        position: 0,
        next_offset: cursor.next_offset,
    }
}

fn raw_path(dir: &Path, segment: u64) -> PathBuf {
    dir.join(segment.to_string())
}

fn compressed_path(dir: &Path, segment: u64) -> PathBuf {
    dir.join(format!("{segment}{COMPRESSED_SUFFIX}"))
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

/// Segment numbers found in `dir`. Leftover temp files and foreign names are ignored.
fn list_segment_files(dir: &Path) -> io::Result<BTreeMap<u64, SegmentFiles>> {
    let mut segments: BTreeMap<u64, SegmentFiles> = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if let Some(stem) = name.strip_suffix(COMPRESSED_SUFFIX) {
            if let Ok(segment) = stem.parse::<u64>() {
                segments.entry(segment).or_default().compressed = true;
            }
        } else if let Ok(segment) = name.parse::<u64>() {
            segments.entry(segment).or_default().raw = true;
        }
    }
    Ok(segments)
}

fn open_segment_reader(dir: &Path, segment: u64) -> io::Result<Box<dyn Read>> {
    let raw = raw_path(dir, segment);
    if raw.is_file() {
        return Ok(Box::new(BufReader::new(File::open(raw)?)));
    }
    let decoder = zstd::stream::read::Decoder::new(File::open(compressed_path(dir, segment))?)?;
    Ok(Box::new(decoder))
}

fn first_offset_of(dir: &Path, segment: u64) -> io::Result<Option<u64>> {
    let mut reader = open_segment_reader(dir, segment)?;
    Ok(match read_record(&mut reader)? {
        ReadOutcome::Record(record) => Some(record.offset),
        ReadOutcome::End | ReadOutcome::Torn => None,
    })
}

/// Last queue offset stored in any segment numbered below `segment`.
fn last_offset_before(
    dir: &Path,
    segments: &BTreeMap<u64, SegmentFiles>,
    segment: u64,
) -> io::Result<Option<u64>> {
    for (&candidate, _) in segments.range(..segment).rev() {
        let mut reader = open_segment_reader(dir, candidate)?;
        if let Some(last) = scan_records(&mut reader)?.last_offset {
            return Ok(Some(last));
        }
    }
    Ok(None)
}
